#![warn(missing_docs)]

//! RPMA AOF: append-only write+flush protocol core over RDMA
//!
//! A client writes byte ranges straight into a server's persistent workspace
//! with one-sided RDMA writes and, when durability is requested, sends a
//! flush message the server acknowledges once the range is persisted. This
//! crate holds both protocol engines, the queue budget negotiation, the
//! message buffer pool and the request lifecycle tracker, plus an in-process
//! loopback fabric to run the whole protocol without RDMA hardware.

pub mod budget;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod pmem;
pub mod pool;
pub mod server;
pub mod tracker;
pub mod transport;
pub mod wire;

pub use budget::{compute_budget, server_budget, validate_against_remote, QueueBudget, RemoteCapacity};
pub use client::{ClientEngine, ClientStats, QueueStatus};
pub use config::{ClientConfig, EngineConfig, EngineKind, ServerConfig};
pub use engine::{open, EngineResources, IoEngine};
pub use error::{AofError, ErrorKind, Resource, Result};
pub use loopback::{Fault, FabricStats, LoopbackConfig, LoopbackEndpoint, LoopbackFabric};
pub use pmem::{FilePmem, PersistentMemory, RecordingPmem};
pub use pool::{MessageBufferPool, PoolStats, SlotHandle};
pub use server::{ServerEngine, ServerStats};
pub use tracker::{IoOutcome, IoUnit, RequestState, RequestTracker, TrackerEvent, TrackerStats, WriteMode};
pub use transport::{AccessFlags, CompletionEvent, CompletionStatus, Connection, LocalRegion, RemoteRegion, WrOpcode};
pub use wire::{FlushRequest, FlushResponse, FlushStatus, Message, ServerWorkspace, IO_U_BUF_LEN, MAX_MSG_SIZE};
