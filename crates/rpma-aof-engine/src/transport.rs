//! Transport abstraction consumed by the protocol engines.
//!
//! This module defines the [`Connection`] trait: the narrow surface of an
//! established RDMA channel that the engines need to register memory, post
//! work requests and reap completions. Connection establishment itself lives
//! outside the protocol core; see [`crate::loopback`] for the in-process
//! implementation used by tests and the bench driver.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Memory region access permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    /// Local reads (source of sends and writes).
    pub const LOCAL_READ: Self = Self(1);
    /// Local writes (target of receives).
    pub const LOCAL_WRITE: Self = Self(2);
    /// Remote peers may read.
    pub const REMOTE_READ: Self = Self(4);
    /// Remote peers may write.
    pub const REMOTE_WRITE: Self = Self(8);
    /// Send/receive messaging buffers.
    pub const MESSAGING: Self = Self(1 | 2);
    /// Every permission.
    pub const ALL: Self = Self(0xF);

    /// Returns true if all bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// No permissions.
    pub fn empty() -> Self {
        Self(0)
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Handle to a locally registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalRegion {
    /// Registration id, unique per connection.
    pub id: u64,
    /// Region length in bytes.
    pub len: u64,
    /// Remote key a peer uses to address this region.
    pub rkey: u32,
}

impl LocalRegion {
    /// Descriptor a peer needs to target this region with RDMA writes.
    pub fn remote(&self) -> RemoteRegion {
        RemoteRegion {
            rkey: self.rkey,
            len: self.len,
        }
    }
}

/// A peer's region as seen from this side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRegion {
    /// Remote key.
    pub rkey: u32,
    /// Region length in bytes.
    pub len: u64,
}

/// Kind of work request a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrOpcode {
    /// Two-sided send.
    Send,
    /// Posted receive consumed by an incoming send.
    Recv,
    /// One-sided RDMA write.
    RdmaWrite,
}

/// Outcome reported by a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    /// Operation finished.
    Success,
    /// Local protection, length or queue error.
    LocalError,
    /// Remote side rejected the operation.
    RemoteError,
    /// Connection was torn down while the request was outstanding.
    Flushed,
}

impl CompletionStatus {
    /// Returns true for [`CompletionStatus::Success`].
    pub fn is_success(self) -> bool {
        self == CompletionStatus::Success
    }
}

/// A reaped completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    /// Work request id supplied when the operation was posted.
    pub wr_id: u64,
    /// Operation kind.
    pub opcode: WrOpcode,
    /// Outcome.
    pub status: CompletionStatus,
    /// Bytes transferred (received length for receives).
    pub byte_len: u32,
}

/// An established RDMA channel between one client and one server.
///
/// All posting methods are non-blocking; they fail when the transport cannot
/// accept the work request (queue full, bad region, disconnected).
#[async_trait]
pub trait Connection: Send + Sync {
    /// Register `len` bytes of zeroed memory with the given permissions.
    fn register_region(&self, len: u64, access: AccessFlags) -> Result<LocalRegion>;

    /// Release a registration. Must be called exactly once per region.
    fn deregister_region(&self, region: &LocalRegion) -> Result<()>;

    /// Copy bytes out of a registered region.
    fn read_region(&self, region: &LocalRegion, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Copy bytes into a registered region.
    fn write_region(&self, region: &LocalRegion, offset: u64, data: &[u8]) -> Result<()>;

    /// Post an RDMA write of `len` bytes from `src` into the peer's `dst`.
    fn post_write(
        &self,
        wr_id: u64,
        src: &LocalRegion,
        src_offset: u64,
        dst: &RemoteRegion,
        dst_offset: u64,
        len: u64,
    ) -> Result<()>;

    /// Post a send of `len` bytes starting at `offset` within `src`.
    fn post_send(&self, wr_id: u64, src: &LocalRegion, offset: u64, len: u64) -> Result<()>;

    /// Post a receive buffer of `len` bytes at `offset` within `dst`.
    fn post_receive(&self, wr_id: u64, dst: &LocalRegion, offset: u64, len: u64) -> Result<()>;

    /// Reap up to `max` completions without blocking.
    fn poll_completions(&self, max: usize) -> Result<Vec<CompletionEvent>>;

    /// Wait until a completion may be available or `timeout` elapses.
    ///
    /// Returns false on timeout. Spurious wakeups are allowed.
    async fn wait_for_completions(&self, timeout: Duration) -> bool;

    /// Whether the channel is still usable.
    fn is_connected(&self) -> bool;

    /// Tear the channel down. Outstanding work completes as [`CompletionStatus::Flushed`].
    fn disconnect(&self) -> Result<()>;
}
