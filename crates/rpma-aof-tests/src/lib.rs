//! RPMA AOF Test & Validation Infrastructure
//!
//! Loopback client/server harnesses, end-to-end protocol scenarios and
//! property-based tests for the append-only write+flush protocol.

pub mod harness;
pub mod proptest_protocol;
pub mod scenarios;

pub use harness::{init_tracing, small_config, HarnessError, ManualPeer, ServedPair};
pub use proptest_protocol::{step_strategy, Step};
pub use scenarios::{collect, run_to_completion};
