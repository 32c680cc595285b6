//! Property-Based Tests for the write+flush protocol
//!
//! Random interleavings of queue, commit, acknowledgment and reaping against a
//! hand-driven peer. Buffer slots are conserved and every submitted request
//! is reported exactly once.

use proptest::prelude::*;

/// One step of a randomized client/peer interleaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Queue { durable: bool, len: u64 },
    Commit,
    Answer,
    Reap,
}

pub fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (any::<bool>(), 1u64..=512).prop_map(|(durable, len)| Step::Queue { durable, len }),
        2 => Just(Step::Commit),
        2 => Just(Step::Answer),
        2 => Just(Step::Reap),
    ]
}
