//! Queue depth negotiation.
//!
//! Sizes the send, receive and completion queues of a connection from the
//! workload shape and checks the result against what the server advertised.
//! Every posted operation produces exactly one completion, so the completion
//! queue always holds `send_capacity + receive_capacity` entries.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AofError, Result};

/// Server-advertised number of durability requests it can hold at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteCapacity(pub u32);

impl RemoteCapacity {
    /// Raw capacity.
    pub fn get(self) -> u32 {
        self.0
    }
}

/// Send, receive and completion queue capacities of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBudget {
    /// Writes plus durability sends that may be outstanding.
    pub send_capacity: u64,
    /// Receives that may be posted (one per durability acknowledgment).
    pub receive_capacity: u64,
    /// Completion entries; equals `send_capacity + receive_capacity`.
    pub completion_capacity: u64,
}

impl QueueBudget {
    /// Returns true if the completion queue covers every posted operation.
    pub fn is_consistent(&self) -> bool {
        self.completion_capacity == self.send_capacity + self.receive_capacity
    }
}

/// Derive the queue budget for `write_count` writes and
/// `durability_msg_count` durability requests in flight.
pub fn compute_budget(write_count: u32, durability_msg_count: u32) -> QueueBudget {
    let send_capacity = u64::from(write_count) + u64::from(durability_msg_count);
    let receive_capacity = u64::from(durability_msg_count);
    let budget = QueueBudget {
        send_capacity,
        receive_capacity,
        completion_capacity: send_capacity + receive_capacity,
    };
    debug!(
        send = budget.send_capacity,
        recv = budget.receive_capacity,
        cq = budget.completion_capacity,
        "computed queue budget"
    );
    budget
}

/// Budget of the server side: one receive and one response send per
/// durability request it accepts. Writes are passive and cost nothing.
pub fn server_budget(capacity: RemoteCapacity) -> QueueBudget {
    compute_budget(0, capacity.get())
}

/// Reject a budget that would let the client overrun the server's receive queue.
///
/// Must run before the connection carries any I/O.
pub fn validate_against_remote(budget: QueueBudget, remote: RemoteCapacity) -> Result<()> {
    if budget.receive_capacity > u64::from(remote.get()) {
        warn!(
            requested = budget.receive_capacity,
            remote = remote.get(),
            "durability demand exceeds remote capacity"
        );
        return Err(AofError::CapacityTooSmall {
            requested: u32::try_from(budget.receive_capacity).unwrap_or(u32::MAX),
            remote: remote.get(),
        });
    }
    Ok(())
}
