//! Protocol Scenarios
//!
//! End-to-end behaviour of the client against a served or hand-driven peer:
//! slot recycling, capacity negotiation, backpressure, stray responses,
//! timeouts and connection loss.

use rpma_aof_engine::{ClientEngine, IoOutcome, QueueStatus};
use std::time::Duration;

/// Collect outcomes until `count` have been seen or `timeout` elapses per wait.
pub async fn collect(
    client: &mut ClientEngine,
    count: usize,
    timeout: Duration,
) -> rpma_aof_engine::Result<Vec<IoOutcome>> {
    let mut outcomes = Vec::with_capacity(count);
    while outcomes.len() < count {
        let n = client.get_events(1, count - outcomes.len(), timeout).await?;
        if n == 0 {
            break;
        }
        outcomes.extend(client.take_events());
    }
    Ok(outcomes)
}

/// Queue `units` and keep committing and reaping until every one is terminal.
pub async fn run_to_completion(
    client: &mut ClientEngine,
    units: Vec<rpma_aof_engine::IoUnit>,
    timeout: Duration,
) -> rpma_aof_engine::Result<Vec<IoOutcome>> {
    let total = units.len();
    let mut pending = units.into_iter().peekable();
    let mut outcomes = Vec::with_capacity(total);
    while outcomes.len() < total {
        while let Some(io) = pending.peek() {
            match client.queue(*io)? {
                QueueStatus::Queued(_) | QueueStatus::Completed(_) => {
                    pending.next();
                }
                QueueStatus::Busy => break,
            }
        }
        match client.commit() {
            Ok(_) => {}
            Err(e) if e.kind().is_retryable() => {}
            Err(e) => return Err(e),
        }
        if client.get_events(1, total, timeout).await? == 0 {
            break;
        }
        outcomes.extend(client.take_events());
    }
    Ok(outcomes)
}
