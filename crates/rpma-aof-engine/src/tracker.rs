//! Request lifecycle tracking.
//!
//! Every caller I/O unit becomes an [`InFlightRequest`] keyed by a
//! correlation id that is unique among the requests alive on a connection.
//! Transport completions and server acknowledgments enter through
//! [`RequestTracker::on_transport_event`], the single place where they are
//! demultiplexed back to requests.
//!
//! A request that reaches a terminal state keeps its buffer slot until every
//! operation it posted has produced its completion and, once its flush message
//! has been sent, until the server has answered it; only then is the slot
//! handed back to the pool. This holds for timeouts too: a timed-out request
//! is reported to the caller immediately, but it keeps counting against the
//! durability limit until the late response arrives or the connection drops.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AofError, Result};
use crate::pool::{MessageBufferPool, SlotHandle};
use crate::transport::CompletionStatus;
use crate::wire::{FlushStatus, MAX_CORRELATION_ID};

/// Lifecycle state of an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// Submitted, not yet posted.
    Queued,
    /// The RDMA write is posted.
    WritePosted,
    /// The flush message is posted as well (durable requests only).
    DurabilityRequested,
    /// Outcome confirmed.
    Completed,
    /// Outcome is an error.
    Failed,
}

impl RequestState {
    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

/// Whether a write waits for remote durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Complete once the write's local completion is observed.
    FireAndForget,
    /// Complete once the server acknowledges a flush of the range.
    Durable,
}

/// One caller I/O unit: copy `len` bytes at `src_offset` of the local data
/// region to `offset` of the remote workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoUnit {
    /// Opaque caller tag, returned in the outcome.
    pub tag: u64,
    /// Workspace offset.
    pub offset: u64,
    /// Bytes to write.
    pub len: u64,
    /// Offset of the data in the local data region.
    pub src_offset: u64,
    /// Durability mode.
    pub mode: WriteMode,
}

impl IoUnit {
    /// Fire-and-forget write sourced from the start of the data region.
    pub fn write(tag: u64, offset: u64, len: u64) -> Self {
        Self {
            tag,
            offset,
            len,
            src_offset: 0,
            mode: WriteMode::FireAndForget,
        }
    }

    /// Durable write sourced from the start of the data region.
    pub fn durable(tag: u64, offset: u64, len: u64) -> Self {
        Self {
            mode: WriteMode::Durable,
            ..Self::write(tag, offset, len)
        }
    }

    /// Take the data from `src_offset` of the local data region instead.
    pub fn with_source(mut self, src_offset: u64) -> Self {
        self.src_offset = src_offset;
        self
    }

    /// Returns true for durable writes.
    pub fn is_durable(&self) -> bool {
        self.mode == WriteMode::Durable
    }
}

/// Caller-visible result of a terminal request.
#[derive(Debug)]
pub struct IoOutcome {
    /// Caller tag from the [`IoUnit`].
    pub tag: u64,
    /// Correlation id assigned on submission.
    pub correlation_id: u64,
    /// Workspace offset.
    pub offset: u64,
    /// Length written.
    pub len: u64,
    /// Durability mode.
    pub mode: WriteMode,
    /// `Ok` when completed, the failure otherwise.
    pub result: std::result::Result<(), AofError>,
    /// Time from submission to finalization.
    pub latency: Duration,
}

impl IoOutcome {
    /// Returns true if the request completed.
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Human-readable failure description, if the request failed.
    pub fn error_details(&self) -> Option<String> {
        self.result
            .as_ref()
            .err()
            .map(|e| format!("request {} (tag {}): {}", self.correlation_id, self.tag, e))
    }
}

/// Input to the tracker's state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// The request's RDMA write completed.
    WriteCompleted {
        /// Request the write belongs to.
        correlation_id: u64,
        /// Completion status.
        status: CompletionStatus,
    },
    /// The request's flush message send completed.
    FlushSent {
        /// Request the send belongs to.
        correlation_id: u64,
        /// Completion status.
        status: CompletionStatus,
    },
    /// The server answered a flush request.
    Acknowledged {
        /// Id echoed by the server.
        correlation_id: u64,
        /// Server-side outcome.
        status: FlushStatus,
    },
    /// The connection is gone.
    ConnectionLost {
        /// Diagnostic.
        reason: String,
    },
}

/// Tracker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStats {
    /// Requests submitted.
    pub submitted: u64,
    /// Requests that reached `Completed`.
    pub completed: u64,
    /// Requests that reached `Failed`.
    pub failed: u64,
    /// Failures caused by the response timeout.
    pub timeouts: u64,
    /// Events that named no live request.
    pub correlation_mismatches: u64,
}

/// Tracking record of one caller operation.
#[derive(Debug)]
pub struct InFlightRequest {
    io: IoUnit,
    state: RequestState,
    outstanding_ops: u32,
    acked: bool,
    /// The flush message reached the wire and its response has not arrived.
    /// The server holds one of its receives for it until then.
    awaiting_response: bool,
    slot: Option<SlotHandle>,
    error: Option<AofError>,
    submitted_at: Instant,
    posted_at: Option<Instant>,
    reported: bool,
}

impl InFlightRequest {
    /// Current state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// The submitted unit.
    pub fn io(&self) -> &IoUnit {
        &self.io
    }

    /// Posted operations whose completions have not been seen yet.
    pub fn outstanding_ops(&self) -> u32 {
        self.outstanding_ops
    }

    /// Whether a buffer slot is held.
    pub fn holds_slot(&self) -> bool {
        self.slot.is_some()
    }

    /// Whether the server still owes a response for this request.
    pub fn awaiting_response(&self) -> bool {
        self.awaiting_response
    }
}

/// Per-connection request state machine.
pub struct RequestTracker {
    pool: Arc<MessageBufferPool>,
    requests: HashMap<u64, InFlightRequest>,
    queued: VecDeque<u64>,
    finalized: VecDeque<u64>,
    next_id: u64,
    stats: TrackerStats,
}

impl RequestTracker {
    /// Create a tracker that returns slots to `pool`.
    pub fn new(pool: Arc<MessageBufferPool>) -> Self {
        Self {
            pool,
            requests: HashMap::new(),
            queued: VecDeque::new(),
            finalized: VecDeque::new(),
            next_id: 1,
            stats: TrackerStats::default(),
        }
    }

    /// Register a new request in `Queued` and return its correlation id.
    pub fn submit(&mut self, io: IoUnit) -> u64 {
        let id = self.allocate_id();
        self.requests.insert(
            id,
            InFlightRequest {
                io,
                state: RequestState::Queued,
                outstanding_ops: 0,
                acked: false,
                awaiting_response: false,
                slot: None,
                error: None,
                submitted_at: Instant::now(),
                posted_at: None,
                reported: false,
            },
        );
        self.queued.push_back(id);
        self.stats.submitted += 1;
        debug!(correlation_id = id, offset = io.offset, len = io.len, mode = ?io.mode, "request queued");
        id
    }

    fn allocate_id(&mut self) -> u64 {
        loop {
            let id = self.next_id;
            self.next_id = if id >= MAX_CORRELATION_ID { 1 } else { id + 1 };
            if !self.requests.contains_key(&id) {
                return id;
            }
        }
    }

    /// Oldest request still waiting to be posted.
    pub fn next_queued(&self) -> Option<(u64, IoUnit)> {
        let id = *self.queued.front()?;
        self.requests.get(&id).map(|r| (id, r.io))
    }

    fn take_from_queue(&mut self, id: u64) {
        if self.queued.front() == Some(&id) {
            self.queued.pop_front();
        } else {
            self.queued.retain(|q| *q != id);
        }
    }

    /// The request's write is posted; it now owns `slot`.
    pub fn on_write_posted(&mut self, id: u64, slot: SlotHandle) -> Result<()> {
        self.take_from_queue(id);
        let Some(req) = self.requests.get_mut(&id) else {
            self.pool.release(slot)?;
            return Err(AofError::CorrelationMismatch { correlation_id: id });
        };
        req.state = RequestState::WritePosted;
        req.outstanding_ops += 1;
        req.slot = Some(slot);
        req.posted_at = Some(Instant::now());
        debug!(correlation_id = id, "write posted");
        Ok(())
    }

    /// The request's flush message is posted.
    pub fn on_flush_posted(&mut self, id: u64) -> Result<()> {
        let req = self
            .requests
            .get_mut(&id)
            .ok_or(AofError::CorrelationMismatch { correlation_id: id })?;
        if req.state == RequestState::WritePosted {
            req.state = RequestState::DurabilityRequested;
            req.outstanding_ops += 1;
            req.awaiting_response = true;
            debug!(correlation_id = id, "durability requested");
        }
        Ok(())
    }

    /// A post for the request was rejected. `slot` is the slot acquired for it,
    /// if the write itself never made it onto the wire.
    pub fn on_post_failed(&mut self, id: u64, slot: Option<SlotHandle>, error: AofError) -> Result<()> {
        self.take_from_queue(id);
        let Some(req) = self.requests.get_mut(&id) else {
            if let Some(slot) = slot {
                self.pool.release(slot)?;
            }
            return Err(AofError::CorrelationMismatch { correlation_id: id });
        };
        if let Some(slot) = slot {
            req.slot = Some(slot);
        }
        self.fail(id, error)
    }

    /// Feed one transport event. Advances at most one request.
    ///
    /// Events naming no live request are counted, logged and returned as
    /// [`AofError::CorrelationMismatch`]; other requests are unaffected.
    pub fn on_transport_event(&mut self, event: TrackerEvent) -> Result<()> {
        match event {
            TrackerEvent::WriteCompleted {
                correlation_id,
                status,
            } => self.on_local_completion(correlation_id, status),
            TrackerEvent::FlushSent {
                correlation_id,
                status,
            } => {
                if !status.is_success() {
                    // The message never reached the server.
                    if let Some(req) = self.requests.get_mut(&correlation_id) {
                        req.awaiting_response = false;
                    }
                }
                self.on_local_completion(correlation_id, status)
            }
            TrackerEvent::Acknowledged {
                correlation_id,
                status,
            } => self.on_acknowledged(correlation_id, status),
            TrackerEvent::ConnectionLost { reason } => {
                self.fail_all(&reason);
                Ok(())
            }
        }
    }

    fn mismatch(&mut self, correlation_id: u64) -> AofError {
        self.stats.correlation_mismatches += 1;
        warn!(correlation_id, "event for unknown request discarded");
        AofError::CorrelationMismatch { correlation_id }
    }

    fn on_local_completion(&mut self, id: u64, status: CompletionStatus) -> Result<()> {
        let Some(req) = self.requests.get_mut(&id) else {
            return Err(self.mismatch(id));
        };
        if req.outstanding_ops == 0 {
            return Err(self.mismatch(id));
        }
        req.outstanding_ops -= 1;

        if req.state.is_terminal() {
            return self.reclaim_if_drained(id);
        }
        if !status.is_success() {
            return self.fail(
                id,
                AofError::TransportError {
                    correlation_id: id,
                    status,
                },
            );
        }
        let done = match req.io.mode {
            WriteMode::FireAndForget => true,
            WriteMode::Durable => req.acked && req.outstanding_ops == 0,
        };
        if done {
            self.finalize(id, None)
        } else {
            Ok(())
        }
    }

    fn on_acknowledged(&mut self, id: u64, status: FlushStatus) -> Result<()> {
        let Some(req) = self.requests.get_mut(&id) else {
            return Err(self.mismatch(id));
        };
        if req.state == RequestState::Failed {
            if !req.awaiting_response {
                return Err(self.mismatch(id));
            }
            req.awaiting_response = false;
            debug!(correlation_id = id, "late acknowledgment for failed request");
            return self.reclaim_if_drained(id);
        }
        if req.state != RequestState::DurabilityRequested || req.acked {
            return Err(self.mismatch(id));
        }
        req.acked = true;
        req.awaiting_response = false;
        match status {
            FlushStatus::Success if req.outstanding_ops == 0 => self.finalize(id, None),
            FlushStatus::Success => Ok(()),
            FlushStatus::RangeOutOfBounds => self.fail(
                id,
                AofError::invalid_request(format!("server rejected range of request {id}")),
            ),
            FlushStatus::PersistFailed => self.fail(
                id,
                AofError::TransportError {
                    correlation_id: id,
                    status: CompletionStatus::RemoteError,
                },
            ),
        }
    }

    /// Move a non-terminal request to `Failed`.
    pub fn fail(&mut self, id: u64, error: AofError) -> Result<()> {
        match self.requests.get(&id) {
            Some(req) if req.state.is_terminal() => Ok(()),
            Some(_) => self.finalize(id, Some(error)),
            None => Err(AofError::CorrelationMismatch { correlation_id: id }),
        }
    }

    fn finalize(&mut self, id: u64, error: Option<AofError>) -> Result<()> {
        let Some(req) = self.requests.get_mut(&id) else {
            return Err(AofError::CorrelationMismatch { correlation_id: id });
        };
        match error {
            None => {
                req.state = RequestState::Completed;
                self.stats.completed += 1;
                debug!(correlation_id = id, "request completed");
            }
            Some(e) => {
                req.state = RequestState::Failed;
                self.stats.failed += 1;
                if matches!(e, AofError::Timeout { .. }) {
                    self.stats.timeouts += 1;
                }
                debug!(correlation_id = id, error = %e, "request failed");
                req.error = Some(e);
            }
        }
        self.queued.retain(|q| *q != id);
        self.finalized.push_back(id);
        self.reclaim_if_drained(id)
    }

    /// Return the slot once nothing posted for the request is outstanding and
    /// no response is owed, and forget the request once the caller has also
    /// seen its outcome.
    fn reclaim_if_drained(&mut self, id: u64) -> Result<()> {
        let Some(req) = self.requests.get_mut(&id) else {
            return Ok(());
        };
        if !req.state.is_terminal() || req.outstanding_ops > 0 || req.awaiting_response {
            return Ok(());
        }
        let slot = req.slot.take();
        let forget = req.reported;
        if forget {
            self.requests.remove(&id);
        }
        if let Some(slot) = slot {
            self.pool.release(slot)?;
        }
        Ok(())
    }

    /// Fail every posted request that has waited longer than `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let expired: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, r)| !r.state.is_terminal())
            .filter(|(_, r)| {
                r.posted_at
                    .map(|at| now.saturating_duration_since(at) >= timeout)
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            warn!(correlation_id = id, timeout_ms = timeout.as_millis() as u64, "request timed out");
            // Ids come from the live map, so this cannot mismatch.
            let _ = self.fail(
                *id,
                AofError::Timeout {
                    correlation_id: *id,
                    timeout_ms: timeout.as_millis() as u64,
                },
            );
        }
        expired.len()
    }

    /// Fail every non-terminal request with `ConnectionLost`.
    ///
    /// Completions for work posted on a lost connection are never reaped, so
    /// every slot is returned here.
    pub fn fail_all(&mut self, reason: &str) {
        let mut ids: Vec<u64> = self.requests.keys().copied().collect();
        ids.sort_unstable();
        let mut failed = 0;
        for id in ids {
            let live = self
                .requests
                .get(&id)
                .map(|r| !r.state.is_terminal())
                .unwrap_or(false);
            if live {
                failed += 1;
                let _ = self.fail(
                    id,
                    AofError::ConnectionLost {
                        reason: reason.to_string(),
                    },
                );
            }
            if let Some(req) = self.requests.get_mut(&id) {
                req.outstanding_ops = 0;
                req.awaiting_response = false;
            }
            if let Err(e) = self.reclaim_if_drained(id) {
                warn!(correlation_id = id, error = %e, "slot release failed");
            }
        }
        self.queued.clear();
        if failed > 0 {
            warn!(failed, reason, "connection lost, in-flight requests failed");
        }
    }

    /// Number of terminal requests not yet drained.
    pub fn ready(&self) -> usize {
        self.finalized.len()
    }

    /// Take up to `max` outcomes in finalization order.
    pub fn drain(&mut self, max: usize) -> Vec<IoOutcome> {
        let n = max.min(self.finalized.len());
        let ids: Vec<u64> = self.finalized.drain(..n).collect();
        let mut outcomes = Vec::with_capacity(n);
        for id in ids {
            let Some(req) = self.requests.get_mut(&id) else {
                continue;
            };
            req.reported = true;
            let result = match req.error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            };
            outcomes.push(IoOutcome {
                tag: req.io.tag,
                correlation_id: id,
                offset: req.io.offset,
                len: req.io.len,
                mode: req.io.mode,
                result,
                latency: req.submitted_at.elapsed(),
            });
            if req.outstanding_ops == 0 && !req.awaiting_response && req.slot.is_none() {
                self.requests.remove(&id);
            }
        }
        outcomes
    }

    /// Look up a live request.
    pub fn get(&self, id: u64) -> Option<&InFlightRequest> {
        self.requests.get(&id)
    }

    /// State of a live request.
    pub fn state(&self, id: u64) -> Option<RequestState> {
        self.requests.get(&id).map(|r| r.state)
    }

    /// Requests not yet terminal.
    pub fn outstanding(&self) -> usize {
        self.requests.values().filter(|r| !r.state.is_terminal()).count()
    }

    /// Durable requests that may still occupy a server receive: those not yet
    /// terminal, plus failed ones whose flush is still unanswered.
    pub fn durable_outstanding(&self) -> usize {
        self.requests
            .values()
            .filter(|r| r.io.is_durable())
            .filter(|r| !r.state.is_terminal() || r.awaiting_response)
            .count()
    }

    /// Requests waiting for commit.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Requests still tracked, including terminal ones holding a slot.
    pub fn tracked(&self) -> usize {
        self.requests.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TrackerStats {
        self.stats.clone()
    }
}
