//! Client protocol engine.
//!
//! Drives the write+flush sequence over one [`Connection`]. Requests are
//! queued without touching the transport, posted in submission order by
//! [`ClientEngine::commit`], and turned into caller-visible outcomes by
//! [`ClientEngine::get_events`], which is the only call that waits.
//!
//! For a durable request the RDMA write and the flush message are posted back
//! to back; the flush cannot overtake the write on a reliable connection, so
//! the server's flush observes the written bytes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::budget::{compute_budget, validate_against_remote, QueueBudget};
use crate::config::ClientConfig;
use crate::error::{AofError, ErrorKind, Resource, Result};
use crate::pool::MessageBufferPool;
use crate::tracker::{IoOutcome, IoUnit, RequestTracker, TrackerEvent, TrackerStats};
use crate::transport::{AccessFlags, CompletionEvent, CompletionStatus, Connection, LocalRegion};
use crate::wire::{FlushRequest, Message, ServerWorkspace, WorkRequest, MAX_MSG_SIZE};

/// Result of [`ClientEngine::queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Accepted; posted on the next commit.
    Queued(u64),
    /// The budget is used up; drain completions and retry.
    Busy,
    /// Already terminal (synchronous mode); the outcome is `event(0)`.
    Completed(u64),
}

/// Client counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    /// Request lifecycle counters.
    pub requests: TrackerStats,
    /// RDMA writes posted.
    pub writes_posted: u64,
    /// Flush messages posted.
    pub flushes_posted: u64,
    /// Bytes handed to posted writes.
    pub bytes_posted: u64,
    /// `queue` calls answered with `Busy`.
    pub busy: u64,
    /// `commit` calls stopped by an exhausted resource.
    pub exhausted_commits: u64,
    /// Received messages that failed to decode or were not responses.
    pub malformed_messages: u64,
    /// Receives re-posted after a message was consumed.
    pub receives_reposted: u64,
}

/// Client half of the protocol.
pub struct ClientEngine {
    conn: Arc<dyn Connection>,
    config: ClientConfig,
    workspace: ServerWorkspace,
    budget: QueueBudget,
    pool: Arc<MessageBufferPool>,
    data_region: LocalRegion,
    tracker: RequestTracker,
    events: Vec<IoOutcome>,
    sends_outstanding: u64,
    connected: bool,
    cleaned_up: bool,
    stats: ClientStats,
}

impl ClientEngine {
    /// Set up the client on an established connection.
    ///
    /// The queue budget is validated against the server's advertised
    /// capacity before anything is registered or posted.
    pub fn connect(
        conn: Arc<dyn Connection>,
        workspace: ServerWorkspace,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let budget = compute_budget(config.max_outstanding_writes, config.durability_msg_count);
        validate_against_remote(budget, workspace.max_msg_num)?;

        let pool = Arc::new(MessageBufferPool::new(
            Arc::clone(&conn),
            config.msg_num as usize,
        )?);
        let data_region = conn.register_region(
            config.data_region_size,
            AccessFlags::LOCAL_READ | AccessFlags::LOCAL_WRITE,
        )?;

        let engine = Self {
            tracker: RequestTracker::new(Arc::clone(&pool)),
            conn,
            config,
            workspace,
            budget,
            pool,
            data_region,
            events: Vec::new(),
            sends_outstanding: 0,
            connected: true,
            cleaned_up: false,
            stats: ClientStats::default(),
        };
        for slot in 0..engine.config.durability_msg_count as usize {
            engine.post_receive(slot)?;
        }
        info!(
            msg_num = engine.config.msg_num,
            iodepth = engine.config.max_outstanding_writes,
            durability = engine.config.durability_msg_count,
            remote_capacity = workspace.max_msg_num.get(),
            workspace_size = workspace.size,
            "client engine connected"
        );
        Ok(engine)
    }

    fn post_receive(&self, slot: usize) -> Result<()> {
        let offset = self.pool.recv_offset(slot).ok_or_else(|| {
            AofError::invalid_config(format!("receive slot {slot} outside pool"))
        })?;
        let (_, region) = self.pool.base_address_and_registration();
        self.conn.post_receive(
            WorkRequest::Recv(slot).encode(),
            &region,
            offset,
            MAX_MSG_SIZE as u64,
        )
    }

    /// Accept an I/O unit for the next commit, or report `Busy`.
    pub fn queue(&mut self, io: IoUnit) -> Result<QueueStatus> {
        self.ensure_usable()?;
        self.validate_io(&io)?;
        if self.tracker.outstanding() >= self.config.max_outstanding_writes as usize
            || (io.is_durable()
                && self.tracker.durable_outstanding() >= self.config.durability_msg_count as usize)
        {
            self.stats.busy += 1;
            debug!(tag = io.tag, "queue busy");
            return Ok(QueueStatus::Busy);
        }
        Ok(QueueStatus::Queued(self.tracker.submit(io)))
    }

    fn ensure_usable(&self) -> Result<()> {
        if !self.connected || self.cleaned_up {
            return Err(AofError::ConnectionLost {
                reason: "client engine is disconnected".to_string(),
            });
        }
        Ok(())
    }

    fn validate_io(&self, io: &IoUnit) -> Result<()> {
        if io.len == 0 {
            return Err(AofError::invalid_request("zero-length write"));
        }
        let dst_end = io.offset.checked_add(io.len);
        if dst_end.map_or(true, |end| end > self.workspace.size) {
            return Err(AofError::invalid_request(format!(
                "write {}+{} exceeds workspace of {} bytes",
                io.offset, io.len, self.workspace.size
            )));
        }
        let src_end = io.src_offset.checked_add(io.len);
        if src_end.map_or(true, |end| end > self.data_region.len) {
            return Err(AofError::invalid_request(format!(
                "source {}+{} exceeds data region of {} bytes",
                io.src_offset, io.len, self.data_region.len
            )));
        }
        if io.is_durable() && self.config.durability_msg_count == 0 {
            // No receive ring, so no response could ever be delivered.
            return Err(AofError::invalid_request(
                "durable write with durability_msg_count = 0",
            ));
        }
        Ok(())
    }

    /// Post every queued request in submission order.
    ///
    /// Returns the number posted. Stops with [`AofError::Exhausted`] when the
    /// send queue or the buffer slots run out; the rest stay queued for the
    /// next commit. Post failures do not abort the commit: the request fails
    /// and its error is reported by the next `get_events`.
    pub fn commit(&mut self) -> Result<usize> {
        self.ensure_usable()?;
        let mut posted = 0;
        while let Some((id, io)) = self.tracker.next_queued() {
            let ops = if io.is_durable() { 2 } else { 1 };
            if self.sends_outstanding + ops > self.budget.send_capacity {
                self.stats.exhausted_commits += 1;
                debug!(correlation_id = id, "send queue exhausted, commit stopped");
                return Err(AofError::Exhausted {
                    resource: Resource::SendQueue,
                });
            }
            let slot = match self.pool.acquire_slot() {
                Ok(slot) => slot,
                Err(e) => {
                    self.stats.exhausted_commits += 1;
                    debug!(correlation_id = id, "buffer slots exhausted, commit stopped");
                    return Err(e);
                }
            };

            let flush = if io.is_durable() {
                let msg = Message::FlushRequest(FlushRequest {
                    correlation_id: id,
                    offset: io.offset,
                    len: io.len,
                });
                match msg.encode().and_then(|bytes| self.pool.write_message(&slot, &bytes)) {
                    Ok(range) => Some(range),
                    Err(e) => {
                        self.tracker.on_post_failed(id, Some(slot), e)?;
                        continue;
                    }
                }
            } else {
                None
            };

            if let Err(e) = self.conn.post_write(
                WorkRequest::Write(id).encode(),
                &self.data_region,
                io.src_offset,
                &self.workspace.region,
                io.offset,
                io.len,
            ) {
                warn!(correlation_id = id, error = %e, "write post failed");
                self.tracker.on_post_failed(
                    id,
                    Some(slot),
                    AofError::PostFailure {
                        correlation_id: id,
                        reason: e.to_string(),
                    },
                )?;
                continue;
            }
            self.sends_outstanding += 1;
            self.stats.writes_posted += 1;
            self.stats.bytes_posted += io.len;
            self.tracker.on_write_posted(id, slot)?;
            posted += 1;

            if let Some((offset, len)) = flush {
                let (_, region) = self.pool.base_address_and_registration();
                match self
                    .conn
                    .post_send(WorkRequest::FlushSend(id).encode(), &region, offset, len)
                {
                    Ok(()) => {
                        self.sends_outstanding += 1;
                        self.stats.flushes_posted += 1;
                        self.tracker.on_flush_posted(id)?;
                    }
                    Err(e) => {
                        warn!(correlation_id = id, error = %e, "flush post failed");
                        self.tracker.fail(
                            id,
                            AofError::PostFailure {
                                correlation_id: id,
                                reason: e.to_string(),
                            },
                        )?;
                    }
                }
            }
        }
        Ok(posted)
    }

    /// Reap completions and feed them to the tracker. Returns the number reaped.
    pub fn process_completions(&mut self) -> Result<usize> {
        if !self.connected {
            return Ok(0);
        }
        let max = self.budget.completion_capacity.max(1) as usize;
        let events = match self.conn.poll_completions(max) {
            Ok(events) => events,
            Err(AofError::ConnectionLost { reason }) => {
                self.on_connection_lost(&reason);
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        let reaped = events.len();
        for event in events {
            if !self.connected {
                break;
            }
            self.handle_completion(event)?;
        }
        Ok(reaped)
    }

    fn handle_completion(&mut self, event: CompletionEvent) -> Result<()> {
        let tracker_event = match WorkRequest::decode(event.wr_id) {
            WorkRequest::Write(correlation_id) => {
                self.sends_outstanding = self.sends_outstanding.saturating_sub(1);
                TrackerEvent::WriteCompleted {
                    correlation_id,
                    status: event.status,
                }
            }
            WorkRequest::FlushSend(correlation_id) => {
                self.sends_outstanding = self.sends_outstanding.saturating_sub(1);
                TrackerEvent::FlushSent {
                    correlation_id,
                    status: event.status,
                }
            }
            WorkRequest::Recv(slot) => match self.on_receive(slot, &event)? {
                Some(TrackerEvent::ConnectionLost { reason }) => {
                    self.on_connection_lost(&reason);
                    return Ok(());
                }
                Some(event) => event,
                None => return Ok(()),
            },
            WorkRequest::Response(_) => {
                warn!(wr_id = event.wr_id, "unexpected completion kind on client");
                return Ok(());
            }
        };
        match self.tracker.on_transport_event(tracker_event) {
            Err(e) if e.kind() == ErrorKind::CorrelationMismatch => Ok(()),
            other => other,
        }
    }

    fn on_receive(&mut self, slot: usize, event: &CompletionEvent) -> Result<Option<TrackerEvent>> {
        if event.status == CompletionStatus::Flushed || !self.conn.is_connected() {
            return Ok(Some(TrackerEvent::ConnectionLost {
                reason: "receive flushed by connection teardown".to_string(),
            }));
        }
        if !event.status.is_success() {
            warn!(slot, status = ?event.status, "receive completed with error");
            self.repost_receive(slot);
            return Ok(None);
        }
        let bytes = self.pool.read_received(slot, event.byte_len as usize)?;
        self.repost_receive(slot);
        match Message::decode(&bytes) {
            Ok(Message::FlushResponse(resp)) => Ok(Some(TrackerEvent::Acknowledged {
                correlation_id: resp.correlation_id,
                status: resp.status,
            })),
            Ok(other) => {
                self.stats.malformed_messages += 1;
                warn!(correlation_id = other.correlation_id(), "client received a request message");
                Ok(None)
            }
            Err(e) => {
                self.stats.malformed_messages += 1;
                warn!(slot, error = %e, "undecodable message discarded");
                Ok(None)
            }
        }
    }

    fn repost_receive(&mut self, slot: usize) {
        match self.post_receive(slot) {
            Ok(()) => self.stats.receives_reposted += 1,
            Err(e) => warn!(slot, error = %e, "failed to re-post receive"),
        }
    }

    fn on_connection_lost(&mut self, reason: &str) {
        if self.connected {
            info!(reason, "client connection lost");
        }
        self.connected = false;
        self.sends_outstanding = 0;
        self.tracker.fail_all(reason);
    }

    /// Wait until at least `min` requests are terminal or `timeout` passes,
    /// then collect up to `max` of them.
    ///
    /// Returns the number collected; on timeout that may be fewer than `min`,
    /// including zero. Requests still in flight stay in flight.
    pub async fn get_events(&mut self, min: usize, max: usize, timeout: Duration) -> Result<usize> {
        if min > max {
            return Err(AofError::invalid_request(format!(
                "min {min} exceeds max {max}"
            )));
        }
        self.events.clear();
        let response_timeout = self.config.response_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            self.process_completions()?;
            self.tracker.expire(Instant::now(), response_timeout);
            if self.tracker.ready() >= min || !self.connected {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self.config.busy_wait_polling {
                tokio::task::yield_now().await;
            } else {
                let wait = (deadline - now).min(response_timeout);
                self.conn.wait_for_completions(wait).await;
            }
        }
        self.events = self.tracker.drain(max);
        Ok(self.events.len())
    }

    /// Outcome `index` of the last `get_events`, in finalization order.
    pub fn event(&self, index: usize) -> Option<&IoOutcome> {
        self.events.get(index)
    }

    pub(crate) fn stash_event(&mut self, outcome: IoOutcome) {
        self.events = vec![outcome];
    }

    /// Whether every request runs synchronously.
    pub fn is_sync(&self) -> bool {
        self.config.sync
    }

    /// Take the outcomes of the last `get_events`.
    pub fn take_events(&mut self) -> Vec<IoOutcome> {
        std::mem::take(&mut self.events)
    }

    /// Run one request to its terminal outcome: write, flush, wait for the
    /// acknowledgment. Nothing else may be outstanding.
    pub async fn queue_sync(&mut self, io: IoUnit) -> Result<IoOutcome> {
        if self.tracker.tracked() > 0 {
            return Err(AofError::invalid_request(
                "synchronous submission with requests outstanding",
            ));
        }
        match self.queue(io)? {
            QueueStatus::Queued(_) => {}
            QueueStatus::Busy | QueueStatus::Completed(_) => {
                return Err(AofError::Exhausted {
                    resource: Resource::SendQueue,
                })
            }
        }
        self.commit()?;
        let wait = self.config.response_timeout();
        loop {
            if self.get_events(1, 1, wait).await? == 1 {
                if let Some(outcome) = self.events.pop() {
                    return Ok(outcome);
                }
            }
        }
    }

    /// Copy caller data into the local data region.
    pub fn fill_data(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.conn.write_region(&self.data_region, offset, data)
    }

    /// Size of the remote workspace.
    pub fn file_size(&self) -> u64 {
        self.workspace.size
    }

    /// Queue budget in force.
    pub fn budget(&self) -> QueueBudget {
        self.budget
    }

    /// Workspace descriptor the client was set up with.
    pub fn workspace(&self) -> &ServerWorkspace {
        &self.workspace
    }

    /// Shared message pool.
    pub fn pool(&self) -> &Arc<MessageBufferPool> {
        &self.pool
    }

    /// Request tracker.
    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            requests: self.tracker.stats(),
            ..self.stats.clone()
        }
    }

    /// Tear down: fail what is still in flight, disconnect and release the data region.
    ///
    /// Failed requests remain collectable through `get_events`.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        self.cleaned_up = true;
        self.on_connection_lost("client cleanup");
        self.conn.disconnect()?;
        self.conn.deregister_region(&self.data_region)?;
        info!(stats = ?self.stats(), "client engine cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{server_budget, RemoteCapacity};
    use crate::loopback::{Fault, LoopbackConfig, LoopbackEndpoint, LoopbackFabric};
    use crate::tracker::RequestState;
    use crate::transport::{RemoteRegion, WrOpcode};
    use crate::wire::{FlushResponse, FlushStatus};

    const RESPONSE_OFFSET: u64 = 60 * MAX_MSG_SIZE as u64;

    /// Hand-driven server side of the fabric.
    struct Peer {
        endpoint: LoopbackEndpoint,
        region: LocalRegion,
        msgs: LocalRegion,
    }

    impl Peer {
        fn post_receives(&self, n: usize) {
            for i in 0..n {
                let offset = (i * MAX_MSG_SIZE) as u64;
                self.endpoint
                    .post_receive(i as u64, &self.msgs, offset, MAX_MSG_SIZE as u64)
                    .unwrap();
            }
        }

        /// Answer every flush request that arrived and return their ids.
        fn answer(&self, status: FlushStatus) -> Vec<u64> {
            let mut ids = Vec::new();
            for ev in self.endpoint.poll_completions(64).unwrap() {
                if ev.opcode != WrOpcode::Recv || !ev.status.is_success() {
                    continue;
                }
                let offset = ev.wr_id * MAX_MSG_SIZE as u64;
                let bytes = self
                    .endpoint
                    .read_region(&self.msgs, offset, u64::from(ev.byte_len))
                    .unwrap();
                let Message::FlushRequest(req) = Message::decode(&bytes).unwrap() else {
                    panic!("expected flush request");
                };
                self.endpoint
                    .post_receive(ev.wr_id, &self.msgs, offset, MAX_MSG_SIZE as u64)
                    .unwrap();
                self.respond(req.correlation_id, status);
                ids.push(req.correlation_id);
            }
            ids
        }

        fn respond(&self, correlation_id: u64, status: FlushStatus) {
            let bytes = Message::FlushResponse(FlushResponse {
                correlation_id,
                status,
            })
            .encode()
            .unwrap();
            self.endpoint
                .write_region(&self.msgs, RESPONSE_OFFSET, &bytes)
                .unwrap();
            self.endpoint
                .post_send(u64::MAX, &self.msgs, RESPONSE_OFFSET, bytes.len() as u64)
                .unwrap();
        }
    }

    fn setup(config: ClientConfig, capacity: u32) -> (ClientEngine, LoopbackEndpoint, Peer) {
        let (a, b) = LoopbackFabric::connect(
            LoopbackConfig::default(),
            compute_budget(config.max_outstanding_writes, config.durability_msg_count),
            server_budget(RemoteCapacity(capacity)),
        );
        let region = b
            .register_region(1 << 16, AccessFlags::REMOTE_WRITE | AccessFlags::LOCAL_READ)
            .unwrap();
        let msgs = b
            .register_region(64 * MAX_MSG_SIZE as u64, AccessFlags::MESSAGING)
            .unwrap();
        let workspace = ServerWorkspace {
            region: region.remote(),
            max_msg_num: RemoteCapacity(capacity),
            size: region.len,
        };
        let client = ClientEngine::connect(Arc::new(a.clone()), workspace, config).unwrap();
        let peer = Peer {
            endpoint: b,
            region,
            msgs,
        };
        (client, a, peer)
    }

    fn small() -> ClientConfig {
        ClientConfig {
            msg_num: 4,
            max_outstanding_writes: 4,
            durability_msg_count: 4,
            data_region_size: 4096,
            response_timeout_ms: 1000,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_connect_rejects_capacity_mismatch() {
        let (a, _b) = LoopbackFabric::connect(
            LoopbackConfig::default(),
            compute_budget(4, 3),
            compute_budget(0, 2),
        );
        let workspace = ServerWorkspace {
            region: RemoteRegion { rkey: 0, len: 4096 },
            max_msg_num: RemoteCapacity(2),
            size: 4096,
        };
        let config = ClientConfig {
            durability_msg_count: 3,
            ..small()
        };
        let err = ClientEngine::connect(Arc::new(a.clone()), workspace, config)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::CapacityTooSmall);
        assert_eq!(a.posted_receives(), 0);
        assert_eq!(a.stats(), Default::default());
    }

    #[test]
    fn test_connect_preposts_receive_ring() {
        let (client, endpoint, _peer) = setup(small(), 4);
        assert_eq!(client.budget().receive_capacity, 4);
        assert_eq!(endpoint.posted_receives(), 4);
        assert_eq!(client.file_size(), 1 << 16);
    }

    #[test]
    fn test_queue_validates_ranges() {
        let (mut client, _endpoint, _peer) = setup(small(), 4);
        let bad = [
            IoUnit::write(0, 0, 0),
            IoUnit::write(0, (1 << 16) - 4, 8),
            IoUnit::write(0, 0, 8).with_source(4092),
            IoUnit::write(0, u64::MAX, 2),
        ];
        for io in bad {
            assert_eq!(
                client.queue(io).unwrap_err().kind(),
                ErrorKind::InvalidRequest
            );
        }
    }

    #[test]
    fn test_queue_reports_busy_at_iodepth() {
        let (mut client, _endpoint, _peer) = setup(small(), 4);
        for i in 0..4 {
            assert!(matches!(
                client.queue(IoUnit::write(i, i * 8, 8)).unwrap(),
                QueueStatus::Queued(_)
            ));
        }
        assert_eq!(
            client.queue(IoUnit::write(9, 0, 8)).unwrap(),
            QueueStatus::Busy
        );
        assert_eq!(client.stats().busy, 1);
    }

    #[test]
    fn test_queue_reports_busy_at_durability_limit() {
        let config = ClientConfig {
            durability_msg_count: 1,
            ..small()
        };
        let (mut client, _endpoint, _peer) = setup(config, 4);
        assert!(matches!(
            client.queue(IoUnit::durable(1, 0, 8)).unwrap(),
            QueueStatus::Queued(_)
        ));
        assert_eq!(
            client.queue(IoUnit::durable(2, 8, 8)).unwrap(),
            QueueStatus::Busy
        );
        assert!(matches!(
            client.queue(IoUnit::write(3, 8, 8)).unwrap(),
            QueueStatus::Queued(_)
        ));
    }

    #[tokio::test]
    async fn test_fire_and_forget_write_lands() {
        let (mut client, _endpoint, peer) = setup(small(), 4);
        client.fill_data(0, b"append-only").unwrap();
        client.queue(IoUnit::write(1, 100, 11)).unwrap();
        assert_eq!(client.commit().unwrap(), 1);

        let n = client
            .get_events(1, 4, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(n, 1);
        let outcome = client.event(0).unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.tag, 1);
        assert_eq!(
            peer.endpoint.read_region(&peer.region, 100, 11).unwrap(),
            b"append-only".to_vec()
        );
        assert_eq!(client.pool().lent(), 0);
        assert_eq!(client.stats().bytes_posted, 11);
    }

    #[tokio::test]
    async fn test_durable_write_waits_for_ack() {
        let (mut client, _endpoint, peer) = setup(small(), 4);
        peer.post_receives(4);
        let QueueStatus::Queued(id) = client.queue(IoUnit::durable(5, 0, 16)).unwrap() else {
            panic!("expected queued");
        };
        client.commit().unwrap();

        assert_eq!(client.get_events(0, 4, Duration::ZERO).await.unwrap(), 0);
        assert_eq!(
            client.tracker().state(id),
            Some(RequestState::DurabilityRequested)
        );

        assert_eq!(peer.answer(FlushStatus::Success), vec![id]);
        assert_eq!(
            client
                .get_events(1, 4, Duration::from_secs(1))
                .await
                .unwrap(),
            1
        );
        let outcome = client.event(0).unwrap();
        assert_eq!(outcome.correlation_id, id);
        assert!(outcome.is_ok());
        assert_eq!(client.pool().lent(), 0);
        assert!(client.stats().receives_reposted >= 1);
    }

    #[tokio::test]
    async fn test_commit_stops_when_slots_run_out() {
        let config = ClientConfig {
            msg_num: 2,
            durability_msg_count: 2,
            ..small()
        };
        let (mut client, _endpoint, _peer) = setup(config, 4);
        for i in 0..3 {
            client.queue(IoUnit::write(i, i * 8, 8)).unwrap();
        }
        let err = client.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Exhausted);
        assert_eq!(client.tracker().queued_len(), 1);

        assert_eq!(
            client
                .get_events(2, 4, Duration::from_secs(1))
                .await
                .unwrap(),
            2
        );
        assert_eq!(client.commit().unwrap(), 1);
        assert_eq!(
            client
                .get_events(1, 4, Duration::from_secs(1))
                .await
                .unwrap(),
            1
        );
        assert_eq!(client.stats().exhausted_commits, 1);
    }

    #[tokio::test]
    async fn test_get_events_times_out_with_zero() {
        let (mut client, _endpoint, peer) = setup(small(), 4);
        peer.post_receives(4);
        client.queue(IoUnit::durable(1, 0, 8)).unwrap();
        client.commit().unwrap();
        let n = client
            .get_events(1, 1, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(client.tracker().outstanding(), 1);
    }

    #[tokio::test]
    async fn test_get_events_rejects_inverted_bounds() {
        let (mut client, _endpoint, _peer) = setup(small(), 4);
        let err = client.get_events(2, 1, Duration::ZERO).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let config = ClientConfig {
            response_timeout_ms: 10,
            ..small()
        };
        let (mut client, _endpoint, peer) = setup(config, 4);
        peer.post_receives(4);
        client.queue(IoUnit::durable(1, 0, 8)).unwrap();
        client.commit().unwrap();

        let n = client
            .get_events(1, 1, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(n, 1);
        let outcome = client.event(0).unwrap();
        assert_eq!(
            outcome.result.as_ref().unwrap_err().kind(),
            ErrorKind::Timeout
        );
        assert_eq!(client.stats().requests.timeouts, 1);
        // the server still holds the flush, so the slot stays lent
        assert_eq!(client.pool().lent(), 1);

        assert_eq!(peer.answer(FlushStatus::Success).len(), 1);
        client.get_events(0, 1, Duration::ZERO).await.unwrap();
        assert_eq!(client.pool().lent(), 0);
        assert_eq!(client.stats().requests.correlation_mismatches, 0);
    }

    #[test]
    fn test_durable_write_needs_a_receive_ring() {
        let config = ClientConfig {
            durability_msg_count: 0,
            ..small()
        };
        let (mut client, endpoint, _peer) = setup(config, 4);
        assert_eq!(endpoint.posted_receives(), 0);
        assert_eq!(
            client.queue(IoUnit::durable(1, 0, 8)).unwrap_err().kind(),
            ErrorKind::InvalidRequest
        );
        assert!(matches!(
            client.queue(IoUnit::write(2, 0, 8)).unwrap(),
            QueueStatus::Queued(_)
        ));
    }

    #[tokio::test]
    async fn test_post_failure_surfaces_on_next_get_events() {
        let (mut client, endpoint, _peer) = setup(small(), 4);
        client.queue(IoUnit::write(1, 0, 8)).unwrap();
        endpoint.inject_fault(Fault::FailNextPost);
        assert_eq!(client.commit().unwrap(), 0);

        assert_eq!(client.get_events(1, 1, Duration::ZERO).await.unwrap(), 1);
        let outcome = client.event(0).unwrap();
        assert_eq!(
            outcome.result.as_ref().unwrap_err().kind(),
            ErrorKind::PostFailure
        );
        assert!(outcome.error_details().unwrap().contains("post failed"));
        assert_eq!(client.pool().lent(), 0);
    }

    #[tokio::test]
    async fn test_flush_post_failure_keeps_slot_until_write_drains() {
        let (mut client, endpoint, peer) = setup(small(), 4);
        peer.post_receives(4);
        client.queue(IoUnit::durable(1, 0, 8)).unwrap();
        // the write's completion fault is a plain success; the flush post is rejected
        endpoint.inject_fault(Fault::ErrorNextCompletion(CompletionStatus::Success));
        endpoint.inject_fault(Fault::FailNextPost);
        assert_eq!(client.commit().unwrap(), 1);

        assert_eq!(client.get_events(1, 1, Duration::ZERO).await.unwrap(), 1);
        assert_eq!(
            client.event(0).unwrap().result.as_ref().unwrap_err().kind(),
            ErrorKind::PostFailure
        );
        assert_eq!(client.pool().lent(), 0);
        assert_eq!(client.tracker().tracked(), 0);
    }

    #[tokio::test]
    async fn test_server_rejection_fails_request() {
        let (mut client, _endpoint, peer) = setup(small(), 4);
        peer.post_receives(4);
        client.queue(IoUnit::durable(1, 0, 8)).unwrap();
        client.commit().unwrap();
        peer.answer(FlushStatus::PersistFailed);

        assert_eq!(
            client
                .get_events(1, 1, Duration::from_secs(1))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            client.event(0).unwrap().result.as_ref().unwrap_err().kind(),
            ErrorKind::TransportError
        );
    }

    #[tokio::test]
    async fn test_stray_response_is_counted_and_ignored() {
        let (mut client, _endpoint, peer) = setup(small(), 4);
        peer.post_receives(4);
        client.queue(IoUnit::durable(1, 0, 8)).unwrap();
        client.commit().unwrap();
        peer.respond(424242, FlushStatus::Success);

        assert_eq!(client.get_events(0, 4, Duration::ZERO).await.unwrap(), 0);
        assert_eq!(client.stats().requests.correlation_mismatches, 1);
        assert_eq!(client.tracker().outstanding(), 1);
    }

    #[tokio::test]
    async fn test_queue_sync_runs_to_completion() {
        let (mut client, _endpoint, peer) = setup(small(), 4);
        peer.post_receives(4);

        let answer = {
            let (endpoint, region, msgs) = (peer.endpoint.clone(), peer.region, peer.msgs);
            tokio::spawn(async move {
                let peer = Peer {
                    endpoint,
                    region,
                    msgs,
                };
                loop {
                    if !peer.answer(FlushStatus::Success).is_empty() {
                        break;
                    }
                    peer.endpoint
                        .wait_for_completions(Duration::from_millis(10))
                        .await;
                }
            })
        };

        let outcome = client.queue_sync(IoUnit::durable(3, 0, 8)).await.unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.tag, 3);
        answer.await.unwrap();

        client.queue(IoUnit::write(4, 0, 8)).unwrap();
        let err = client.queue_sync(IoUnit::durable(5, 0, 8)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_disconnect_fails_inflight_requests() {
        let (mut client, _endpoint, peer) = setup(small(), 4);
        peer.post_receives(4);
        client.queue(IoUnit::durable(1, 0, 8)).unwrap();
        client.queue(IoUnit::durable(2, 8, 8)).unwrap();
        client.commit().unwrap();
        peer.endpoint.disconnect().unwrap();

        assert_eq!(
            client
                .get_events(2, 4, Duration::from_secs(1))
                .await
                .unwrap(),
            2
        );
        for i in 0..2 {
            assert_eq!(
                client.event(i).unwrap().result.as_ref().unwrap_err().kind(),
                ErrorKind::ConnectionLost
            );
        }
        assert_eq!(client.pool().lent(), 0);
        assert_eq!(
            client.queue(IoUnit::write(3, 0, 8)).unwrap_err().kind(),
            ErrorKind::ConnectionLost
        );
    }

    #[tokio::test]
    async fn test_cleanup_fails_queued_requests() {
        let (mut client, endpoint, _peer) = setup(small(), 4);
        client.queue(IoUnit::write(1, 0, 8)).unwrap();
        client.cleanup().unwrap();
        assert!(!endpoint.is_connected());
        assert_eq!(client.get_events(1, 1, Duration::ZERO).await.unwrap(), 1);
        assert!(client.cleanup().is_ok());
    }
}
