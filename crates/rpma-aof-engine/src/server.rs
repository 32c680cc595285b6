//! Server protocol engine.
//!
//! Client writes land in the workspace region without any server-side work.
//! The server only reacts to flush requests: it makes the named range durable
//! through its [`PersistentMemory`] collaborator and sends back a response
//! echoing the request's correlation id.
//!
//! Every slot's receive half stays posted. A receive is re-posted as soon as
//! its message has been copied out, so the number of posted receives stays
//! at the advertised `max_msg_num` between polls.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::budget::{server_budget, QueueBudget, RemoteCapacity};
use crate::config::ServerConfig;
use crate::error::{AofError, ErrorKind, Result};
use crate::pmem::PersistentMemory;
use crate::pool::{MessageBufferPool, SlotHandle};
use crate::tracker::{IoOutcome, WriteMode};
use crate::transport::{AccessFlags, CompletionEvent, CompletionStatus, Connection, LocalRegion};
use crate::wire::{
    FlushRequest, FlushResponse, FlushStatus, Message, ServerWorkspace, WorkRequest, MAX_MSG_SIZE,
};

const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Server counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    /// Flush requests received.
    pub requests: u64,
    /// Requests whose range was made durable.
    pub flushes: u64,
    /// Bytes made durable.
    pub bytes_flushed: u64,
    /// Requests answered with an error status.
    pub rejected: u64,
    /// Responses posted.
    pub responses_sent: u64,
    /// Responses that had to wait for a free slot.
    pub deferred_responses: u64,
    /// Responses whose send failed.
    pub failed_responses: u64,
    /// Messages that could not be decoded.
    pub malformed_messages: u64,
    /// Receives re-posted.
    pub receives_reposted: u64,
}

/// Server half of the protocol.
pub struct ServerEngine {
    conn: Arc<dyn Connection>,
    config: ServerConfig,
    pmem: Arc<dyn PersistentMemory>,
    pool: MessageBufferPool,
    workspace: LocalRegion,
    sending: HashMap<usize, SlotHandle>,
    pending: VecDeque<FlushResponse>,
    /// Serviced requests not yet handed out by `get_events`.
    serviced: VecDeque<IoOutcome>,
    events: Vec<IoOutcome>,
    cleaned_up: bool,
    stats: ServerStats,
}

impl ServerEngine {
    /// Expose a workspace on `conn` and pre-post the receive ring.
    pub fn new(
        conn: Arc<dyn Connection>,
        pmem: Arc<dyn PersistentMemory>,
        config: ServerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let workspace = conn.register_region(
            config.workspace_size,
            AccessFlags::REMOTE_WRITE | AccessFlags::LOCAL_READ | AccessFlags::LOCAL_WRITE,
        )?;
        let pool = MessageBufferPool::new(Arc::clone(&conn), config.max_msg_num as usize)?;
        let engine = Self {
            conn,
            config,
            pmem,
            pool,
            workspace,
            sending: HashMap::new(),
            pending: VecDeque::new(),
            serviced: VecDeque::new(),
            events: Vec::new(),
            cleaned_up: false,
            stats: ServerStats::default(),
        };
        for slot in 0..engine.pool.capacity() {
            engine.post_receive(slot)?;
        }
        info!(
            max_msg_num = engine.config.max_msg_num,
            workspace_size = engine.config.workspace_size,
            "server engine ready"
        );
        Ok(engine)
    }

    /// Queue budget a connection needs for a server with `config`.
    pub fn budget_for(config: &ServerConfig) -> QueueBudget {
        server_budget(RemoteCapacity(config.max_msg_num))
    }

    /// Descriptor handed to the client at connect time.
    pub fn workspace(&self) -> ServerWorkspace {
        ServerWorkspace {
            region: self.workspace.remote(),
            max_msg_num: RemoteCapacity(self.config.max_msg_num),
            size: self.workspace.len,
        }
    }

    /// Copy bytes out of the workspace.
    pub fn read_workspace(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.conn.read_region(&self.workspace, offset, len)
    }

    fn post_receive(&self, slot: usize) -> Result<()> {
        let offset = self
            .pool
            .recv_offset(slot)
            .ok_or_else(|| AofError::invalid_config(format!("receive slot {slot} outside pool")))?;
        let (_, region) = self.pool.base_address_and_registration();
        self.conn.post_receive(
            WorkRequest::Recv(slot).encode(),
            &region,
            offset,
            MAX_MSG_SIZE as u64,
        )
    }

    /// Reap completions once and service every flush request found.
    ///
    /// Returns the number of requests serviced. Fails with
    /// [`AofError::ConnectionLost`] once the connection is gone.
    pub fn poll_once(&mut self) -> Result<usize> {
        self.send_pending();
        let max = (2 * self.pool.capacity()).max(1);
        let mut serviced = 0;
        for event in self.conn.poll_completions(max)? {
            match WorkRequest::decode(event.wr_id) {
                WorkRequest::Recv(slot) => {
                    if self.on_receive(slot, &event)? {
                        serviced += 1;
                    }
                }
                WorkRequest::Response(slot) => self.on_response_sent(slot, &event),
                other => warn!(wr_id = event.wr_id, kind = ?other, "unexpected completion kind on server"),
            }
        }
        self.send_pending();
        Ok(serviced)
    }

    fn on_receive(&mut self, slot: usize, event: &CompletionEvent) -> Result<bool> {
        if event.status == CompletionStatus::Flushed {
            debug!(slot, "receive flushed by teardown");
            return Ok(false);
        }
        if !event.status.is_success() {
            warn!(slot, status = ?event.status, "receive completed with error");
            self.repost_receive(slot);
            return Ok(false);
        }
        let bytes = self.pool.read_received(slot, event.byte_len as usize)?;
        self.repost_receive(slot);

        let request = match Message::decode(&bytes) {
            Ok(Message::FlushRequest(req)) => req,
            Ok(other) => {
                self.stats.malformed_messages += 1;
                warn!(correlation_id = other.correlation_id(), "server received a response message");
                return Ok(false);
            }
            Err(e) => {
                self.stats.malformed_messages += 1;
                warn!(slot, error = %e, "undecodable message discarded");
                return Ok(false);
            }
        };
        self.stats.requests += 1;
        let started = Instant::now();
        let status = self.flush(&request);
        self.record(&request, status, started.elapsed());
        self.respond(FlushResponse {
            correlation_id: request.correlation_id,
            status,
        });
        Ok(true)
    }

    fn repost_receive(&mut self, slot: usize) {
        match self.post_receive(slot) {
            Ok(()) => self.stats.receives_reposted += 1,
            Err(e) => warn!(slot, error = %e, "failed to re-post receive"),
        }
    }

    /// Make the requested range durable. A zero length covers the whole workspace.
    fn flush(&mut self, req: &FlushRequest) -> FlushStatus {
        let (offset, len) = if req.len == 0 {
            (0, self.workspace.len)
        } else {
            (req.offset, req.len)
        };
        let in_bounds = offset
            .checked_add(len)
            .map_or(false, |end| end <= self.workspace.len);
        if !in_bounds {
            warn!(correlation_id = req.correlation_id, offset, len, "flush range outside workspace");
            self.stats.rejected += 1;
            return FlushStatus::RangeOutOfBounds;
        }
        let persisted = self
            .conn
            .read_region(&self.workspace, offset, len)
            .and_then(|data| self.pmem.flush_range(offset, &data));
        match persisted {
            Ok(()) => {
                self.stats.flushes += 1;
                self.stats.bytes_flushed += len;
                debug!(correlation_id = req.correlation_id, offset, len, "range persisted");
                FlushStatus::Success
            }
            Err(e) => {
                error!(correlation_id = req.correlation_id, error = %e, "persist failed");
                self.stats.rejected += 1;
                FlushStatus::PersistFailed
            }
        }
    }

    fn record(&mut self, req: &FlushRequest, status: FlushStatus, latency: Duration) {
        let result = if status.is_success() {
            Ok(())
        } else {
            Err(AofError::invalid_request(format!(
                "flush of {}+{} answered {:?}",
                req.offset, req.len, status
            )))
        };
        self.serviced.push_back(IoOutcome {
            tag: req.correlation_id,
            correlation_id: req.correlation_id,
            offset: req.offset,
            len: req.len,
            mode: WriteMode::Durable,
            result,
            latency,
        });
    }

    fn respond(&mut self, response: FlushResponse) {
        if !self.pending.is_empty() || !self.try_send(response) {
            self.stats.deferred_responses += 1;
            self.pending.push_back(response);
        }
    }

    fn send_pending(&mut self) {
        while let Some(response) = self.pending.front().copied() {
            if !self.try_send(response) {
                break;
            }
            self.pending.pop_front();
        }
    }

    /// Post one response. Returns false if it must wait for a free slot.
    fn try_send(&mut self, response: FlushResponse) -> bool {
        let slot = match self.pool.acquire_slot() {
            Ok(slot) => slot,
            Err(_) => return false,
        };
        let posted = Message::FlushResponse(response)
            .encode()
            .and_then(|bytes| self.pool.write_message(&slot, &bytes))
            .and_then(|(offset, len)| {
                let (_, region) = self.pool.base_address_and_registration();
                self.conn.post_send(
                    WorkRequest::Response(slot.index()).encode(),
                    &region,
                    offset,
                    len,
                )
            });
        match posted {
            Ok(()) => {
                self.stats.responses_sent += 1;
                self.sending.insert(slot.index(), slot);
                true
            }
            Err(e) => {
                let retry = e.kind() == ErrorKind::Exhausted;
                if let Err(e) = self.pool.release(slot) {
                    warn!(error = %e, "slot release failed");
                }
                if !retry {
                    self.stats.failed_responses += 1;
                    warn!(correlation_id = response.correlation_id, error = %e, "response send failed");
                }
                // a full send queue is retried; anything else drops the response
                !retry
            }
        }
    }

    fn on_response_sent(&mut self, slot: usize, event: &CompletionEvent) {
        if !event.status.is_success() {
            self.stats.failed_responses += 1;
            warn!(slot, status = ?event.status, "response send completed with error");
        }
        match self.sending.remove(&slot) {
            Some(handle) => {
                if let Err(e) = self.pool.release(handle) {
                    warn!(slot, error = %e, "slot release failed");
                }
            }
            None => warn!(slot, "send completion for idle slot"),
        }
    }

    /// Service requests until `shutdown` flips to true or the connection drops.
    pub async fn serve(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("server engine serving");
        loop {
            if *shutdown.borrow() {
                info!("server engine shutting down");
                break;
            }
            match self.poll_once() {
                // Outcomes are only reported through `get_events`.
                Ok(_) => self.serviced.clear(),
                Err(e) if e.kind() == ErrorKind::ConnectionLost => {
                    info!("client disconnected");
                    break;
                }
                Err(e) => return Err(e),
            }
            if self.config.busy_wait_polling {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = self.conn.wait_for_completions(IDLE_WAIT) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Service requests until at least `min` are handled or `timeout` passes.
    ///
    /// Returns how many were handled, at most `max`; see [`ServerEngine::event`].
    /// Requests beyond `max` are reported by the next call.
    pub async fn get_events(&mut self, min: usize, max: usize, timeout: Duration) -> Result<usize> {
        if min > max {
            return Err(AofError::invalid_request(format!(
                "min {min} exceeds max {max}"
            )));
        }
        self.events.clear();
        let deadline = Instant::now() + timeout;
        loop {
            self.poll_once()?;
            let now = Instant::now();
            if self.serviced.len() >= min || now >= deadline {
                break;
            }
            if self.config.busy_wait_polling {
                tokio::task::yield_now().await;
            } else {
                self.conn.wait_for_completions(deadline - now).await;
            }
        }
        let n = self.serviced.len().min(max);
        self.events.extend(self.serviced.drain(..n));
        Ok(n)
    }

    /// Request `index` reported by the last `get_events`.
    pub fn event(&self, index: usize) -> Option<&IoOutcome> {
        self.events.get(index)
    }

    /// Responses waiting for a free slot.
    pub fn pending_responses(&self) -> usize {
        self.pending.len()
    }

    /// Size of the workspace.
    pub fn file_size(&self) -> u64 {
        self.workspace.len
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ServerStats {
        self.stats.clone()
    }

    /// Disconnect and release the workspace.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        self.cleaned_up = true;
        self.conn.disconnect()?;
        for (_, slot) in self.sending.drain() {
            if let Err(e) = self.pool.release(slot) {
                warn!(error = %e, "slot release failed");
            }
        }
        if !self.pending.is_empty() {
            warn!(dropped = self.pending.len(), "unsent responses dropped at cleanup");
            self.pending.clear();
        }
        self.conn.deregister_region(&self.workspace)?;
        info!(stats = ?self.stats, "server engine cleaned up");
        Ok(())
    }
}
