//! In-process RDMA fabric for running the protocol without hardware.
//!
//! A [`LoopbackFabric`] joins two [`LoopbackEndpoint`]s. Work requests execute
//! synchronously at post time and their completions are queued on the
//! poster's completion queue (and, for sends, a receive completion on the
//! peer's). The fabric keeps the hazards the queue budget exists to prevent:
//!
//! - posting beyond the send or receive capacity fails,
//! - a send that finds no posted receive on the peer is dropped silently,
//! - a completion that finds the completion queue full is lost.
//!
//! Both drops are counted in [`FabricStats`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::budget::QueueBudget;
use crate::error::{AofError, Resource, Result};
use crate::transport::{
    AccessFlags, CompletionEvent, CompletionStatus, Connection, LocalRegion, RemoteRegion,
    WrOpcode,
};

static REGION_COUNTER: AtomicU64 = AtomicU64::new(1);

const RKEY_BIT: u32 = 0x8000_0000;

/// Fabric-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Largest region a single registration may cover.
    pub max_region_size: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            max_region_size: 1 << 30,
        }
    }
}

/// Per-endpoint counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricStats {
    /// RDMA writes executed.
    pub writes: u64,
    /// Sends executed.
    pub sends: u64,
    /// Receives consumed.
    pub receives: u64,
    /// Bytes moved by RDMA writes.
    pub bytes_written: u64,
    /// Bytes moved by sends.
    pub bytes_sent: u64,
    /// Incoming sends dropped because no receive was posted.
    pub dropped_messages: u64,
    /// Completions lost to a full completion queue.
    pub lost_completions: u64,
    /// Posts rejected by the endpoint.
    pub failed_posts: u64,
}

/// Faults an endpoint applies to its next operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The next post call returns an error.
    FailNextPost,
    /// The next send-side completion carries this status.
    ErrorNextCompletion(CompletionStatus),
}

struct MemoryRegion {
    buffer: Vec<u8>,
    access: AccessFlags,
}

impl MemoryRegion {
    fn range(&self, offset: u64, len: u64) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        (end <= self.buffer.len()).then_some(start..end)
    }
}

#[derive(Debug, Clone, Copy)]
struct PostedRecv {
    wr_id: u64,
    region_id: u64,
    offset: u64,
    len: u64,
}

struct EndpointState {
    budget: QueueBudget,
    regions: HashMap<u64, MemoryRegion>,
    recv_queue: VecDeque<PostedRecv>,
    cq: VecDeque<CompletionEvent>,
    sends_outstanding: u64,
    recvs_outstanding: u64,
    faults: VecDeque<Fault>,
    stats: FabricStats,
}

impl EndpointState {
    fn new(budget: QueueBudget) -> Self {
        Self {
            budget,
            regions: HashMap::new(),
            recv_queue: VecDeque::new(),
            cq: VecDeque::new(),
            sends_outstanding: 0,
            recvs_outstanding: 0,
            faults: VecDeque::new(),
            stats: FabricStats::default(),
        }
    }

    fn push_completion(&mut self, event: CompletionEvent) -> bool {
        if self.cq.len() as u64 >= self.budget.completion_capacity {
            self.stats.lost_completions += 1;
            warn!(wr_id = event.wr_id, "completion queue full, completion lost");
            return false;
        }
        self.cq.push_back(event);
        true
    }

    fn take_post_fault(&mut self) -> bool {
        if self.faults.front() == Some(&Fault::FailNextPost) {
            self.faults.pop_front();
            self.stats.failed_posts += 1;
            return true;
        }
        false
    }

    fn take_completion_fault(&mut self) -> Option<CompletionStatus> {
        match self.faults.front() {
            Some(Fault::ErrorNextCompletion(status)) => {
                let status = *status;
                self.faults.pop_front();
                Some(status)
            }
            _ => None,
        }
    }

    fn reserve_send(&mut self) -> Result<()> {
        if self.sends_outstanding >= self.budget.send_capacity {
            self.stats.failed_posts += 1;
            return Err(AofError::Exhausted {
                resource: Resource::SendQueue,
            });
        }
        self.sends_outstanding += 1;
        Ok(())
    }

    fn read_local(&self, region: &LocalRegion, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mr = self
            .regions
            .get(&region.id)
            .ok_or_else(|| AofError::invalid_request(format!("region {} not registered", region.id)))?;
        if !mr.access.contains(AccessFlags::LOCAL_READ) {
            return Err(AofError::invalid_request("source region lacks LOCAL_READ"));
        }
        let range = mr.range(offset, len).ok_or_else(|| {
            AofError::invalid_request(format!("range {offset}+{len} outside region {}", region.id))
        })?;
        Ok(mr.buffer[range].to_vec())
    }
}

struct FabricInner {
    endpoints: [Mutex<EndpointState>; 2],
    notify: [Notify; 2],
    connected: AtomicBool,
    config: LoopbackConfig,
}

/// Two endpoints joined by a software fabric.
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

impl LoopbackFabric {
    /// Create a connected pair. The first endpoint uses `first_budget`, the second `second_budget`.
    pub fn connect(
        config: LoopbackConfig,
        first_budget: QueueBudget,
        second_budget: QueueBudget,
    ) -> (LoopbackEndpoint, LoopbackEndpoint) {
        let inner = Arc::new(FabricInner {
            endpoints: [
                Mutex::new(EndpointState::new(first_budget)),
                Mutex::new(EndpointState::new(second_budget)),
            ],
            notify: [Notify::new(), Notify::new()],
            connected: AtomicBool::new(true),
            config,
        });
        debug!("loopback fabric connected");
        let fabric = LoopbackFabric { inner };
        (fabric.endpoint(0), fabric.endpoint(1))
    }

    fn endpoint(&self, side: usize) -> LoopbackEndpoint {
        LoopbackEndpoint {
            inner: Arc::clone(&self.inner),
            side,
        }
    }
}

/// One side of a [`LoopbackFabric`].
#[derive(Clone)]
pub struct LoopbackEndpoint {
    inner: Arc<FabricInner>,
    side: usize,
}

impl std::fmt::Debug for LoopbackEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackEndpoint")
            .field("side", &self.side)
            .field("connected", &self.inner.connected.load(Ordering::Acquire))
            .finish()
    }
}

impl LoopbackEndpoint {
    fn local(&self) -> &Mutex<EndpointState> {
        &self.inner.endpoints[self.side]
    }

    fn peer(&self) -> &Mutex<EndpointState> {
        &self.inner.endpoints[1 - self.side]
    }

    fn wake(&self, side: usize) {
        self.inner.notify[side].notify_one();
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(AofError::ConnectionLost {
                reason: "loopback fabric disconnected".to_string(),
            });
        }
        Ok(())
    }

    /// Snapshot of this endpoint's counters.
    pub fn stats(&self) -> FabricStats {
        self.local().lock().stats.clone()
    }

    /// Queue a fault for this endpoint's next matching operation.
    pub fn inject_fault(&self, fault: Fault) {
        self.local().lock().faults.push_back(fault);
    }

    /// Receives currently posted and not yet consumed.
    pub fn posted_receives(&self) -> usize {
        self.local().lock().recv_queue.len()
    }

    /// Queue budget this endpoint enforces.
    pub fn budget(&self) -> QueueBudget {
        self.local().lock().budget
    }

    fn complete_local(&self, event: CompletionEvent) {
        let mut local = self.local().lock();
        local.push_completion(event);
        drop(local);
        self.wake(self.side);
    }

    /// Deliver a send payload into the peer's oldest posted receive.
    /// Returns the status the sender should see.
    fn deliver(&self, payload: &[u8]) -> CompletionStatus {
        let mut peer = self.peer().lock();
        let Some(recv) = peer.recv_queue.pop_front() else {
            peer.stats.dropped_messages += 1;
            warn!(len = payload.len(), "no receive posted, message dropped");
            return CompletionStatus::Success;
        };
        let len = payload.len() as u64;
        let mut status = CompletionStatus::LocalError;
        let mut byte_len = 0;
        if len <= recv.len {
            if let Some(mr) = peer.regions.get_mut(&recv.region_id) {
                if let Some(range) = mr.range(recv.offset, len) {
                    mr.buffer[range].copy_from_slice(payload);
                    status = CompletionStatus::Success;
                    byte_len = len as u32;
                }
            }
        }
        peer.stats.receives += 1;
        peer.push_completion(CompletionEvent {
            wr_id: recv.wr_id,
            opcode: WrOpcode::Recv,
            status,
            byte_len,
        });
        drop(peer);
        self.wake(1 - self.side);
        if status.is_success() {
            CompletionStatus::Success
        } else {
            CompletionStatus::RemoteError
        }
    }
}

#[async_trait]
impl Connection for LoopbackEndpoint {
    fn register_region(&self, len: u64, access: AccessFlags) -> Result<LocalRegion> {
        if len == 0 || len > self.inner.config.max_region_size {
            return Err(AofError::invalid_request(format!(
                "cannot register {len} bytes (max {})",
                self.inner.config.max_region_size
            )));
        }
        let size = usize::try_from(len)
            .map_err(|_| AofError::invalid_request("region does not fit in memory"))?;
        let id = REGION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let rkey = (id as u32 & !RKEY_BIT) | RKEY_BIT;
        self.local().lock().regions.insert(
            id,
            MemoryRegion {
                buffer: vec![0u8; size],
                access,
            },
        );
        debug!(side = self.side, region = id, len, "region registered");
        Ok(LocalRegion { id, len, rkey })
    }

    fn deregister_region(&self, region: &LocalRegion) -> Result<()> {
        match self.local().lock().regions.remove(&region.id) {
            Some(_) => {
                debug!(side = self.side, region = region.id, "region deregistered");
                Ok(())
            }
            None => Err(AofError::invalid_request(format!(
                "region {} is not registered",
                region.id
            ))),
        }
    }

    fn read_region(&self, region: &LocalRegion, offset: u64, len: u64) -> Result<Vec<u8>> {
        let local = self.local().lock();
        let mr = local
            .regions
            .get(&region.id)
            .ok_or_else(|| AofError::invalid_request(format!("region {} not registered", region.id)))?;
        let range = mr
            .range(offset, len)
            .ok_or_else(|| AofError::invalid_request(format!("range {offset}+{len} out of bounds")))?;
        Ok(mr.buffer[range].to_vec())
    }

    fn write_region(&self, region: &LocalRegion, offset: u64, data: &[u8]) -> Result<()> {
        let mut local = self.local().lock();
        let mr = local
            .regions
            .get_mut(&region.id)
            .ok_or_else(|| AofError::invalid_request(format!("region {} not registered", region.id)))?;
        let range = mr.range(offset, data.len() as u64).ok_or_else(|| {
            AofError::invalid_request(format!("range {offset}+{} out of bounds", data.len()))
        })?;
        mr.buffer[range].copy_from_slice(data);
        Ok(())
    }

    fn post_write(
        &self,
        wr_id: u64,
        src: &LocalRegion,
        src_offset: u64,
        dst: &RemoteRegion,
        dst_offset: u64,
        len: u64,
    ) -> Result<()> {
        self.ensure_connected()?;
        let (data, fault) = {
            let mut local = self.local().lock();
            if local.take_post_fault() {
                return Err(AofError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected post failure",
                )));
            }
            let data = local.read_local(src, src_offset, len)?;
            local.reserve_send()?;
            (data, local.take_completion_fault())
        };

        let status = match fault {
            Some(status) => status,
            None => {
                let mut peer = self.peer().lock();
                let region_id = u64::from(dst.rkey & !RKEY_BIT);
                let mut status = CompletionStatus::RemoteError;
                if let Some(mr) = peer.regions.get_mut(&region_id) {
                    if mr.access.contains(AccessFlags::REMOTE_WRITE) {
                        if let Some(range) = mr.range(dst_offset, len) {
                            mr.buffer[range].copy_from_slice(&data);
                            status = CompletionStatus::Success;
                        }
                    }
                }
                status
            }
        };

        {
            let mut local = self.local().lock();
            if status.is_success() {
                local.stats.writes += 1;
                local.stats.bytes_written += len;
            }
        }
        self.complete_local(CompletionEvent {
            wr_id,
            opcode: WrOpcode::RdmaWrite,
            status,
            byte_len: if status.is_success() { len as u32 } else { 0 },
        });
        Ok(())
    }

    fn post_send(&self, wr_id: u64, src: &LocalRegion, offset: u64, len: u64) -> Result<()> {
        self.ensure_connected()?;
        let (payload, fault) = {
            let mut local = self.local().lock();
            if local.take_post_fault() {
                return Err(AofError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected post failure",
                )));
            }
            let payload = local.read_local(src, offset, len)?;
            local.reserve_send()?;
            (payload, local.take_completion_fault())
        };

        let status = match fault {
            Some(status) => status,
            None => self.deliver(&payload),
        };
        {
            let mut local = self.local().lock();
            if status.is_success() {
                local.stats.sends += 1;
                local.stats.bytes_sent += len;
            }
        }
        self.complete_local(CompletionEvent {
            wr_id,
            opcode: WrOpcode::Send,
            status,
            byte_len: if status.is_success() { len as u32 } else { 0 },
        });
        Ok(())
    }

    fn post_receive(&self, wr_id: u64, dst: &LocalRegion, offset: u64, len: u64) -> Result<()> {
        self.ensure_connected()?;
        let mut local = self.local().lock();
        if local.take_post_fault() {
            return Err(AofError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected post failure",
            )));
        }
        let mr = local
            .regions
            .get(&dst.id)
            .ok_or_else(|| AofError::invalid_request(format!("region {} not registered", dst.id)))?;
        if !mr.access.contains(AccessFlags::LOCAL_WRITE) {
            return Err(AofError::invalid_request("receive region lacks LOCAL_WRITE"));
        }
        if mr.range(offset, len).is_none() {
            return Err(AofError::invalid_request(format!(
                "receive range {offset}+{len} out of bounds"
            )));
        }
        if local.recvs_outstanding >= local.budget.receive_capacity {
            local.stats.failed_posts += 1;
            return Err(AofError::Exhausted {
                resource: Resource::ReceiveQueue,
            });
        }
        local.recvs_outstanding += 1;
        local.recv_queue.push_back(PostedRecv {
            wr_id,
            region_id: dst.id,
            offset,
            len,
        });
        Ok(())
    }

    fn poll_completions(&self, max: usize) -> Result<Vec<CompletionEvent>> {
        let mut local = self.local().lock();
        if local.cq.is_empty() && !self.inner.connected.load(Ordering::Acquire) {
            return Err(AofError::ConnectionLost {
                reason: "loopback fabric disconnected".to_string(),
            });
        }
        let n = max.min(local.cq.len());
        let events: Vec<CompletionEvent> = local.cq.drain(..n).collect();
        for event in &events {
            match event.opcode {
                WrOpcode::Recv => local.recvs_outstanding = local.recvs_outstanding.saturating_sub(1),
                WrOpcode::Send | WrOpcode::RdmaWrite => {
                    local.sends_outstanding = local.sends_outstanding.saturating_sub(1)
                }
            }
        }
        Ok(events)
    }

    async fn wait_for_completions(&self, timeout: Duration) -> bool {
        {
            let local = self.local().lock();
            if !local.cq.is_empty() || !self.inner.connected.load(Ordering::Acquire) {
                return true;
            }
        }
        tokio::time::timeout(timeout, self.inner.notify[self.side].notified())
            .await
            .is_ok()
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn disconnect(&self) -> Result<()> {
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        for side in 0..2 {
            let mut state = self.inner.endpoints[side].lock();
            let flushed: Vec<PostedRecv> = state.recv_queue.drain(..).collect();
            for recv in flushed {
                state.push_completion(CompletionEvent {
                    wr_id: recv.wr_id,
                    opcode: WrOpcode::Recv,
                    status: CompletionStatus::Flushed,
                    byte_len: 0,
                });
            }
            drop(state);
            self.inner.notify[side].notify_one();
        }
        debug!(side = self.side, "loopback fabric disconnected");
        Ok(())
    }
}
