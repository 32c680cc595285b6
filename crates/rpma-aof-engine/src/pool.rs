//! Message buffer pool.
//!
//! One registered region split into fixed-size slots of [`IO_U_BUF_LEN`]
//! bytes. The first half of a slot holds an outgoing control message and is
//! lent to exactly one in-flight request at a time. The second half is a
//! receive buffer; receive halves are never lent, the engines keep them
//! posted as a receive ring.
//!
//! Registration happens once in [`MessageBufferPool::new`] and is released
//! once on drop. The pool is `Send + Sync`, so one pool may back several
//! connections' workers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AofError, Resource, Result};
use crate::transport::{AccessFlags, Connection, LocalRegion};
use crate::wire::{IO_U_BUF_LEN, MAX_MSG_SIZE};

static POOL_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Exclusive claim on one slot's message half.
///
/// Not `Clone`: releasing consumes the handle.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotHandle {
    pool_id: u64,
    index: usize,
    generation: u64,
}

impl SlotHandle {
    /// Slot index within its pool.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Configured slot count.
    pub capacity: usize,
    /// Slots currently lent.
    pub lent: usize,
    /// Most slots ever lent at once.
    pub high_watermark: usize,
    /// `acquire_slot` calls that found the pool empty.
    pub exhausted: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    lent: bool,
    generation: u64,
}

struct PoolState {
    slots: Vec<SlotState>,
    free: VecDeque<usize>,
    lent: usize,
    high_watermark: usize,
    exhausted: u64,
}

/// Fixed pool of registered send/receive message slots.
pub struct MessageBufferPool {
    id: u64,
    conn: Arc<dyn Connection>,
    region: LocalRegion,
    state: Mutex<PoolState>,
}

impl MessageBufferPool {
    /// Allocate and register `slot_count` slots on `conn`.
    pub fn new(conn: Arc<dyn Connection>, slot_count: usize) -> Result<Self> {
        if slot_count == 0 {
            return Err(AofError::invalid_config("message pool needs at least one slot"));
        }
        let len = (slot_count * IO_U_BUF_LEN) as u64;
        let region = conn.register_region(len, AccessFlags::MESSAGING)?;
        let id = POOL_COUNTER.fetch_add(1, Ordering::Relaxed);
        debug!(pool = id, slots = slot_count, bytes = len, "message pool registered");
        Ok(Self {
            id,
            conn,
            region,
            state: Mutex::new(PoolState {
                slots: vec![SlotState::default(); slot_count],
                free: (0..slot_count).collect(),
                lent: 0,
                high_watermark: 0,
                exhausted: 0,
            }),
        })
    }

    /// Lend a free slot, or report backpressure.
    pub fn acquire_slot(&self) -> Result<SlotHandle> {
        let mut state = self.state.lock();
        let Some(index) = state.free.pop_front() else {
            state.exhausted += 1;
            return Err(AofError::Exhausted {
                resource: Resource::BufferSlots,
            });
        };
        let slot = &mut state.slots[index];
        slot.lent = true;
        slot.generation += 1;
        let generation = slot.generation;
        state.lent += 1;
        state.high_watermark = state.high_watermark.max(state.lent);
        Ok(SlotHandle {
            pool_id: self.id,
            index,
            generation,
        })
    }

    /// Return a slot. Handles from another pool or a previous lending are rejected.
    pub fn release(&self, handle: SlotHandle) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_owner(self.id, &state, &handle)?;
        state.slots[handle.index].lent = false;
        state.lent -= 1;
        state.free.push_back(handle.index);
        Ok(())
    }

    /// Offset of slot 0 within the registration, and the registration itself.
    pub fn base_address_and_registration(&self) -> (u64, LocalRegion) {
        (0, self.region)
    }

    /// Copy an encoded message into the slot's message half.
    ///
    /// Returns the `(offset, len)` to post as a send.
    pub fn write_message(&self, handle: &SlotHandle, bytes: &[u8]) -> Result<(u64, u64)> {
        if bytes.len() > MAX_MSG_SIZE {
            return Err(AofError::invalid_request(format!(
                "message of {} bytes does not fit a slot",
                bytes.len()
            )));
        }
        Self::check_owner(self.id, &self.state.lock(), handle)?;
        let offset = Self::send_offset(handle.index);
        self.conn.write_region(&self.region, offset, bytes)?;
        Ok((offset, bytes.len() as u64))
    }

    /// Offset of the receive half of slot `index`.
    pub fn recv_offset(&self, index: usize) -> Option<u64> {
        (index < self.capacity()).then(|| Self::send_offset(index) + MAX_MSG_SIZE as u64)
    }

    /// Copy `len` received bytes out of the receive half of slot `index`.
    pub fn read_received(&self, index: usize, len: usize) -> Result<Vec<u8>> {
        let offset = self
            .recv_offset(index)
            .ok_or_else(|| AofError::invalid_request(format!("no receive buffer {index}")))?;
        if len > MAX_MSG_SIZE {
            return Err(AofError::invalid_request(format!(
                "received length {len} exceeds slot size"
            )));
        }
        self.conn.read_region(&self.region, offset, len as u64)
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Slots currently lent.
    pub fn lent(&self) -> usize {
        self.state.lock().lent
    }

    /// Snapshot of pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            capacity: state.slots.len(),
            lent: state.lent,
            high_watermark: state.high_watermark,
            exhausted: state.exhausted,
        }
    }

    fn send_offset(index: usize) -> u64 {
        (index * IO_U_BUF_LEN) as u64
    }

    fn check_owner(pool_id: u64, state: &PoolState, handle: &SlotHandle) -> Result<()> {
        let owned = handle.pool_id == pool_id
            && state
                .slots
                .get(handle.index)
                .map(|s| s.lent && s.generation == handle.generation)
                .unwrap_or(false);
        if !owned {
            warn!(slot = handle.index, "slot ownership violation");
            return Err(AofError::SlotOwnership {
                index: handle.index,
            });
        }
        Ok(())
    }
}

impl Drop for MessageBufferPool {
    fn drop(&mut self) {
        let lent = self.state.lock().lent;
        if lent > 0 {
            warn!(pool = self.id, lent, "message pool dropped with slots still lent");
        }
        if let Err(e) = self.conn.deregister_region(&self.region) {
            warn!(pool = self.id, error = %e, "failed to deregister message pool");
        }
    }
}
