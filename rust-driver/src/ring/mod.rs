#![allow(
    clippy::as_conversions,     // u32 indices to usize offsets
    clippy::indexing_slicing    // indices are bounded by the ring capacity
)]

#[cfg(test)]
mod test;

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    doorbell::DoorbellMode,
    mem::{DmaBuf, RingSlot},
};

/// Fixed shape of a work queue, decided at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RingGeometry {
    /// Number of slots
    pub(crate) max: u32,
    /// log2 of the slot size
    pub(crate) wqe_shift: u8,
    /// Scatter/gather entries that fit in a slot
    pub(crate) max_gs: u32,
    /// Byte offset of slot 0 inside the queue buffer
    pub(crate) offset: usize,
}

impl RingGeometry {
    /// Size of a slot in bytes.
    pub(crate) fn wqe_size(&self) -> usize {
        1 << self.wqe_shift
    }

    /// Bytes covered by all slots.
    pub(crate) fn bytes(&self) -> usize {
        (self.max as usize) << self.wqe_shift
    }
}

/// Producer side of a work queue. Only touched under the ring lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RingCtx {
    /// Requests ever accepted
    pub(crate) head: u32,
    /// Slot the next request is written to
    pub(crate) next_ind: u32,
    /// Slot holding the most recently written request
    pub(crate) last: u32,
}

impl RingCtx {
    fn new(max: u32) -> Self {
        Self {
            head: 0,
            next_ind: 0,
            last: max - 1,
        }
    }

    /// Advances the producer after writing slot `ind`.
    pub(crate) fn advance(&mut self, ind: u32, max: u32) {
        self.last = ind;
        self.next_ind = (ind + 1) % max;
        self.head = self.head.wrapping_add(1);
    }
}

/// Caller supplied ids indexed by slot.
struct WrIdTable(Box<[AtomicU64]>);

impl WrIdTable {
    fn new(len: u32) -> Self {
        Self((0..len).map(|_| AtomicU64::new(0)).collect())
    }

    fn set(&self, ind: u32, wr_id: u64) {
        self.0[ind as usize].store(wr_id, Ordering::Relaxed);
    }

    fn get(&self, ind: u32) -> u64 {
        self.0[ind as usize].load(Ordering::Relaxed)
    }
}

/// A send or receive work queue of a QP.
///
/// The producer state lives behind the ring lock. The consumer state, `tail`
/// and `last_comp`, is only written by the poller under the lock of the CQ
/// the queue completes to, and is read without it by the producer.
pub(crate) struct WorkQueue {
    geo: RingGeometry,
    ctx: Mutex<RingCtx>,
    /// Requests ever retired
    tail: AtomicU32,
    /// Slot of the most recently retired request
    last_comp: AtomicU32,
    wrid: WrIdTable,
    db: DoorbellMode,
    buf: Arc<DmaBuf>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("geo", &self.geo)
            .field("tail", &self.tail)
            .field("db", &self.db)
            .finish_non_exhaustive()
    }
}

impl WorkQueue {
    pub(crate) fn new(geo: RingGeometry, db: DoorbellMode, buf: Arc<DmaBuf>) -> Self {
        let max = geo.max.max(1);
        assert!(
            geo.offset + geo.bytes() <= buf.len(),
            "work queue does not fit its buffer"
        );
        Self {
            geo,
            ctx: Mutex::new(RingCtx::new(max)),
            tail: AtomicU32::new(0),
            last_comp: AtomicU32::new(max - 1),
            wrid: WrIdTable::new(geo.max),
            db,
            buf,
        }
    }

    pub(crate) fn geometry(&self) -> &RingGeometry {
        &self.geo
    }

    pub(crate) fn doorbell(&self) -> &DoorbellMode {
        &self.db
    }

    /// Takes the ring lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, RingCtx> {
        self.ctx.lock()
    }

    /// Returns `true` if no slot is free for another request.
    pub(crate) fn is_full(&self, ctx: &RingCtx) -> bool {
        ctx.head.wrapping_sub(self.tail.load(Ordering::Acquire)) >= self.geo.max
    }

    /// Requests posted and not yet retired.
    #[cfg(test)]
    pub(crate) fn outstanding(&self, ctx: &RingCtx) -> u32 {
        ctx.head.wrapping_sub(self.tail.load(Ordering::Acquire))
    }

    /// View of slot `ind`.
    pub(crate) fn slot(&self, ind: u32) -> RingSlot<'_> {
        assert!(ind < self.geo.max, "slot {ind} beyond {}", self.geo.max);
        RingSlot::new(&self.buf, self.wqe_offset(ind), self.geo.wqe_size())
    }

    fn wqe_offset(&self, ind: u32) -> usize {
        self.geo.offset + ((ind as usize) << self.geo.wqe_shift)
    }

    /// Offset of slot `ind` inside the queue buffer, as hardware sees it.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn wqe_addr(&self, ind: u32) -> u32 {
        self.wqe_offset(ind) as u32
    }

    pub(crate) fn set_wrid(&self, ind: u32, wr_id: u64) {
        self.wrid.set(ind, wr_id);
    }

    pub(crate) fn wrid(&self, ind: u32) -> u64 {
        self.wrid.get(ind)
    }

    /// Retires every request up to and including slot `idx`.
    ///
    /// Unsignaled requests before `idx` produce no completion; they are
    /// retired here along with the signaled one.
    pub(crate) fn retire(&self, idx: u32) {
        let last = self.last_comp.load(Ordering::Relaxed);
        let n = if last < idx {
            idx - last
        } else {
            idx + self.geo.max - last
        };
        self.tail.fetch_add(n, Ordering::Release);
        self.last_comp.store(idx, Ordering::Relaxed);
    }

    /// Empties the queue.
    pub(crate) fn reset(&self, ctx: &mut RingCtx) {
        let max = self.geo.max.max(1);
        *ctx = RingCtx::new(max);
        self.tail.store(0, Ordering::Release);
        self.last_comp.store(max - 1, Ordering::Relaxed);
        self.db.reset();
    }
}
