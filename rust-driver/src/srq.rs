#![allow(
    clippy::as_conversions,     // u32 indices to usize offsets
    clippy::cast_possible_truncation,
    clippy::indexing_slicing    // indices are bounded by the ring size
)]

use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, error};
use parking_lot::Mutex;

use crate::{
    barrier::wmb,
    config::DeviceLimits,
    constants::{MIN_WQE_SHIFT, SRQ_CONTEXT_SIZE, TAVOR_MAX_WQES_PER_RECV_DB},
    device::UarAdaptor,
    doorbell::{self, DoorbellMode, RECV_DOORBELL},
    error::{HcaError, PostError, Result},
    mem::{DmaBuf, RingSlot},
    ring::RingGeometry,
    table::AttachCount,
    types::{RecvWr, SrqAttr, SrqInitAttr},
    wqe::{self, next, NextEeNds, DATA_SEG_SIZE, NEXT_SEG_SIZE},
};

/// Free slots of an SRQ as a singly linked list.
///
/// Links are kept apart from the WQE memory. The list always holds at least
/// one slot: popping fails once the head has no successor.
#[derive(Debug)]
struct FreeList {
    next: Box<[Option<u32>]>,
    head: u32,
    tail: u32,
}

impl FreeList {
    fn new(max: u32) -> Self {
        let next = (0..max)
            .map(|i| (i + 1 < max).then_some(i + 1))
            .collect();
        Self {
            next,
            head: 0,
            tail: max - 1,
        }
    }

    fn pop(&mut self) -> Option<u32> {
        let ind = self.head;
        let next = self.next[ind as usize]?;
        self.head = next;
        Some(ind)
    }

    fn push(&mut self, ind: u32) {
        self.next[self.tail as usize] = Some(ind);
        self.next[ind as usize] = None;
        self.tail = ind;
    }
}

#[derive(Debug)]
struct SrqState {
    free: FreeList,
    /// Most recently posted slot, linked to the next post in legacy mode
    last: u32,
    /// Producer counter of the doorbell record
    counter: u32,
    /// Receives posted and not yet completed
    outstanding: u32,
}

/// A shared receive queue.
pub(crate) struct Srq {
    srqn: u32,
    pd: u32,
    max_wr: u32,
    geo: RingGeometry,
    buf: DmaBuf,
    state: Mutex<SrqState>,
    wrid: Box<[AtomicU64]>,
    db: DoorbellMode,
    uar: Arc<dyn UarAdaptor>,
    /// QPs receiving from this SRQ
    bound: AttachCount,
}

impl std::fmt::Debug for Srq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Srq")
            .field("srqn", &self.srqn)
            .field("geo", &self.geo)
            .field("db", &self.db)
            .finish_non_exhaustive()
    }
}

/// Ring shape for an SRQ request.
///
/// One slot more than requested is allocated since the free list never
/// hands out its last entry.
pub(crate) fn geometry(
    attr: &SrqInitAttr,
    limits: &DeviceLimits,
    memfree: bool,
) -> Result<RingGeometry> {
    if attr.max_wr == 0 || attr.max_wr > limits.max_srq_wqes {
        return Err(HcaError::InvalidParameter(format!(
            "SRQ max_wr {} outside of 1..={}",
            attr.max_wr, limits.max_srq_wqes
        )));
    }
    if attr.max_sge > limits.max_srq_sge {
        return Err(HcaError::InvalidParameter(format!(
            "SRQ max_sge {} above {}",
            attr.max_sge, limits.max_srq_sge
        )));
    }
    let max = if memfree {
        (attr.max_wr + 1).next_power_of_two()
    } else {
        attr.max_wr + 1
    };
    let ds = (NEXT_SEG_SIZE + attr.max_sge as usize * DATA_SEG_SIZE)
        .next_power_of_two()
        .max(1 << MIN_WQE_SHIFT);
    if !memfree && ds > limits.max_desc_sz as usize {
        return Err(HcaError::InvalidParameter(format!(
            "SRQ descriptor of {ds} bytes above {}",
            limits.max_desc_sz
        )));
    }
    Ok(RingGeometry {
        max,
        wqe_shift: ds.trailing_zeros() as u8,
        max_gs: attr.max_sge,
        offset: 0,
    })
}

impl Srq {
    /// Allocates and links the WQE ring.
    pub(crate) fn new(
        srqn: u32,
        attr: &SrqInitAttr,
        geo: RingGeometry,
        db: DoorbellMode,
        uar: Arc<dyn UarAdaptor>,
    ) -> io::Result<Self> {
        let buf = DmaBuf::alloc(geo.bytes())?;
        wqe::recv::init_srq_ring(&buf, &geo);
        Ok(Self {
            srqn,
            pd: attr.pd,
            max_wr: attr.max_wr,
            geo,
            buf,
            state: Mutex::new(SrqState {
                free: FreeList::new(geo.max),
                last: geo.max - 1,
                counter: 0,
                outstanding: 0,
            }),
            wrid: (0..geo.max).map(|_| AtomicU64::new(0)).collect(),
            db,
            uar,
            bound: AttachCount::default(),
        })
    }

    pub(crate) fn number(&self) -> u32 {
        self.srqn
    }

    pub(crate) fn wqe_shift(&self) -> u8 {
        self.geo.wqe_shift
    }

    /// Number of WQE slots in the ring.
    pub(crate) fn slots(&self) -> u32 {
        self.geo.max
    }

    /// Attaches a QP; fails once destroy has started.
    pub(crate) fn bind(&self) -> bool {
        self.bound.attach()
    }

    pub(crate) fn unbind(&self) {
        self.bound.detach();
    }

    /// Refuses new QPs if none is attached, see [`AttachCount::close`].
    pub(crate) fn close(&self) -> std::result::Result<(), Option<u32>> {
        self.bound.close()
    }

    fn slot(&self, ind: u32) -> RingSlot<'_> {
        RingSlot::new(
            &self.buf,
            (ind as usize) << self.geo.wqe_shift,
            self.geo.wqe_size(),
        )
    }

    /// WR id posted at slot `ind`.
    pub(crate) fn wrid(&self, ind: u32) -> u64 {
        self.wrid
            .get(ind as usize)
            .map_or(0, |w| w.load(Ordering::Relaxed))
    }

    pub(crate) fn attr(&self) -> SrqAttr {
        SrqAttr {
            max_wr: self.max_wr,
            max_sge: self.geo.max_gs,
            outstanding: self.state.lock().outstanding,
        }
    }

    /// Hardware image of the SRQ context handed over by SW2HW_SRQ.
    pub(crate) fn context(&self, uar_index: u32, lkey: u32) -> [u8; SRQ_CONTEXT_SIZE] {
        let mut ctx = [0u8; SRQ_CONTEXT_SIZE];
        let mut put = |off: usize, v: u32| ctx[off..off + 4].copy_from_slice(&v.to_be_bytes());
        let stride = u32::from(self.geo.wqe_shift) - 4;
        match self.db {
            DoorbellMode::Legacy => {
                let base = self.buf.addr() | (1 << stride);
                put(0, (base >> 32) as u32);
                put(4, base as u32);
                put(8, self.pd);
                put(12, lkey);
                put(16, uar_index);
            }
            DoorbellMode::MemoryFree(ref rec) => {
                put(0, (self.geo.max.trailing_zeros() << 24) | self.srqn);
                put(4, lkey);
                put(8, rec.index());
                put(12, (stride << 29) | uar_index);
                put(16, (self.buf.addr() >> 32) as u32);
                put(20, self.buf.addr() as u32);
                put(24, self.pd);
            }
        }
        ctx
    }

    /// Posts receive requests.
    pub(crate) fn post_recv(&self, wrs: &[RecvWr]) -> std::result::Result<(), PostError> {
        let dbd = u32::from(NextEeNds::with(0, false, true));
        let mut st = self.state.lock();
        let mut first_ind = st.free.head;
        let mut nreq = 0u32;
        let mut result = Ok(());

        for (i, wr) in wrs.iter().enumerate() {
            if matches!(self.db, DoorbellMode::Legacy) && nreq == TAVOR_MAX_WQES_PER_RECV_DB {
                wmb();
                self.uar.write64(
                    RECV_DOORBELL,
                    doorbell::tavor_recv(first_ind << self.geo.wqe_shift, 0, self.srqn, 0),
                );
                nreq = 0;
                first_ind = st.free.head;
            }
            if let Err(err) = wqe::recv::validate(&wr.sg_list, self.geo.max_gs) {
                result = Err(PostError::new(i, err));
                break;
            }
            let popped = if st.outstanding >= self.max_wr {
                None
            } else {
                st.free.pop()
            };
            let Some(ind) = popped else {
                error!(
                    "SRQ {:#x} full with {} receives outstanding",
                    self.srqn, st.outstanding
                );
                result = Err(PostError::new(i, HcaError::SrqFull(self.srqn)));
                break;
            };

            let slot = self.slot(ind);
            slot.put_be32(next::FLAGS, 0);
            let _size = wqe::recv::put_scatter(&slot, &wr.sg_list, self.geo.max_gs, true);
            self.wrid[ind as usize].store(wr.wr_id, Ordering::Relaxed);
            st.outstanding += 1;

            match self.db {
                DoorbellMode::Legacy => {
                    slot.put_be32(next::EE_NDS, 0);
                    let prev = self.slot(st.last);
                    prev.put_be32(next::NDA_OP, (ind << self.geo.wqe_shift) | 1);
                    wmb();
                    prev.put_be32(next::EE_NDS, dbd);
                    st.last = ind;
                    nreq += 1;
                }
                DoorbellMode::MemoryFree(ref rec) => {
                    st.counter = st.counter.wrapping_add(1);
                    wmb();
                    rec.set_counter(st.counter & 0xffff);
                }
            }
        }

        if nreq > 0 {
            wmb();
            self.uar.write64(
                RECV_DOORBELL,
                doorbell::tavor_recv(first_ind << self.geo.wqe_shift, 0, self.srqn, nreq),
            );
        }
        result
    }

    /// Returns the slot at WQE offset `wqe_addr` to the free list.
    pub(crate) fn free_wqe(&self, wqe_addr: u32) {
        let ind = wqe_addr >> self.geo.wqe_shift;
        if ind >= self.geo.max {
            error!("SRQ {:#x}: WQE address {wqe_addr:#x} out of range", self.srqn);
            return;
        }
        let mut st = self.state.lock();
        self.slot(st.free.tail)
            .put_be32(next::NDA_OP, (ind << self.geo.wqe_shift) | 1);
        st.free.push(ind);
        st.outstanding = st.outstanding.saturating_sub(1);
    }
}

impl Drop for Srq {
    fn drop(&mut self) {
        debug!("releasing SRQ {:#x}", self.srqn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::emulated::RecordingUar,
        doorbell::{DbRecordType, DoorbellTable},
        types::Sge,
    };

    fn attr(max_wr: u32, max_sge: u32) -> SrqInitAttr {
        SrqInitAttr {
            pd: 4,
            max_wr,
            max_sge,
        }
    }

    fn legacy_srq(max_wr: u32) -> (Srq, Arc<RecordingUar>) {
        let a = attr(max_wr, 2);
        let geo = geometry(&a, &DeviceLimits::default(), false).unwrap();
        let uar = Arc::new(RecordingUar::new());
        let srq = Srq::new(0x11, &a, geo, DoorbellMode::Legacy, uar.clone()).unwrap();
        (srq, uar)
    }

    fn recv(wr_id: u64) -> RecvWr {
        RecvWr {
            wr_id,
            sg_list: vec![Sge {
                addr: 0x1000 * wr_id,
                length: 64,
                lkey: 7,
            }],
        }
    }

    #[test]
    fn free_list_pops_in_order_and_keeps_one() {
        let mut list = FreeList::new(3);
        assert_eq!(list.pop(), Some(0));
        assert_eq!(list.pop(), Some(1));
        assert_eq!(list.pop(), None);
        list.push(0);
        assert_eq!(list.pop(), Some(2));
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn geometry_by_generation() {
        let limits = DeviceLimits::default();
        let legacy = geometry(&attr(8, 3), &limits, false).unwrap();
        assert_eq!(legacy.max, 9);
        assert_eq!(legacy.wqe_shift, 6);
        let memfree = geometry(&attr(8, 4), &limits, true).unwrap();
        assert_eq!(memfree.max, 16);
        assert_eq!(memfree.wqe_shift, 7);
        assert!(geometry(&attr(0, 1), &limits, false).is_err());
        let small = DeviceLimits {
            max_desc_sz: 64,
            ..DeviceLimits::default()
        };
        assert!(geometry(&attr(4, 4), &small, false).is_err());
        assert!(geometry(&attr(4, 4), &small, true).is_ok());
    }

    #[test]
    fn fills_then_reports_full() {
        let (srq, uar) = legacy_srq(8);
        let wrs: Vec<RecvWr> = (1..=8).map(recv).collect();
        srq.post_recv(&wrs).unwrap();
        assert_eq!(srq.attr().outstanding, 8);

        let err = srq.post_recv(&[recv(9)]).unwrap_err();
        assert_eq!(err.index, 0);
        assert!(matches!(err.source, HcaError::SrqFull(0x11)));

        let writes = uar.take();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].offset, RECV_DOORBELL);
        assert_eq!(writes[0].words, [0, (0x11 << 8) | 8]);

        // a completion for slot 3 frees it
        srq.free_wqe(3 << 6);
        assert_eq!(srq.attr().outstanding, 7);
        srq.post_recv(&[recv(10)]).unwrap();
        assert_eq!(srq.wrid(8), 10);
    }

    #[test]
    fn legacy_post_links_previous_wqe() {
        let (srq, _uar) = legacy_srq(4);
        srq.post_recv(&[recv(1), recv(2)]).unwrap();
        let dbd = u32::from(NextEeNds::with(0, false, true));
        // the initial tail links to the first post
        assert_eq!(srq.slot(4).get_be32(next::NDA_OP), 1);
        assert_eq!(srq.slot(4).get_be32(next::EE_NDS), dbd);
        assert_eq!(srq.slot(0).get_be32(next::NDA_OP), (1 << 6) | 1);
        assert_eq!(srq.slot(0).get_be32(next::EE_NDS), dbd);
        assert_eq!(srq.slot(1).get_be32(next::EE_NDS), 0);
        // scatter entry, then the terminator
        assert_eq!(srq.slot(1).get_be32(16), 64);
        assert_eq!(srq.slot(1).get_be32(36), wqe::INVAL_LKEY);
    }

    #[test]
    fn too_many_sge_rejected_without_consuming() {
        let (srq, _uar) = legacy_srq(4);
        let wr = RecvWr {
            wr_id: 1,
            sg_list: vec![Sge::default(); 3],
        };
        let err = srq.post_recv(&[recv(1), wr]).unwrap_err();
        assert_eq!(err.index, 1);
        assert!(matches!(err.source, HcaError::TooManySge { .. }));
        assert_eq!(srq.attr().outstanding, 1);
    }

    #[test]
    fn memfree_post_updates_record_per_request() {
        let table = DoorbellTable::new(8).unwrap();
        let rec = table.alloc(DbRecordType::Srq, 0x12).unwrap();
        let index = rec.index();
        let a = attr(8, 1);
        let geo = geometry(&a, &DeviceLimits::default(), true).unwrap();
        let uar = Arc::new(RecordingUar::new());
        let srq = Srq::new(0x12, &a, geo, DoorbellMode::MemoryFree(rec), uar.clone()).unwrap();

        srq.post_recv(&[recv(1), recv(2), recv(3)]).unwrap();
        assert_eq!(table.read(index)[0], 3);
        assert!(uar.writes().is_empty());

        // capacity is rounded up, outstanding is still capped
        let wrs: Vec<RecvWr> = (4..=9).map(recv).collect();
        let err = srq.post_recv(&wrs).unwrap_err();
        assert_eq!(err.index, 5);
        assert_eq!(srq.attr().outstanding, 8);
    }

    #[test]
    fn memfree_context_layout() {
        let table = DoorbellTable::new(8).unwrap();
        let rec = table.alloc(DbRecordType::Srq, 0x12).unwrap();
        let rec_index = rec.index();
        let a = attr(8, 1);
        let geo = geometry(&a, &DeviceLimits::default(), true).unwrap();
        let srq = Srq::new(
            0x12,
            &a,
            geo,
            DoorbellMode::MemoryFree(rec),
            Arc::new(RecordingUar::new()),
        )
        .unwrap();
        let ctx = srq.context(1, 0x100);
        let word = |off: usize| u32::from_be_bytes([ctx[off], ctx[off + 1], ctx[off + 2], ctx[off + 3]]);
        assert_eq!(word(0), (4 << 24) | 0x12);
        assert_eq!(word(4), 0x100);
        assert_eq!(word(8), rec_index);
        assert_eq!(word(12), (2 << 29) | 1);
        assert_eq!(word(24), 4);
    }
}
