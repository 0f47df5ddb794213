#![allow(
    clippy::as_conversions,     // u32 indices to usize offsets
    clippy::cast_possible_truncation
)]

/// CQE layout and decoding
pub(crate) mod cqe;

use std::{
    io,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use log::{debug, error};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    barrier::{rmb, wmb},
    constants::{CQE_SIZE, CQ_CONTEXT_SIZE},
    device::UarAdaptor,
    doorbell::{self, DbRecord, CQ_DOORBELL},
    mem::{DmaBuf, RingSlot},
    qp::QueuePair,
    srq::Srq,
    table::{AttachCount, ObjectTable},
    types::{CompletionHandler, CqHandle, CqeDecodeError, NotifyKind, Polled, WorkCompletion},
    wqe,
};

use cqe::{RawCqe, OWNER_HW, OWNER_OFFSET, SYNDROME_WR_FLUSH_ERR};

/// How the consumer index reaches hardware.
#[derive(Debug)]
pub(crate) enum CqDoorbell {
    /// MMIO doorbell
    Legacy,
    /// Doorbell records for the consumer index and for arming
    MemoryFree {
        set_ci: DbRecord,
        arm: DbRecord,
    },
}

/// Consumer state, guarded by the CQ lock.
#[derive(Debug)]
pub(crate) struct CqState {
    /// Entries ever consumed
    cons_index: u32,
}

/// Fields of the CQ context that come from the device configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CqContextParams {
    pub(crate) uar_index: u32,
    pub(crate) async_eqn: u32,
    pub(crate) comp_eqn: u32,
    pub(crate) pd: u32,
    pub(crate) lkey: u32,
}

/// Context flags: status OK, disarmed, time-based reporting
const CQ_CONTEXT_FLAGS: u32 = (0x9 << 8) | (1 << 18);

/// A completion queue.
pub(crate) struct CompletionQueue {
    cqn: u32,
    /// Number of entries, a power of two
    nent: u32,
    buf: DmaBuf,
    state: Mutex<CqState>,
    /// Arm sequence number, advanced by every completion event
    arm_sn: AtomicU32,
    db: CqDoorbell,
    uar: Arc<dyn UarAdaptor>,
    handler: Option<CompletionHandler>,
    /// QPs completing to this CQ
    bound: AttachCount,
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("cqn", &self.cqn)
            .field("nent", &self.nent)
            .field("db", &self.db)
            .finish_non_exhaustive()
    }
}

impl CompletionQueue {
    /// Number of entries backing a CQ that must hold `entries` completions.
    pub(crate) fn entries_for(entries: u32) -> u32 {
        (entries + 1).next_power_of_two()
    }

    /// Allocates the CQE ring and hands every entry to hardware.
    pub(crate) fn new(
        cqn: u32,
        nent: u32,
        db: CqDoorbell,
        uar: Arc<dyn UarAdaptor>,
        handler: Option<CompletionHandler>,
    ) -> io::Result<Self> {
        debug_assert!(nent.is_power_of_two());
        let buf = DmaBuf::alloc(nent as usize * CQE_SIZE)?;
        for i in 0..nent as usize {
            buf.write_u8(i * CQE_SIZE + OWNER_OFFSET, OWNER_HW);
        }
        Ok(Self {
            cqn,
            nent,
            buf,
            state: Mutex::new(CqState { cons_index: 0 }),
            arm_sn: AtomicU32::new(1),
            db,
            uar,
            handler,
            bound: AttachCount::default(),
        })
    }

    pub(crate) fn number(&self) -> u32 {
        self.cqn
    }

    /// Usable entries.
    pub(crate) fn capacity(&self) -> u32 {
        self.nent - 1
    }

    /// Takes the CQ lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, CqState> {
        self.state.lock()
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

    #[cfg(test)]
    pub(crate) fn bound(&self) -> u32 {
        self.bound.get()
    }

    fn slot(&self, index: u32) -> RingSlot<'_> {
        let i = (index & (self.nent - 1)) as usize;
        RingSlot::new(&self.buf, i * CQE_SIZE, CQE_SIZE)
    }

    fn read_cqe(&self, index: u32) -> RawCqe {
        RawCqe::from_bytes(&self.slot(index).get_bytes::<CQE_SIZE>(0))
    }

    fn is_sw_owned(&self, index: u32) -> bool {
        self.slot(index).get_u8(OWNER_OFFSET) & OWNER_HW == 0
    }

    fn set_hw_owned(&self, index: u32) {
        self.slot(index).put_u8(OWNER_OFFSET, OWNER_HW);
    }

    /// Hardware image of the CQ context handed over by SW2HW_CQ.
    pub(crate) fn context(&self, params: &CqContextParams) -> [u8; CQ_CONTEXT_SIZE] {
        let mut ctx = [0u8; CQ_CONTEXT_SIZE];
        let mut put = |off: usize, v: u32| ctx[off..off + 4].copy_from_slice(&v.to_be_bytes());
        put(0, CQ_CONTEXT_FLAGS);
        put(4, (self.buf.addr() >> 32) as u32);
        put(8, self.buf.addr() as u32);
        put(12, (self.nent.trailing_zeros() << 24) | params.uar_index);
        put(16, params.async_eqn);
        put(20, params.comp_eqn);
        put(24, params.pd);
        put(28, params.lkey);
        put(48, self.cqn);
        if let CqDoorbell::MemoryFree {
            ref set_ci,
            ref arm,
        } = self.db
        {
            put(52, set_ci.index());
            put(56, arm.index());
        }
        ctx
    }

    /// Tells hardware that `freed` more entries were consumed.
    fn update_cons_index(&self, st: &CqState, freed: u32) {
        match self.db {
            CqDoorbell::Legacy => self.uar.write64(
                CQ_DOORBELL,
                doorbell::tavor_cq(doorbell::TAVOR_CQ_INC_CI, self.cqn, freed - 1),
            ),
            CqDoorbell::MemoryFree { ref set_ci, .. } => {
                set_ci.set_counter(st.cons_index);
                wmb();
            }
        }
    }

    /// Consumes up to `max` entries.
    pub(crate) fn poll(
        &self,
        max: usize,
        qps: &ObjectTable<QueuePair>,
        srqs: &ObjectTable<Srq>,
    ) -> Polled {
        let mut st = self.lock();
        let mut polled = Polled::default();
        let mut cur_qp: Option<Arc<QueuePair>> = None;
        let mut freed = 0u32;

        while polled.completions.len() < max {
            if !self.is_sw_owned(st.cons_index) {
                break;
            }
            rmb();
            let raw = self.read_cqe(st.cons_index);
            let qpn = raw.qpn();
            match cur_qp {
                Some(ref qp) if qp.number() == qpn => {}
                _ => cur_qp = qps.get(qpn),
            }
            let Some(ref qp) = cur_qp else {
                error!(
                    "CQ {:#x}: CQE at index {} for unknown QP {qpn:#x}",
                    self.cqn, st.cons_index
                );
                polled.errors.push(CqeDecodeError::UnknownQp {
                    qpn,
                    index: st.cons_index,
                });
                self.set_hw_owned(st.cons_index);
                st.cons_index = st.cons_index.wrapping_add(1);
                freed += 1;
                continue;
            };

            match self.poll_one(&raw, qp, srqs, st.cons_index) {
                Ok((wc, free_cqe)) => {
                    polled.completions.push(wc);
                    if !free_cqe {
                        continue;
                    }
                }
                Err(err) => {
                    error!("CQ {:#x}: {err}", self.cqn);
                    polled.errors.push(err);
                }
            }
            self.set_hw_owned(st.cons_index);
            st.cons_index = st.cons_index.wrapping_add(1);
            freed += 1;
        }

        if freed > 0 {
            wmb();
            self.update_cons_index(&st, freed);
        }
        polled
    }

    /// Decodes one entry and retires the WQE it completes.
    ///
    /// The flag is `false` when the entry stays software owned for the next
    /// flushed WQE.
    fn poll_one(
        &self,
        raw: &RawCqe,
        qp: &QueuePair,
        srqs: &ObjectTable<Srq>,
        index: u32,
    ) -> Result<(WorkCompletion, bool), CqeDecodeError> {
        let is_send = raw.is_send();
        let wqe = raw.wqe();
        let out_of_range = CqeDecodeError::WqeOutOfRange {
            qpn: qp.number(),
            wqe,
            index,
        };
        let mut srq = None;
        let (wr_id, wqe_index) = if is_send {
            let sq = qp.sq();
            let idx = wqe.wrapping_sub(sq.geometry().offset as u32) >> sq.geometry().wqe_shift;
            if idx >= sq.geometry().max {
                return Err(out_of_range);
            }
            sq.retire(idx);
            (sq.wrid(idx), idx)
        } else if let Some(s) = qp.srqn().and_then(|n| srqs.get(n)) {
            let idx = wqe >> s.wqe_shift();
            if idx >= s.slots() {
                return Err(out_of_range);
            }
            let wr_id = s.wrid(idx);
            s.free_wqe(wqe);
            srq = Some(s);
            (wr_id, idx)
        } else {
            let rq = qp.rq();
            let shifted = (wqe as i32) >> rq.geometry().wqe_shift;
            // some firmware reports slot -1 for the last receive WQE
            let idx = if shifted == -1 {
                rq.geometry().max.wrapping_sub(1)
            } else {
                shifted as u32
            };
            if idx >= rq.geometry().max {
                return Err(out_of_range);
            }
            rq.retire(idx);
            (rq.wrid(idx), idx)
        };

        let mut wc = WorkCompletion::new(wr_id, qp.number());
        if !raw.is_error() {
            cqe::decode_success(raw, is_send, &mut wc);
            return Ok((wc, true));
        }

        let mut err = raw.as_err();
        cqe::decode_error(&err, &mut wc);
        // memory-free hardware writes one CQE per WQE even in error
        if matches!(self.db, CqDoorbell::MemoryFree { .. }) {
            return Ok((wc, true));
        }
        let (dbd, new_wqe) = if srq.is_some() {
            (false, 0)
        } else {
            let wq = if is_send { qp.sq() } else { qp.rq() };
            let (nda_op, ee_nds) = wqe::read_next(&wq.slot(wqe_index));
            let size = ee_nds.size().value();
            let new_wqe = if size == 0 {
                0
            } else {
                (u32::from(nda_op) & !0x3f) | u32::from(size)
            };
            (ee_nds.dbd(), new_wqe)
        };
        let db_cnt = err.db_cnt();
        if new_wqe & 0x3f == 0 || (db_cnt == 0 && dbd) {
            return Ok((wc, true));
        }
        err.db_cnt = db_cnt.wrapping_sub(u16::from(dbd)).to_be_bytes();
        err.wqe = new_wqe.to_be_bytes();
        err.syndrome = SYNDROME_WR_FLUSH_ERR;
        self.slot(index).put_bytes(0, bytemuck::bytes_of(&err));
        Ok((wc, false))
    }

    /// Asks hardware to raise a completion event.
    pub(crate) fn arm(&self, kind: NotifyKind) {
        match self.db {
            CqDoorbell::Legacy => {
                let cmd = match kind {
                    NotifyKind::Solicited => doorbell::TAVOR_CQ_REQ_NOT_SOL,
                    NotifyKind::NextCompletion => doorbell::TAVOR_CQ_REQ_NOT,
                };
                self.uar
                    .write64(CQ_DOORBELL, doorbell::tavor_cq(cmd, self.cqn, 0xffff_ffff));
            }
            CqDoorbell::MemoryFree { ref arm, .. } => {
                let cmd = match kind {
                    NotifyKind::Solicited => doorbell::ARBEL_CQ_REQ_NOT_SOL,
                    NotifyKind::NextCompletion => doorbell::ARBEL_CQ_REQ_NOT,
                };
                let sn = (self.arm_sn.load(Ordering::Acquire) & 3) as u8;
                let ci = self.lock().cons_index;
                arm.set([
                    ci,
                    (self.cqn << 8) | (2 << 5) | (u32::from(sn) << 3) | u32::from(cmd),
                ]);
                wmb();
                self.uar
                    .write64(CQ_DOORBELL, doorbell::arbel_cq_arm(sn, cmd, self.cqn, ci));
            }
        }
    }

    /// Handles a completion event from the event queue.
    pub(crate) fn completion_event(&self) {
        let _ignore = self.arm_sn.fetch_add(1, Ordering::AcqRel);
        match self.handler {
            Some(ref handler) => handler(CqHandle(self.cqn)),
            None => debug!("completion event on CQ {:#x} without handler", self.cqn),
        }
    }

    /// First hardware owned index at or after `cons`, the software owned
    /// run being at most one short of the ring.
    fn producer(&self, cons: u32) -> u32 {
        let last = cons.wrapping_add(self.nent - 1);
        let mut prod = cons;
        while prod != last && self.is_sw_owned(prod) {
            prod = prod.wrapping_add(1);
        }
        prod
    }

    /// Removes every entry of `qpn` from the ring, keeping the order of
    /// the others. Receive WQEs of `srq` referenced by removed entries are
    /// returned to it.
    pub(crate) fn clean(&self, st: &mut CqState, qpn: u32, srq: Option<&Srq>) {
        let mut prod = self.producer(st.cons_index);
        let mut nfreed = 0u32;
        while prod != st.cons_index {
            prod = prod.wrapping_sub(1);
            let raw = self.read_cqe(prod);
            if raw.qpn() == qpn {
                if let Some(srq) = srq {
                    if !raw.is_send() {
                        srq.free_wqe(raw.wqe());
                    }
                }
                nfreed += 1;
            } else if nfreed > 0 {
                self.slot(prod.wrapping_add(nfreed))
                    .put_bytes(0, bytemuck::bytes_of(&raw));
            }
        }

        if nfreed > 0 {
            for i in 0..nfreed {
                self.set_hw_owned(st.cons_index.wrapping_add(i));
            }
            wmb();
            st.cons_index = st.cons_index.wrapping_add(nfreed);
            self.update_cons_index(st, nfreed);
            debug!("cleaned {nfreed} CQEs of QP {qpn:#x} from CQ {:#x}", self.cqn);
        }
    }
}
