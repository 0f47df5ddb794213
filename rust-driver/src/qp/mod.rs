#![allow(
    clippy::as_conversions,     // u32 sizes to usize offsets
    clippy::cast_possible_truncation
)]

/// Attribute types of `modify_qp` and `create_qp`
mod attr;

/// QP context mailbox
mod context;

/// State transitions and `query_qp`
mod modify;

/// Send and receive posting
mod post;

/// QP states and the legality table
mod state;


use std::sync::{
    atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering},
    Arc,
};

use log::debug;
use parking_lot::Mutex;

pub use attr::{AccessFlags, MigState, PathMtu, QpAttr, QpAttrMask, QpCap, QpEvent, QpInitAttr};
pub use state::{QpState, Transition, Transport};

use crate::{
    config::{DeviceLimits, HcaConfig},
    constants::{MIN_WQE_SHIFT, UD_HEADER_SIZE},
    cq::CompletionQueue,
    device::{Firmware, SpecialQpKind, UarAdaptor},
    doorbell::{DbRecordType, DoorbellMode, DoorbellTable},
    error::{HcaError, Result},
    mem::DmaBuf,
    ring::{RingGeometry, WorkQueue},
    srq::Srq,
    table::ObjectTable,
    types::{QpEventHandler, QpHandle},
    wqe::{self, DATA_SEG_SIZE, INLINE_HDR_SIZE, NEXT_SEG_SIZE, RADDR_SEG_SIZE, UD_SEG_SIZE},
};

/// Collaborators a QP operation needs besides the QP itself.
pub(crate) struct QpEnv<'a> {
    pub(crate) fw: &'a dyn Firmware,
    pub(crate) config: &'a HcaConfig,
    pub(crate) cqs: &'a ObjectTable<CompletionQueue>,
    pub(crate) srqs: &'a ObjectTable<Srq>,
}

/// Fields written by `modify_qp` and read when building later mailboxes.
/// The mutex doubles as the modify lock.
#[derive(Debug, Default)]
pub(crate) struct QpCached {
    pub(crate) access: AccessFlags,
    pub(crate) resp_depth: u8,
    pub(crate) port: u8,
    pub(crate) alt_port: u8,
}

/// State of QP0 or QP1 used to build MLX headers.
#[derive(Debug)]
pub(crate) struct SpecialQp {
    pub(crate) kind: SpecialQpKind,
    pub(crate) port: u8,
    /// One `UD_HEADER_SIZE` header per send slot
    pub(crate) header: DmaBuf,
    pub(crate) pkey: u16,
    pub(crate) pkey_index: AtomicU16,
    pub(crate) qkey: AtomicU32,
    pub(crate) send_psn: AtomicU32,
}

impl SpecialQp {
    fn store_attrs(&self, attr: &QpAttr, mask: QpAttrMask) {
        if mask.contains(QpAttrMask::PKEY_INDEX) {
            self.pkey_index.store(attr.pkey_index, Ordering::Relaxed);
        }
        if mask.contains(QpAttrMask::QKEY) {
            self.qkey.store(attr.qkey, Ordering::Relaxed);
        }
        if mask.contains(QpAttrMask::SQ_PSN) {
            self.send_psn.store(attr.sq_psn, Ordering::Relaxed);
        }
    }
}

/// Buffer layout of a QP: the receive ring first, the send ring after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QpLayout {
    pub(crate) rq: RingGeometry,
    pub(crate) sq: RingGeometry,
    pub(crate) max_inline: u32,
    pub(crate) bytes: usize,
}

/// Smallest WQE shift whose slot holds `size` bytes.
fn wqe_shift_for(size: usize) -> u8 {
    let mut shift = MIN_WQE_SHIFT;
    while (1usize << shift) < size {
        shift += 1;
    }
    shift
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Transport segment bytes that precede the payload in the largest send.
fn send_transport_bytes(transport: Transport) -> usize {
    match transport {
        Transport::Mlx => 2 * DATA_SEG_SIZE,
        Transport::Ud => UD_SEG_SIZE,
        Transport::Uc | Transport::Rc => RADDR_SEG_SIZE,
    }
}

/// Sizes both rings of a QP from the requested capabilities.
pub(crate) fn plan(
    cap: &QpCap,
    transport: Transport,
    limits: &DeviceLimits,
    memfree: bool,
    has_srq: bool,
) -> Result<QpLayout> {
    let max_recv_wr = if has_srq { 0 } else { cap.max_recv_wr };
    if cap.max_send_wr > limits.max_wqes || max_recv_wr > limits.max_wqes {
        return Err(HcaError::InvalidParameter(format!(
            "queue depth {}/{} above {}",
            cap.max_send_wr, max_recv_wr, limits.max_wqes
        )));
    }
    if cap.max_send_sge > limits.max_sg || cap.max_recv_sge > limits.max_sg {
        return Err(HcaError::InvalidParameter(format!(
            "scatter/gather entries {}/{} above {}",
            cap.max_send_sge, cap.max_recv_sge, limits.max_sg
        )));
    }
    // header reference and ICRC take two entries
    if transport == Transport::Mlx && cap.max_send_sge + 2 > limits.max_sg {
        return Err(HcaError::InvalidParameter(format!(
            "special QP needs two spare send entries, {} requested of {}",
            cap.max_send_sge, limits.max_sg
        )));
    }

    let depth = |wr: u32| {
        if memfree && wr > 0 {
            wr.next_power_of_two()
        } else {
            wr
        }
    };
    let max_desc_sz = limits.max_desc_sz as usize;

    let rq_max_gs = cap.max_recv_sge as usize;
    let rq_size = NEXT_SEG_SIZE + rq_max_gs * DATA_SEG_SIZE;
    if rq_size > max_desc_sz {
        return Err(HcaError::InvalidParameter(format!(
            "receive WQE of {rq_size} bytes above {max_desc_sz}"
        )));
    }
    let rq_shift = wqe_shift_for(rq_size);

    let inline_gs = align_up(cap.max_inline_data as usize + INLINE_HDR_SIZE, 16) / 16;
    let sq_max_gs = (cap.max_send_sge as usize).max(inline_gs);
    let mut sq_size = sq_max_gs * DATA_SEG_SIZE + send_transport_bytes(transport);
    if transport == Transport::Rc {
        // an atomic needs raddr, atomic and one data segment
        sq_size = sq_size.max(3 * 16);
    }
    sq_size = sq_size.max(32) + NEXT_SEG_SIZE;
    if sq_size > max_desc_sz {
        return Err(HcaError::InvalidParameter(format!(
            "send WQE of {sq_size} bytes above {max_desc_sz}"
        )));
    }
    let sq_shift = wqe_shift_for(sq_size);

    let max_sg = limits.max_sg as usize;
    let max_data = max_desc_sz.min(1 << sq_shift) - NEXT_SEG_SIZE - send_transport_bytes(transport);
    let rq = RingGeometry {
        max: depth(max_recv_wr),
        wqe_shift: rq_shift,
        max_gs: max_sg.min((max_desc_sz.min(1 << rq_shift) - NEXT_SEG_SIZE) / DATA_SEG_SIZE)
            as u32,
        offset: 0,
    };
    let send_wqe_offset = align_up(rq.bytes(), 1 << sq_shift);
    let sq = RingGeometry {
        max: depth(cap.max_send_wr),
        wqe_shift: sq_shift,
        max_gs: max_sg.min(max_data / DATA_SEG_SIZE) as u32,
        offset: send_wqe_offset,
    };
    Ok(QpLayout {
        rq,
        sq,
        max_inline: (max_data - INLINE_HDR_SIZE) as u32,
        bytes: send_wqe_offset + sq.bytes(),
    })
}

/// Where a new QP lives and what it is attached to.
pub(crate) struct QpCreate<'a> {
    pub(crate) qpn: u32,
    pub(crate) init: QpInitAttr,
    pub(crate) special: Option<(SpecialQpKind, u8)>,
    pub(crate) config: &'a HcaConfig,
    pub(crate) db_table: Option<&'a DoorbellTable>,
    pub(crate) uar: Arc<dyn UarAdaptor>,
}

/// A queue pair.
pub(crate) struct QueuePair {
    qpn: u32,
    transport: Transport,
    special: Option<SpecialQp>,
    pd: u32,
    /// Key covering the WQE buffer
    lkey: u32,
    send_cqn: u32,
    recv_cqn: u32,
    srqn: Option<u32>,
    sq: WorkQueue,
    rq: WorkQueue,
    max_inline: u32,
    sq_sig_all: bool,
    memfree: bool,
    /// Legacy send requests per doorbell
    doorbell_batch: u32,
    state: AtomicU8,
    /// Send queue is draining after a move to SQD
    draining: AtomicBool,
    cached: Mutex<QpCached>,
    uar: Arc<dyn UarAdaptor>,
    event_handler: Option<QpEventHandler>,
}

impl std::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("qpn", &self.qpn)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .field("sq", &self.sq)
            .field("rq", &self.rq)
            .finish_non_exhaustive()
    }
}

impl QueuePair {
    /// Allocates and initialises both rings. The QP starts in RESET.
    pub(crate) fn new(params: QpCreate<'_>) -> Result<Self> {
        let QpCreate {
            qpn,
            init,
            special,
            config,
            db_table,
            uar,
        } = params;
        let transport = if special.is_some() {
            Transport::Mlx
        } else {
            init.transport
        };
        let memfree = config.is_memfree();
        let layout = plan(
            &init.cap,
            transport,
            &config.limits,
            memfree,
            init.srq.is_some(),
        )?;

        let buf = Arc::new(DmaBuf::alloc(layout.bytes)?);
        let (sq_db, rq_db) = match db_table {
            Some(table) if memfree => {
                let sq_db = DoorbellMode::MemoryFree(table.alloc(DbRecordType::Sq, qpn)?);
                // receives go to the SRQ, which owns its own record
                let rq_db = if init.srq.is_some() {
                    DoorbellMode::Legacy
                } else {
                    DoorbellMode::MemoryFree(table.alloc(DbRecordType::Rq, qpn)?)
                };
                (sq_db, rq_db)
            }
            _ => (DoorbellMode::Legacy, DoorbellMode::Legacy),
        };
        let rq = WorkQueue::new(layout.rq, rq_db, Arc::clone(&buf));
        let sq = WorkQueue::new(layout.sq, sq_db, buf);
        wqe::recv::init_recv_ring(&rq, memfree);
        if memfree {
            wqe::send::init_send_ring(&sq);
        }

        let special = match special {
            Some((kind, port)) => Some(SpecialQp {
                kind,
                port,
                header: DmaBuf::alloc(layout.sq.max as usize * UD_HEADER_SIZE)?,
                pkey: config.default_pkey,
                pkey_index: AtomicU16::new(0),
                qkey: AtomicU32::new(0),
                send_psn: AtomicU32::new(0),
            }),
            None => None,
        };

        debug!(
            "QP {qpn:#x} created: {transport:?}, sq {}x{}B, rq {}x{}B",
            layout.sq.max,
            layout.sq.wqe_size(),
            layout.rq.max,
            layout.rq.wqe_size()
        );
        Ok(Self {
            qpn,
            transport,
            special,
            pd: init.pd,
            lkey: config.reserved_lkey,
            send_cqn: init.send_cq.number(),
            recv_cqn: init.recv_cq.number(),
            srqn: init.srq.map(|s| s.number()),
            sq,
            rq,
            max_inline: layout.max_inline,
            sq_sig_all: init.sq_sig_all,
            memfree,
            doorbell_batch: config.legacy_doorbell_batch,
            state: AtomicU8::new(QpState::Reset.to_u8()),
            draining: AtomicBool::new(false),
            cached: Mutex::new(QpCached::default()),
            uar,
            event_handler: init.event_handler,
        })
    }

    pub(crate) fn number(&self) -> u32 {
        self.qpn
    }

    pub(crate) fn sq(&self) -> &WorkQueue {
        &self.sq
    }

    pub(crate) fn rq(&self) -> &WorkQueue {
        &self.rq
    }

    pub(crate) fn send_cqn(&self) -> u32 {
        self.send_cqn
    }

    pub(crate) fn recv_cqn(&self) -> u32 {
        self.recv_cqn
    }

    pub(crate) fn srqn(&self) -> Option<u32> {
        self.srqn
    }

    pub(crate) fn special_kind(&self) -> Option<SpecialQpKind> {
        self.special.as_ref().map(|sp| sp.kind)
    }

    pub(crate) fn state(&self) -> QpState {
        QpState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: QpState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Capabilities actually granted.
    pub(crate) fn cap(&self) -> QpCap {
        QpCap {
            max_send_wr: self.sq.geometry().max,
            max_recv_wr: self.rq.geometry().max,
            max_send_sge: self.sq.geometry().max_gs,
            max_recv_sge: self.rq.geometry().max_gs,
            max_inline_data: self.max_inline,
        }
    }

    /// Delivers an asynchronous event to the consumer.
    pub(crate) fn handle_event(&self, event: QpEvent) {
        if event == QpEvent::SqDrained {
            self.draining.store(false, Ordering::Release);
        }
        match self.event_handler {
            Some(ref handler) => handler(QpHandle(self.qpn), event),
            None => debug!("QP {:#x}: {event:?} without handler", self.qpn),
        }
    }

    /// Removes this QP's entries from its CQs. Receive WQEs taken from the
    /// SRQ are returned to it.
    pub(crate) fn clean_cqs(
        &self,
        cqs: &ObjectTable<CompletionQueue>,
        srqs: &ObjectTable<Srq>,
    ) {
        let srq = self.srqn.and_then(|n| srqs.get(n));
        if let Some(cq) = cqs.get(self.recv_cqn) {
            let mut st = cq.lock();
            cq.clean(&mut st, self.qpn, srq.as_deref());
        }
        if self.send_cqn != self.recv_cqn {
            if let Some(cq) = cqs.get(self.send_cqn) {
                let mut st = cq.lock();
                cq.clean(&mut st, self.qpn, None);
            }
        }
    }

    /// Empties both rings. Must not be called with a CQ lock held.
    fn reset_rings(&self) {
        {
            let mut ctx = self.sq.lock();
            self.sq.reset(&mut ctx);
        }
        let mut ctx = self.rq.lock();
        self.rq.reset(&mut ctx);
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        debug!("QP {:#x} released", self.qpn);
    }
}
