//! Helpers shared by unit tests: a started context over emulated firmware,
//! QP bring-up, and CQE builders that play the part of hardware.

use std::sync::{Arc, Once};

use crate::{
    config::{DoorbellKind, HcaConfig},
    cq::{
        cqe::{RawCqe, RawErrCqe},
        CompletionQueue,
    },
    device::emulated::{EmulatedFirmware, RecordingUar},
    qp::{
        AccessFlags, PathMtu, QpAttr, QpAttrMask as M, QpCap, QpInitAttr, QpState, QueuePair,
        Transport,
    },
    types::{AddressVector, CqHandle, QpHandle},
    verbs::{HcaContext, VerbsOps},
};

static LOGGER: Once = Once::new();

pub(crate) fn init_logger() {
    LOGGER.call_once(|| {
        let _ignore = env_logger::builder().is_test(true).try_init();
    });
}

/// A success CQE of a send WQE at offset `wqe`.
pub(crate) fn send_cqe(qpn: u32, wqe: u32, opcode: u8) -> RawCqe {
    RawCqe {
        my_qpn: qpn.to_be_bytes(),
        wqe: wqe.to_be_bytes(),
        opcode,
        is_send: 0x80,
        ..RawCqe::default()
    }
}

/// A success CQE of a receive WQE at offset `wqe`.
pub(crate) fn recv_cqe(qpn: u32, wqe: u32, opcode: u8, byte_cnt: u32) -> RawCqe {
    RawCqe {
        my_qpn: qpn.to_be_bytes(),
        wqe: wqe.to_be_bytes(),
        byte_cnt: byte_cnt.to_be_bytes(),
        opcode,
        ..RawCqe::default()
    }
}

/// An error CQE with the given syndrome and doorbell credit.
pub(crate) fn err_cqe(qpn: u32, wqe: u32, is_send: bool, syndrome: u8, db_cnt: u16) -> RawCqe {
    let err = RawErrCqe {
        my_qpn: qpn.to_be_bytes(),
        syndrome,
        db_cnt: db_cnt.to_be_bytes(),
        wqe: wqe.to_be_bytes(),
        opcode: 0xfe | u8::from(is_send),
        ..RawErrCqe::default()
    };
    bytemuck::cast(err)
}

/// A started context with the firmware and doorbell page it drives.
pub(crate) struct TestHca {
    pub(crate) ctx: HcaContext,
    pub(crate) fw: Arc<EmulatedFirmware>,
    pub(crate) uar: Arc<RecordingUar>,
}

impl TestHca {
    pub(crate) fn new(doorbell: DoorbellKind) -> Self {
        Self::with_config(HcaConfig {
            doorbell,
            ..HcaConfig::default()
        })
    }

    pub(crate) fn with_config(config: HcaConfig) -> Self {
        init_logger();
        let fw = Arc::new(EmulatedFirmware::new());
        let uar = Arc::new(RecordingUar::new());
        let ctx = HcaContext::new(config, fw.clone(), uar.clone()).unwrap();
        ctx.device_start().unwrap();
        fw.clear_calls();
        Self { ctx, fw, uar }
    }

    /// The CQ behind `handle`, for writing CQEs as hardware.
    pub(crate) fn cq(&self, handle: CqHandle) -> Arc<CompletionQueue> {
        self.ctx.cq_for_test(handle).unwrap()
    }

    /// The QP behind `handle`, for inspecting its rings.
    pub(crate) fn qp(&self, handle: QpHandle) -> Arc<QueuePair> {
        self.ctx.qp_for_test(handle).unwrap()
    }

    pub(crate) fn create_cq(&self, entries: u32) -> CqHandle {
        self.ctx.create_cq(entries, None).unwrap()
    }

    /// Creates a QP completing to `cq` on both queues.
    pub(crate) fn create_qp(&self, transport: Transport, cq: CqHandle, cap: QpCap) -> QpHandle {
        self.ctx.create_qp(init_attr(transport, cq, cap)).unwrap().0
    }

    /// Walks a QP from RESET to RTS.
    pub(crate) fn to_rts(&self, qp: QpHandle, transport: Transport) {
        for (state, mask) in bring_up(transport) {
            let attr = bring_up_attr(state);
            self.ctx.modify_qp(qp, &attr, mask).unwrap();
        }
    }
}

pub(crate) fn init_attr(transport: Transport, cq: CqHandle, cap: QpCap) -> QpInitAttr {
    QpInitAttr {
        transport,
        pd: 1,
        send_cq: cq,
        recv_cq: cq,
        srq: None,
        cap,
        sq_sig_all: false,
        event_handler: None,
    }
}

pub(crate) fn cap(wr: u32, sge: u32) -> QpCap {
    QpCap {
        max_send_wr: wr,
        max_recv_wr: wr,
        max_send_sge: sge,
        max_recv_sge: sge,
        max_inline_data: 0,
    }
}

/// Attributes good enough for every bring-up step.
pub(crate) fn bring_up_attr(state: QpState) -> QpAttr {
    QpAttr {
        qp_state: state,
        pkey_index: 0,
        port_num: 1,
        qkey: 0x1111_1111,
        qp_access_flags: AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ,
        ah_attr: AddressVector {
            dlid: 0x22,
            ..AddressVector::default()
        },
        path_mtu: PathMtu::Mtu1024,
        dest_qp_num: 0x77,
        rq_psn: 0x100,
        sq_psn: 0x200,
        max_dest_rd_atomic: 4,
        max_rd_atomic: 4,
        min_rnr_timer: 12,
        timeout: 14,
        retry_cnt: 7,
        rnr_retry: 7,
        ..QpAttr::default()
    }
}

/// Target states and masks of RESET -> INIT -> RTR -> RTS.
pub(crate) fn bring_up(transport: Transport) -> [(QpState, M); 3] {
    match transport {
        Transport::Rc => [
            (
                QpState::Init,
                M::STATE | M::PKEY_INDEX | M::PORT | M::ACCESS_FLAGS,
            ),
            (
                QpState::Rtr,
                M::STATE
                    | M::AV
                    | M::PATH_MTU
                    | M::DEST_QPN
                    | M::RQ_PSN
                    | M::MAX_DEST_RD_ATOMIC
                    | M::MIN_RNR_TIMER,
            ),
            (
                QpState::Rts,
                M::STATE
                    | M::SQ_PSN
                    | M::TIMEOUT
                    | M::RETRY_CNT
                    | M::RNR_RETRY
                    | M::MAX_QP_RD_ATOMIC,
            ),
        ],
        Transport::Uc => [
            (
                QpState::Init,
                M::STATE | M::PKEY_INDEX | M::PORT | M::ACCESS_FLAGS,
            ),
            (
                QpState::Rtr,
                M::STATE | M::AV | M::PATH_MTU | M::DEST_QPN | M::RQ_PSN,
            ),
            (QpState::Rts, M::STATE | M::SQ_PSN),
        ],
        Transport::Ud => [
            (QpState::Init, M::STATE | M::PKEY_INDEX | M::PORT | M::QKEY),
            (QpState::Rtr, M::STATE),
            (QpState::Rts, M::STATE | M::SQ_PSN),
        ],
        Transport::Mlx => [
            (QpState::Init, M::STATE | M::PKEY_INDEX | M::QKEY),
            (QpState::Rtr, M::STATE),
            (QpState::Rts, M::STATE | M::SQ_PSN),
        ],
    }
}
