//! QP attributes passed to create, modify and query.

use std::fmt;

use bitflags::bitflags;

use crate::types::{AddressVector, CqHandle, QpEventHandler, SrqHandle};

use super::{QpState, Transport};

bitflags! {
    /// Attributes supplied to `modify_qp`.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct QpAttrMask: u32 {
        const STATE = 1;
        const CUR_STATE = 1 << 1;
        const EN_SQD_ASYNC_NOTIFY = 1 << 2;
        const ACCESS_FLAGS = 1 << 3;
        const PKEY_INDEX = 1 << 4;
        const PORT = 1 << 5;
        const QKEY = 1 << 6;
        const AV = 1 << 7;
        const PATH_MTU = 1 << 8;
        const TIMEOUT = 1 << 9;
        const RETRY_CNT = 1 << 10;
        const RNR_RETRY = 1 << 11;
        const RQ_PSN = 1 << 12;
        const MAX_QP_RD_ATOMIC = 1 << 13;
        const ALT_PATH = 1 << 14;
        const MIN_RNR_TIMER = 1 << 15;
        const SQ_PSN = 1 << 16;
        const MAX_DEST_RD_ATOMIC = 1 << 17;
        const PATH_MIG_STATE = 1 << 18;
        const CAP = 1 << 19;
        const DEST_QPN = 1 << 20;
    }
}

bitflags! {
    /// Remote access rights of a QP.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
    }
}

/// Path MTU.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum PathMtu {
    #[default]
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

impl PathMtu {
    pub(crate) fn from_hw(v: u8) -> Self {
        match v {
            2 => PathMtu::Mtu512,
            3 => PathMtu::Mtu1024,
            4 => PathMtu::Mtu2048,
            5 => PathMtu::Mtu4096,
            _ => PathMtu::Mtu256,
        }
    }
}

/// Automatic path migration state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum MigState {
    #[default]
    Migrated,
    Rearm,
    Armed,
}

impl MigState {
    pub(crate) fn hw(self) -> u32 {
        match self {
            MigState::Armed => 0,
            MigState::Rearm => 1,
            MigState::Migrated => 3,
        }
    }

    pub(crate) fn from_hw(v: u32) -> Self {
        match v {
            0 => MigState::Armed,
            1 => MigState::Rearm,
            _ => MigState::Migrated,
        }
    }
}

/// Work queue sizes of a QP.
///
/// Requested at creation; the values actually granted are returned by
/// `create_qp` and `query_qp`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct QpCap {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

/// Attributes of a QP, as modified and queried.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct QpAttr {
    pub qp_state: QpState,
    pub cur_qp_state: QpState,
    pub path_mtu: PathMtu,
    pub path_mig_state: MigState,
    pub qkey: u32,
    pub rq_psn: u32,
    pub sq_psn: u32,
    pub dest_qp_num: u32,
    pub qp_access_flags: AccessFlags,
    pub cap: QpCap,
    pub ah_attr: AddressVector,
    pub alt_ah_attr: AddressVector,
    pub pkey_index: u16,
    pub alt_pkey_index: u16,
    pub en_sqd_async_notify: bool,
    pub sq_draining: bool,
    pub max_rd_atomic: u8,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub port_num: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub alt_port_num: u8,
    pub alt_timeout: u8,
}

/// Parameters of `create_qp`.
pub struct QpInitAttr {
    /// Transport service; special QPs are created by `create_special_qp`
    pub transport: Transport,
    /// Protection domain
    pub pd: u32,
    /// CQ receiving send completions
    pub send_cq: CqHandle,
    /// CQ receiving receive completions
    pub recv_cq: CqHandle,
    /// Receive from this SRQ instead of a receive queue
    pub srq: Option<SrqHandle>,
    /// Requested queue sizes
    pub cap: QpCap,
    /// Every send request generates a completion
    pub sq_sig_all: bool,
    /// Asynchronous event callback
    pub event_handler: Option<QpEventHandler>,
}

impl fmt::Debug for QpInitAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QpInitAttr")
            .field("transport", &self.transport)
            .field("pd", &self.pd)
            .field("send_cq", &self.send_cq)
            .field("recv_cq", &self.recv_cq)
            .field("srq", &self.srq)
            .field("cap", &self.cap)
            .field("sq_sig_all", &self.sq_sig_all)
            .finish_non_exhaustive()
    }
}

/// Asynchronous QP events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum QpEvent {
    /// The send queue finished draining after a move to SQD
    SqDrained,
    PathMigrated,
    CommEstablished,
    LastWqeReached,
    /// The QP moved to the error state
    CatastrophicError,
    InvalidRequest,
    AccessError,
    PathMigrationError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_set_operations() {
        let m = QpAttrMask::STATE | QpAttrMask::PORT | QpAttrMask::QKEY;
        assert!(m.contains(QpAttrMask::PORT | QpAttrMask::QKEY));
        assert!(!m.contains(QpAttrMask::AV));
        assert_eq!(m.difference(QpAttrMask::STATE), QpAttrMask::PORT | QpAttrMask::QKEY);
        assert_eq!(QpAttrMask::from_bits_truncate(1 << 30), QpAttrMask::empty());
        assert_eq!(format!("{:?}", QpAttrMask::DEST_QPN), "{DEST_QPN}");
    }

    #[test]
    fn mig_state_round_trips_through_context() {
        for m in [MigState::Migrated, MigState::Rearm, MigState::Armed] {
            assert_eq!(MigState::from_hw(m.hw()), m);
        }
    }
}
