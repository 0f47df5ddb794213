//! Work requests, completions and handles exchanged with verbs consumers.

#![allow(clippy::as_conversions, clippy::cast_possible_truncation)]

use bytemuck::{Pod, Zeroable};

/// A scatter/gather entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sge {
    /// Address of the buffer
    pub addr: u64,
    /// Length of the buffer in bytes
    pub length: u32,
    /// Local key of the registered region
    pub lkey: u32,
}

/// Local data of a send request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Data gathered by hardware from registered memory
    Gather(Vec<Sge>),
    /// Data copied into the WQE
    Inline(Vec<u8>),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Gather(Vec::new())
    }
}

impl Payload {
    /// Total bytes described by the payload.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        match *self {
            Payload::Gather(ref sges) => sges.iter().map(|s| u64::from(s.length)).sum(),
            Payload::Inline(ref data) => data.len() as u64,
        }
    }
}

/// Operation of a send request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SendOp {
    Send,
    SendWithImm {
        imm: u32,
    },
    RdmaWrite {
        remote_addr: u64,
        rkey: u32,
    },
    RdmaWriteWithImm {
        remote_addr: u64,
        rkey: u32,
        imm: u32,
    },
    RdmaRead {
        remote_addr: u64,
        rkey: u32,
    },
    CompareSwap {
        remote_addr: u64,
        rkey: u32,
        compare: u64,
        swap: u64,
    },
    FetchAdd {
        remote_addr: u64,
        rkey: u32,
        add: u64,
    },
}

impl SendOp {
    /// Immediate data carried by the request.
    #[must_use]
    pub fn imm(&self) -> Option<u32> {
        match *self {
            SendOp::SendWithImm { imm } | SendOp::RdmaWriteWithImm { imm, .. } => Some(imm),
            _ => None,
        }
    }

    /// Returns `true` for send and send-with-immediate.
    #[must_use]
    pub fn is_send(&self) -> bool {
        matches!(*self, SendOp::Send | SendOp::SendWithImm { .. })
    }
}

/// Per-request flags of a send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    /// Wait for earlier RDMA reads and atomics before executing
    pub fence: bool,
    /// Generate a completion
    pub signaled: bool,
    /// Set the solicited event bit at the responder
    pub solicited: bool,
}

/// Global routing information of an address vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalRoute {
    /// Destination GID
    pub dgid: [u8; 16],
    /// Index of the source GID in the port GID table
    pub sgid_index: u8,
    /// Flow label, 20 bits
    pub flow_label: u32,
    /// Hop limit
    pub hop_limit: u8,
    /// Traffic class
    pub traffic_class: u8,
}

/// Path to a remote port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressVector {
    /// Local port, starting at 1
    pub port: u8,
    /// Destination LID
    pub dlid: u16,
    /// Service level
    pub sl: u8,
    /// Source path bits
    pub src_path_bits: u8,
    /// Static rate code
    pub static_rate: u8,
    /// Global route, if the path leaves the subnet
    pub grh: Option<GlobalRoute>,
}

impl Default for AddressVector {
    fn default() -> Self {
        Self {
            port: 1,
            dlid: 0,
            sl: 0,
            src_path_bits: 0,
            static_rate: 0,
            grh: None,
        }
    }
}

/// Hardware image of an address vector.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct RawAv {
    port_pd: [u8; 4],
    rsvd0: u8,
    g_slid: u8,
    dlid: [u8; 2],
    rsvd1: u8,
    gid_index: u8,
    msg_sr: u8,
    hop_limit: u8,
    sl_tclass_flowlabel: [u8; 4],
    dgid: [u8; 16],
}

impl AddressVector {
    /// Lays the vector out as hardware reads it.
    pub(crate) fn to_raw(&self, pd: u32) -> RawAv {
        let mut raw = RawAv::zeroed();
        raw.port_pd = ((u32::from(self.port) << 24) | (pd & 0x00ff_ffff)).to_be_bytes();
        raw.g_slid = self.src_path_bits & 0x7f;
        raw.dlid = self.dlid.to_be_bytes();
        raw.msg_sr = (3 << 4) | (self.static_rate & 0xf);
        let mut sl_tclass_flowlabel = u32::from(self.sl) << 28;
        if let Some(grh) = self.grh {
            raw.g_slid |= 0x80;
            raw.gid_index = grh.sgid_index;
            raw.hop_limit = grh.hop_limit;
            raw.dgid = grh.dgid;
            sl_tclass_flowlabel |=
                (u32::from(grh.traffic_class) << 20) | (grh.flow_label & 0x000f_ffff);
        }
        raw.sl_tclass_flowlabel = sl_tclass_flowlabel.to_be_bytes();
        raw
    }
}

/// An address handle created by the memory registration layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressHandle {
    /// Key of the memory holding the vector
    pub key: u32,
    /// Address of the vector in that memory
    pub addr: u64,
    /// Protection domain of the handle
    pub pd: u32,
    /// The vector itself
    pub av: AddressVector,
}

/// Destination of a datagram send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdDest {
    /// Address handle of the remote port
    pub ah: AddressHandle,
    /// Remote QP number
    pub remote_qpn: u32,
    /// Remote Q_Key; the high bit selects the local QP's Q_Key
    pub remote_qkey: u32,
    /// P_Key index for GSI sends
    pub pkey_index: u16,
}

/// A send work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendWr {
    /// Opaque id returned in the completion
    pub wr_id: u64,
    /// Operation
    pub op: SendOp,
    /// Flags
    pub flags: SendFlags,
    /// Local data
    pub payload: Payload,
    /// Destination, required on UD and special QPs
    pub ud: Option<UdDest>,
}

impl SendWr {
    /// A signaled send of the given entries.
    #[must_use]
    pub fn send(wr_id: u64, sg_list: Vec<Sge>) -> Self {
        Self {
            wr_id,
            op: SendOp::Send,
            flags: SendFlags {
                signaled: true,
                ..SendFlags::default()
            },
            payload: Payload::Gather(sg_list),
            ud: None,
        }
    }
}

/// A receive work request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecvWr {
    /// Opaque id returned in the completion
    pub wr_id: u64,
    /// Buffers to scatter into
    pub sg_list: Vec<Sge>,
}

/// Outcome of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalQpOpError,
    LocalEecOpError,
    LocalProtectionError,
    WrFlushError,
    MwBindError,
    BadResponseError,
    LocalAccessError,
    RemoteInvalidRequestError,
    RemoteAccessError,
    RemoteOperationError,
    RetryExceededError,
    RnrRetryExceededError,
    LocalRddViolationError,
    RemoteInvalidRdRequest,
    RemoteAbortedError,
    InvalidEecnError,
    InvalidEecStateError,
    GeneralError,
}

/// Kind of completed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    CompSwap,
    FetchAdd,
    BindMw,
    Recv,
    RecvRdmaWithImm,
    /// Opcode of an error completion; not meaningful
    Invalid,
}

/// A completion returned by [`crate::VerbsOps::poll_cq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// Id of the completed request
    pub wr_id: u64,
    /// Outcome
    pub status: WcStatus,
    /// Kind of work
    pub opcode: WcOpcode,
    /// Bytes transferred
    pub byte_len: u32,
    /// Immediate data
    pub imm_data: Option<u32>,
    /// Local QP number
    pub qp_num: u32,
    /// Source QP of a datagram receive
    pub src_qp: u32,
    /// Source LID of a receive
    pub slid: u16,
    /// Service level of a receive
    pub sl: u8,
    /// Destination path bits of a receive
    pub dlid_path_bits: u8,
    /// P_Key index of a GSI receive
    pub pkey_index: u16,
    /// A GRH precedes the received data
    pub grh: bool,
    /// Vendor syndrome of an error completion
    pub vendor_err: u8,
}

impl WorkCompletion {
    pub(crate) fn new(wr_id: u64, qp_num: u32) -> Self {
        Self {
            wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Invalid,
            byte_len: 0,
            imm_data: None,
            qp_num,
            src_qp: 0,
            slid: 0,
            sl: 0,
            dlid_path_bits: 0,
            pkey_index: 0,
            grh: false,
            vendor_err: 0,
        }
    }
}

/// A CQE that could not be turned into a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CqeDecodeError {
    /// The CQE names a QP that does not exist
    #[error("CQE for unknown QP {qpn:#08x} at CQ index {index}")]
    UnknownQp {
        /// QP number in the CQE
        qpn: u32,
        /// Consumer index of the CQE
        index: u32,
    },

    /// The CQE points at a WQE outside of the QP's ring
    #[error("CQE for QP {qpn:#08x} names WQE {wqe:#x} outside of its ring at CQ index {index}")]
    WqeOutOfRange {
        /// QP number in the CQE
        qpn: u32,
        /// WQE address in the CQE
        wqe: u32,
        /// Consumer index of the CQE
        index: u32,
    },
}

/// Result of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Polled {
    /// Decoded completions in ring order
    pub completions: Vec<WorkCompletion>,
    /// CQEs that were consumed without producing a completion
    pub errors: Vec<CqeDecodeError>,
}

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u32);

        impl $name {
            /// Object number as known to hardware.
            #[must_use]
            pub fn number(self) -> u32 {
                self.0
            }
        }
    };
}

handle!(
    /// Handle of a queue pair
    QpHandle
);
handle!(
    /// Handle of a completion queue
    CqHandle
);
handle!(
    /// Handle of a shared receive queue
    SrqHandle
);

/// Which completions trigger the completion handler after arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    /// Only completions of solicited events
    Solicited,
    /// Any completion
    NextCompletion,
}

/// Called when an armed CQ gets a completion.
pub type CompletionHandler = Box<dyn Fn(CqHandle) + Send + Sync>;

/// Called on asynchronous QP events.
pub type QpEventHandler = Box<dyn Fn(QpHandle, crate::QpEvent) + Send + Sync>;

/// Attributes of a CQ reported by `query_cq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqAttr {
    /// Usable entries
    pub cqe: u32,
}

/// Attributes of an SRQ reported by `query_srq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrqAttr {
    /// Maximum outstanding receives
    pub max_wr: u32,
    /// Maximum scatter entries per receive
    pub max_sge: u32,
    /// Receives currently posted
    pub outstanding: u32,
}

/// Requested sizes of an SRQ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SrqInitAttr {
    /// Protection domain
    pub pd: u32,
    /// Maximum outstanding receives
    pub max_wr: u32,
    /// Maximum scatter entries per receive
    pub max_sge: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn av_layout_matches_hardware() {
        let av = AddressVector {
            port: 2,
            dlid: 0x1234,
            sl: 5,
            src_path_bits: 3,
            static_rate: 2,
            grh: Some(GlobalRoute {
                dgid: [0xfe; 16],
                sgid_index: 1,
                flow_label: 0xabcde,
                hop_limit: 64,
                traffic_class: 7,
            }),
        };
        let raw = av.to_raw(0x10);
        let bytes = bytemuck::bytes_of(&raw);
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..4], &[2, 0, 0, 0x10]);
        assert_eq!(bytes[5], 0x83);
        assert_eq!(&bytes[6..8], &[0x12, 0x34]);
        assert_eq!(bytes[9], 1);
        assert_eq!(bytes[10], 0x32);
        assert_eq!(bytes[11], 64);
        assert_eq!(&bytes[12..16], &((5 << 28) | (7 << 20) | 0xabcde_u32).to_be_bytes());
        assert_eq!(&bytes[16..32], &[0xfe; 16]);
    }

    #[test]
    fn payload_len_sums_entries() {
        let p = Payload::Gather(vec![
            Sge { addr: 0, length: 10, lkey: 1 },
            Sge { addr: 0, length: 22, lkey: 1 },
        ]);
        assert_eq!(p.byte_len(), 32);
        assert_eq!(Payload::Inline(vec![0; 7]).byte_len(), 7);
    }
}
