//! Completion queue entry layout and decoding.

use bytemuck::{Pod, Zeroable};

use crate::{
    constants::{ATOMIC_BYTE_LEN, CQE_SIZE},
    types::{WcOpcode, WcStatus, WorkCompletion},
    wqe::opcode,
};

/// Owner bit: set while hardware owns the entry
pub(crate) const OWNER_HW: u8 = 0x80;
/// Opcode bits marking an error CQE
const ERROR_OPCODE_MASK: u8 = 0xfe;
/// Send flag of a success CQE
const IS_SEND_BIT: u8 = 0x80;
/// GRH present flag in `g_mlpath`
const GRH_BIT: u8 = 0x80;

/// Syndrome of a flushed WQE
pub(crate) const SYNDROME_WR_FLUSH_ERR: u8 = 0x05;

/// Offset of the owner byte
pub(crate) const OWNER_OFFSET: usize = 31;

/// Receive opcodes (low five bits of the transport opcode)
const RECV_SEND_LAST_IMM: u8 = 0x03;
const RECV_SEND_ONLY_IMM: u8 = 0x05;
const RECV_WRITE_LAST_IMM: u8 = 0x09;
const RECV_WRITE_ONLY_IMM: u8 = 0x0b;

/// A success CQE as written by hardware.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct RawCqe {
    pub(crate) my_qpn: [u8; 4],
    pub(crate) my_ee: [u8; 4],
    pub(crate) rqpn: [u8; 4],
    pub(crate) sl_ipok: u8,
    pub(crate) g_mlpath: u8,
    pub(crate) rlid: [u8; 2],
    pub(crate) imm_etype_pkey_eec: [u8; 4],
    pub(crate) byte_cnt: [u8; 4],
    pub(crate) wqe: [u8; 4],
    pub(crate) opcode: u8,
    pub(crate) is_send: u8,
    pub(crate) rsvd: u8,
    pub(crate) owner: u8,
}

/// An error CQE, sharing the slot layout of [`RawCqe`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct RawErrCqe {
    pub(crate) my_qpn: [u8; 4],
    pub(crate) rsvd0: [u8; 12],
    pub(crate) syndrome: u8,
    pub(crate) vendor_err: u8,
    pub(crate) db_cnt: [u8; 2],
    pub(crate) rsvd1: [u8; 4],
    pub(crate) wqe: [u8; 4],
    pub(crate) opcode: u8,
    pub(crate) rsvd2: [u8; 2],
    pub(crate) owner: u8,
}

const _: () = assert!(std::mem::size_of::<RawCqe>() == CQE_SIZE);
const _: () = assert!(std::mem::size_of::<RawErrCqe>() == CQE_SIZE);

impl RawCqe {
    pub(crate) fn from_bytes(bytes: &[u8; CQE_SIZE]) -> Self {
        bytemuck::cast(*bytes)
    }

    pub(crate) fn qpn(&self) -> u32 {
        u32::from_be_bytes(self.my_qpn) & 0x00ff_ffff
    }

    pub(crate) fn wqe(&self) -> u32 {
        u32::from_be_bytes(self.wqe)
    }

    pub(crate) fn is_hw_owned(&self) -> bool {
        self.owner & OWNER_HW != 0
    }

    pub(crate) fn is_error(&self) -> bool {
        self.opcode & ERROR_OPCODE_MASK == ERROR_OPCODE_MASK
    }

    /// Send or receive, for both success and error entries.
    pub(crate) fn is_send(&self) -> bool {
        if self.is_error() {
            self.opcode & 1 != 0
        } else {
            self.is_send & IS_SEND_BIT != 0
        }
    }

    pub(crate) fn as_err(&self) -> RawErrCqe {
        bytemuck::cast(*self)
    }
}

impl RawErrCqe {
    pub(crate) fn db_cnt(&self) -> u16 {
        u16::from_be_bytes(self.db_cnt)
    }
}

/// Maps a syndrome to the completion status.
pub(crate) fn syndrome_status(syndrome: u8) -> WcStatus {
    match syndrome {
        0x01 => WcStatus::LocalLengthError,
        0x02 => WcStatus::LocalQpOpError,
        0x03 => WcStatus::LocalEecOpError,
        0x04 => WcStatus::LocalProtectionError,
        SYNDROME_WR_FLUSH_ERR => WcStatus::WrFlushError,
        0x06 => WcStatus::MwBindError,
        0x10 => WcStatus::BadResponseError,
        0x11 => WcStatus::LocalAccessError,
        0x12 => WcStatus::RemoteInvalidRequestError,
        0x13 => WcStatus::RemoteAccessError,
        0x14 => WcStatus::RemoteOperationError,
        0x15 => WcStatus::RetryExceededError,
        0x16 => WcStatus::RnrRetryExceededError,
        0x20 => WcStatus::LocalRddViolationError,
        0x21 => WcStatus::RemoteInvalidRdRequest,
        0x22 => WcStatus::RemoteAbortedError,
        0x23 => WcStatus::InvalidEecnError,
        0x24 => WcStatus::InvalidEecStateError,
        _ => WcStatus::GeneralError,
    }
}

/// Fills the status fields of an error completion.
pub(crate) fn decode_error(cqe: &RawErrCqe, wc: &mut WorkCompletion) {
    wc.status = syndrome_status(cqe.syndrome);
    wc.vendor_err = cqe.vendor_err;
    wc.opcode = WcOpcode::Invalid;
}

/// Fills a success completion from the CQE.
pub(crate) fn decode_success(cqe: &RawCqe, is_send: bool, wc: &mut WorkCompletion) {
    wc.status = WcStatus::Success;
    let imm = u32::from_be_bytes(cqe.imm_etype_pkey_eec);
    let byte_cnt = u32::from_be_bytes(cqe.byte_cnt);
    if is_send {
        wc.opcode = match cqe.opcode {
            opcode::RDMA_WRITE => WcOpcode::RdmaWrite,
            opcode::RDMA_WRITE_IMM => {
                wc.imm_data = Some(imm);
                WcOpcode::RdmaWrite
            }
            opcode::SEND => WcOpcode::Send,
            opcode::SEND_IMM => {
                wc.imm_data = Some(imm);
                WcOpcode::Send
            }
            opcode::RDMA_READ => {
                wc.byte_len = byte_cnt;
                WcOpcode::RdmaRead
            }
            opcode::ATOMIC_CS => {
                wc.byte_len = ATOMIC_BYTE_LEN;
                WcOpcode::CompSwap
            }
            opcode::ATOMIC_FA => {
                wc.byte_len = ATOMIC_BYTE_LEN;
                WcOpcode::FetchAdd
            }
            opcode::BIND_MW => WcOpcode::BindMw,
            _ => WcOpcode::Invalid,
        };
    } else {
        wc.byte_len = byte_cnt;
        wc.opcode = match cqe.opcode & 0x1f {
            RECV_SEND_LAST_IMM | RECV_SEND_ONLY_IMM => {
                wc.imm_data = Some(imm);
                WcOpcode::Recv
            }
            RECV_WRITE_LAST_IMM | RECV_WRITE_ONLY_IMM => {
                wc.imm_data = Some(imm);
                WcOpcode::RecvRdmaWithImm
            }
            _ => WcOpcode::Recv,
        };
        wc.slid = u16::from_be_bytes(cqe.rlid);
        wc.sl = cqe.sl_ipok >> 4;
        wc.src_qp = u32::from_be_bytes(cqe.rqpn) & 0x00ff_ffff;
        wc.dlid_path_bits = cqe.g_mlpath & 0x7f;
        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        {
            wc.pkey_index = (imm >> 16) as u16;
        }
        wc.grh = cqe.g_mlpath & GRH_BIT != 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cqe(opcode: u8, is_send: u8) -> RawCqe {
        RawCqe {
            my_qpn: 0x0012_3456_u32.to_be_bytes(),
            imm_etype_pkey_eec: 0x0003_beef_u32.to_be_bytes(),
            byte_cnt: 100_u32.to_be_bytes(),
            opcode,
            is_send,
            ..RawCqe::default()
        }
    }

    #[test]
    fn send_opcodes_decode() {
        let mut wc = WorkCompletion::new(0, 0);
        decode_success(&cqe(opcode::RDMA_WRITE_IMM, 0x80), true, &mut wc);
        assert_eq!(wc.opcode, WcOpcode::RdmaWrite);
        assert!(wc.imm_data.is_some());

        let mut wc = WorkCompletion::new(0, 0);
        decode_success(&cqe(opcode::ATOMIC_FA, 0x80), true, &mut wc);
        assert_eq!((wc.opcode, wc.byte_len), (WcOpcode::FetchAdd, 8));

        let mut wc = WorkCompletion::new(0, 0);
        decode_success(&cqe(opcode::RDMA_READ, 0x80), true, &mut wc);
        assert_eq!((wc.opcode, wc.byte_len), (WcOpcode::RdmaRead, 100));

        let mut wc = WorkCompletion::new(0, 0);
        decode_success(&cqe(opcode::SEND, 0x80), true, &mut wc);
        assert_eq!((wc.opcode, wc.imm_data, wc.byte_len), (WcOpcode::Send, None, 0));
    }

    #[test]
    fn recv_opcodes_decode() {
        let mut raw = cqe(0x0b, 0);
        raw.rlid = 0x0042_u16.to_be_bytes();
        raw.sl_ipok = 0x50;
        raw.g_mlpath = 0x83;
        raw.rqpn = 0xff00_0007_u32.to_be_bytes();
        let mut wc = WorkCompletion::new(0, 0);
        decode_success(&raw, false, &mut wc);
        assert_eq!(wc.opcode, WcOpcode::RecvRdmaWithImm);
        assert_eq!(wc.imm_data, Some(0x0003_beef));
        assert_eq!(wc.byte_len, 100);
        assert_eq!(wc.slid, 0x42);
        assert_eq!(wc.sl, 5);
        assert_eq!(wc.src_qp, 7);
        assert_eq!(wc.dlid_path_bits, 3);
        assert_eq!(wc.pkey_index, 3);
        assert!(wc.grh);

        let mut wc = WorkCompletion::new(0, 0);
        decode_success(&cqe(0x04, 0), false, &mut wc);
        assert_eq!((wc.opcode, wc.imm_data), (WcOpcode::Recv, None));
        let mut wc = WorkCompletion::new(0, 0);
        decode_success(&cqe(0x25, 0), false, &mut wc);
        assert_eq!((wc.opcode, wc.imm_data), (WcOpcode::Recv, Some(0x0003_beef)));
    }

    #[test]
    fn error_cqe_classification() {
        let send_err = cqe(0xff, 0);
        assert!(send_err.is_error());
        assert!(send_err.is_send());
        let recv_err = cqe(0xfe, 0x80);
        assert!(recv_err.is_error());
        assert!(!recv_err.is_send());
        assert!(!cqe(opcode::SEND, 0).is_send());
        assert_eq!(send_err.qpn(), 0x12_3456);
    }

    #[test]
    fn syndromes_map_to_status() {
        assert_eq!(syndrome_status(0x01), WcStatus::LocalLengthError);
        assert_eq!(syndrome_status(0x05), WcStatus::WrFlushError);
        assert_eq!(syndrome_status(0x15), WcStatus::RetryExceededError);
        assert_eq!(syndrome_status(0x16), WcStatus::RnrRetryExceededError);
        assert_eq!(syndrome_status(0x10), WcStatus::BadResponseError);
        assert_eq!(syndrome_status(0x24), WcStatus::InvalidEecStateError);
        assert_eq!(syndrome_status(0x7f), WcStatus::GeneralError);

        let mut raw = cqe(0xfe, 0).as_err();
        raw.syndrome = 0x13;
        raw.vendor_err = 0x42;
        let mut wc = WorkCompletion::new(0, 0);
        decode_error(&raw, &mut wc);
        assert_eq!(wc.status, WcStatus::RemoteAccessError);
        assert_eq!(wc.vendor_err, 0x42);
    }
}
