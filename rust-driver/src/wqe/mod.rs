//! Work queue entry layout.
//!
//! Every WQE starts with a 16-byte next segment linking it to the following
//! WQE, followed by 16-byte aligned transport segments. All fields are
//! big-endian.

#![allow(clippy::as_conversions, clippy::cast_possible_truncation)]

use bilge::prelude::*;

use crate::{mem::RingSlot, types::Sge};

/// Send WQEs: RC, UC and UD encoders
pub(crate) mod send;

/// Receive WQEs for QP receive queues and SRQs
pub(crate) mod recv;

/// Special QP header construction
pub(crate) mod mlx;

/// Hardware opcodes placed in the next segment.
pub(crate) mod opcode {
    pub(crate) const RDMA_WRITE: u8 = 0x08;
    pub(crate) const RDMA_WRITE_IMM: u8 = 0x09;
    pub(crate) const SEND: u8 = 0x0a;
    pub(crate) const SEND_IMM: u8 = 0x0b;
    pub(crate) const RDMA_READ: u8 = 0x10;
    pub(crate) const ATOMIC_CS: u8 = 0x11;
    pub(crate) const ATOMIC_FA: u8 = 0x12;
    pub(crate) const BIND_MW: u8 = 0x18;
}

/// Size of every segment granule
pub(crate) const SEG_SIZE: usize = 16;
/// Size of the next segment
pub(crate) const NEXT_SEG_SIZE: usize = 16;
/// Size of an address vector
pub(crate) const AV_SIZE: usize = 32;
/// Size of a UD segment in either generation
pub(crate) const UD_SEG_SIZE: usize = 48;
/// Size of a remote address segment
pub(crate) const RADDR_SEG_SIZE: usize = 16;
/// Size of an atomic segment
pub(crate) const ATOMIC_SEG_SIZE: usize = 16;
/// Size of a data segment
pub(crate) const DATA_SEG_SIZE: usize = 16;
/// Size of the inline segment header
pub(crate) const INLINE_HDR_SIZE: usize = 4;

/// Lkey terminating a scatter list shorter than the slot allows
pub(crate) const INVAL_LKEY: u32 = 0x100;
/// Byte count flag marking an inline segment
pub(crate) const INLINE_SEG: u32 = 1 << 31;

/// `nda_op` word: address of the next WQE and its opcode.
#[bitsize(32)]
#[derive(Clone, Copy, DebugBits, DefaultBits, FromBits)]
pub(crate) struct NextNdaOp {
    pub(crate) opcode: u5,
    rsvd0: u1,
    nda: u26,
}

impl NextNdaOp {
    /// Links to the 64-byte aligned WQE at `addr`.
    pub(crate) fn link(addr: u32, opcode: u8) -> Self {
        Self::new(u5::masked_new(opcode), u1::new(0), u26::masked_new(addr >> 6))
    }

    pub(crate) fn addr(self) -> u32 {
        self.nda().value() << 6
    }
}

/// `ee_nds` word: size of the next WQE in 16-byte units plus fence and
/// doorbell-boundary flags.
#[bitsize(32)]
#[derive(Clone, Copy, DebugBits, DefaultBits, FromBits)]
pub(crate) struct NextEeNds {
    pub(crate) size: u6,
    pub(crate) fence: bool,
    pub(crate) dbd: bool,
    ee: u24,
}

impl NextEeNds {
    pub(crate) fn with(size: u8, fence: bool, dbd: bool) -> Self {
        Self::new(u6::masked_new(size), fence, dbd, u24::new(0))
    }
}

/// `flags` word of the next segment. The special QP bits are only set on
/// MLX WQEs.
#[bitsize(32)]
#[derive(Clone, Copy, DebugBits, DefaultBits, FromBits)]
pub(crate) struct NextFlags {
    pub(crate) always_one: bool,
    pub(crate) solicit: bool,
    pub(crate) event: bool,
    pub(crate) cq_update: bool,
    rsvd0: u4,
    pub(crate) sl: u4,
    pub(crate) static_rate: u3,
    rsvd1: u1,
    pub(crate) slr: bool,
    pub(crate) vl15: bool,
    rsvd2: u14,
}

impl NextFlags {
    pub(crate) fn for_send(signaled: bool, solicited: bool) -> Self {
        let mut flags = Self::default();
        flags.set_always_one(true);
        flags.set_cq_update(signaled);
        flags.set_solicit(solicited);
        flags
    }
}

/// Field offsets of the next segment
pub(crate) mod next {
    pub(crate) const NDA_OP: usize = 0;
    pub(crate) const EE_NDS: usize = 4;
    pub(crate) const FLAGS: usize = 8;
    pub(crate) const IMM: usize = 12;
    /// Remote LID of an MLX WQE, sharing the immediate word
    pub(crate) const RLID: usize = 12;
    pub(crate) const VCRC: usize = 14;
}

/// Reads the link of a WQE.
pub(crate) fn read_next(slot: &RingSlot<'_>) -> (NextNdaOp, NextEeNds) {
    (
        NextNdaOp::from(slot.get_be32(next::NDA_OP)),
        NextEeNds::from(slot.get_be32(next::EE_NDS)),
    )
}

/// Writes a data segment at `offset`.
pub(crate) fn put_data_seg(slot: &RingSlot<'_>, offset: usize, sge: &Sge) {
    slot.put_be32(offset, sge.length);
    slot.put_be32(offset + 4, sge.lkey);
    slot.put_be64(offset + 8, sge.addr);
}

/// Writes a terminating data segment.
pub(crate) fn put_inval_seg(slot: &RingSlot<'_>, offset: usize) {
    slot.put_be32(offset, 0);
    slot.put_be32(offset + 4, INVAL_LKEY);
    slot.put_be64(offset + 8, 0);
}

/// Writes a remote address segment at `offset`.
pub(crate) fn put_raddr_seg(slot: &RingSlot<'_>, offset: usize, raddr: u64, rkey: u32) {
    slot.put_be64(offset, raddr);
    slot.put_be32(offset + 8, rkey);
    slot.put_be32(offset + 12, 0);
}

/// Writes an atomic segment at `offset`.
pub(crate) fn put_atomic_seg(slot: &RingSlot<'_>, offset: usize, swap_add: u64, compare: u64) {
    slot.put_be64(offset, swap_add);
    slot.put_be64(offset + 8, compare);
}

/// Rounds `n` up to the segment granule.
pub(crate) fn seg_align(n: usize) -> usize {
    n.next_multiple_of(SEG_SIZE)
}

/// Size in 16-byte units, as stored in `ee_nds` and doorbells.
pub(crate) fn size16(bytes: usize) -> u8 {
    (bytes / SEG_SIZE) as u8
}
