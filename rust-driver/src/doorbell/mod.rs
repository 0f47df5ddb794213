//! Doorbell words for both hardware generations.
//!
//! Legacy devices learn about new work only through MMIO writes to the UAR
//! page. Memory-free devices read producer and consumer counters from
//! doorbell records in host memory; MMIO is only used to kick the send
//! engine and to arm completion queues.

#![allow(clippy::as_conversions, clippy::cast_possible_truncation)]

use bilge::prelude::*;

/// Doorbell record table for memory-free mode
pub(crate) mod db_table;

pub(crate) use db_table::{DbRecord, DbRecordType, DoorbellTable};

/// UAR offset of the send doorbell
pub(crate) const SEND_DOORBELL: usize = 0x10;
/// UAR offset of the receive doorbell
pub(crate) const RECV_DOORBELL: usize = 0x18;
/// UAR offset of the CQ doorbell
pub(crate) const CQ_DOORBELL: usize = 0x20;

/// Legacy CQ doorbell command: advance the consumer index
pub(crate) const TAVOR_CQ_INC_CI: u8 = 1;
/// Legacy CQ doorbell command: request notification on any completion
pub(crate) const TAVOR_CQ_REQ_NOT: u8 = 2;
/// Legacy CQ doorbell command: request notification on solicited completions
pub(crate) const TAVOR_CQ_REQ_NOT_SOL: u8 = 3;

/// Memory-free arm command: solicited completions only
pub(crate) const ARBEL_CQ_REQ_NOT_SOL: u8 = 1;
/// Memory-free arm command: any completion
pub(crate) const ARBEL_CQ_REQ_NOT: u8 = 2;

/// Fence flag of the first WQE in a send doorbell
const SEND_DB_FENCE: u32 = 1 << 5;

/// How a work queue tells hardware about new entries.
#[derive(Debug)]
pub(crate) enum DoorbellMode {
    /// MMIO doorbell per batch
    Legacy,
    /// Producer counter in a doorbell record
    MemoryFree(DbRecord),
}

impl DoorbellMode {
    /// Record index placed in the context image, 0 in legacy mode.
    pub(crate) fn record_index(&self) -> u32 {
        match *self {
            DoorbellMode::Legacy => 0,
            DoorbellMode::MemoryFree(ref rec) => rec.index(),
        }
    }

    /// Zeroes the producer counter of a memory-free record.
    pub(crate) fn reset(&self) {
        if let DoorbellMode::MemoryFree(ref rec) = *self {
            rec.set_counter(0);
        }
    }
}

#[bitsize(32)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct QpDoorbellTail {
    size: u6,
    rsvd0: u2,
    qpn: u24,
}

#[bitsize(32)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct RecvDoorbellTail {
    nreq: u8,
    qn: u24,
}

#[bitsize(32)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct ArbelSendDoorbellHead {
    op_fence: u8,
    counter: u16,
    nreq: u8,
}

#[bitsize(32)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct CqDoorbellCmd {
    cqn: u24,
    cmd: u4,
    sn: u4,
}

/// Legacy send doorbell for a batch starting at `wqe_addr`.
///
/// `wqe_addr` is the offset of the first WQE of the batch inside the QP
/// buffer; `op` and `size` are the opcode and size, in 16-byte units, of
/// that WQE.
pub(crate) fn tavor_send(wqe_addr: u32, fence: bool, op: u8, qpn: u32, size: u8) -> [u32; 2] {
    let fence = if fence { SEND_DB_FENCE } else { 0 };
    let tail = QpDoorbellTail::new(u6::masked_new(size), u2::new(0), u24::masked_new(qpn));
    [wqe_addr | fence | u32::from(op), u32::from(tail)]
}

/// Memory-free send doorbell covering `nreq` WQEs starting at counter `head`.
pub(crate) fn arbel_send(
    nreq: u32,
    head: u32,
    fence: bool,
    op: u8,
    qpn: u32,
    size: u8,
) -> [u32; 2] {
    let fence = if fence { SEND_DB_FENCE as u8 } else { 0 };
    let hi = ArbelSendDoorbellHead::new(fence | op, head as u16, nreq as u8);
    let tail = QpDoorbellTail::new(u6::masked_new(size), u2::new(0), u24::masked_new(qpn));
    [u32::from(hi), u32::from(tail)]
}

/// Legacy receive doorbell for `nreq` WQEs starting at `wqe_addr`.
///
/// An `nreq` of 256 is encoded as 0.
pub(crate) fn tavor_recv(wqe_addr: u32, size: u8, qn: u32, nreq: u32) -> [u32; 2] {
    let tail = RecvDoorbellTail::new(nreq as u8, u24::masked_new(qn));
    [wqe_addr | u32::from(size), u32::from(tail)]
}

/// Legacy CQ doorbell.
pub(crate) fn tavor_cq(cmd: u8, cqn: u32, param: u32) -> [u32; 2] {
    let word = CqDoorbellCmd::new(u24::masked_new(cqn), u4::masked_new(cmd), u4::new(0));
    [u32::from(word), param]
}

/// Memory-free CQ arm doorbell.
pub(crate) fn arbel_cq_arm(sn: u8, cmd: u8, cqn: u32, cons_index: u32) -> [u32; 2] {
    let word = CqDoorbellCmd::new(
        u24::masked_new(cqn),
        u4::masked_new(cmd),
        u4::masked_new(sn),
    );
    [u32::from(word), cons_index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tavor_send_layout() {
        let words = tavor_send(0x1000, true, 0x0a, 0x12_3456, 3);
        assert_eq!(words, [0x1000 | (1 << 5) | 0x0a, 0x1234_5603]);
    }

    #[test]
    fn arbel_send_layout() {
        let words = arbel_send(2, 0x1_0005, false, 0x08, 0x40, 4);
        assert_eq!(words, [(2 << 24) | (0x0005 << 8) | 0x08, (0x40 << 8) | 4]);
    }

    #[test]
    fn recv_nreq_256_wraps_to_zero() {
        assert_eq!(tavor_recv(0x200, 2, 7, 256), [0x202, 7 << 8]);
        assert_eq!(tavor_recv(0x200, 2, 7, 5), [0x202, (7 << 8) | 5]);
    }

    #[test]
    fn cq_doorbell_layout() {
        assert_eq!(
            tavor_cq(TAVOR_CQ_INC_CI, 0x41, 9),
            [(1 << 24) | 0x41, 9]
        );
        assert_eq!(
            tavor_cq(TAVOR_CQ_REQ_NOT_SOL, 0x41, 0xffff_ffff),
            [(3 << 24) | 0x41, 0xffff_ffff]
        );
        assert_eq!(
            arbel_cq_arm(3, ARBEL_CQ_REQ_NOT, 0x41, 17),
            [(3 << 28) | (2 << 24) | 0x41, 17]
        );
    }
}
