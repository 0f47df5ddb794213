#![allow(clippy::as_conversions, clippy::cast_possible_truncation)]

use crate::{
    error::{HcaError, Result},
    mem::RingSlot,
    qp::Transport,
    ring::WorkQueue,
    types::{Payload, SendOp, SendWr},
};

use super::{
    next, opcode, put_atomic_seg, put_data_seg, put_raddr_seg, seg_align, size16, NextFlags,
    ATOMIC_SEG_SIZE, AV_SIZE, DATA_SEG_SIZE, INLINE_HDR_SIZE, INLINE_SEG, NEXT_SEG_SIZE,
    RADDR_SEG_SIZE, UD_SEG_SIZE,
};

/// Per QP limits a send request is checked against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendLimits {
    pub(crate) transport: Transport,
    pub(crate) memfree: bool,
    pub(crate) max_gs: u32,
    pub(crate) max_inline: u32,
    pub(crate) wqe_size: usize,
}

/// What the encoder wrote, needed to link the WQE and ring the doorbell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Encoded {
    /// Hardware opcode
    pub(crate) op: u8,
    /// Size in 16-byte units
    pub(crate) size: u8,
    /// Fence flag of the request
    pub(crate) fence: bool,
}

/// Hardware opcode of a send operation.
pub(crate) fn hw_opcode(op: &SendOp) -> u8 {
    match *op {
        SendOp::Send => opcode::SEND,
        SendOp::SendWithImm { .. } => opcode::SEND_IMM,
        SendOp::RdmaWrite { .. } => opcode::RDMA_WRITE,
        SendOp::RdmaWriteWithImm { .. } => opcode::RDMA_WRITE_IMM,
        SendOp::RdmaRead { .. } => opcode::RDMA_READ,
        SendOp::CompareSwap { .. } => opcode::ATOMIC_CS,
        SendOp::FetchAdd { .. } => opcode::ATOMIC_FA,
    }
}

/// Bytes of transport segments between the next segment and the payload.
fn transport_bytes(wr: &SendWr, transport: Transport) -> usize {
    match transport {
        Transport::Rc | Transport::Uc => match wr.op {
            SendOp::RdmaWrite { .. }
            | SendOp::RdmaWriteWithImm { .. }
            | SendOp::RdmaRead { .. } => RADDR_SEG_SIZE,
            SendOp::CompareSwap { .. } | SendOp::FetchAdd { .. } => {
                RADDR_SEG_SIZE + ATOMIC_SEG_SIZE
            }
            SendOp::Send | SendOp::SendWithImm { .. } => 0,
        },
        Transport::Ud => UD_SEG_SIZE,
        // header reference plus ICRC
        Transport::Mlx => 2 * DATA_SEG_SIZE,
    }
}

fn payload_bytes(payload: &Payload) -> usize {
    match *payload {
        Payload::Gather(ref sges) => sges.len() * DATA_SEG_SIZE,
        Payload::Inline(ref data) => seg_align(data.len() + INLINE_HDR_SIZE),
    }
}

/// Checks a request before anything is written to the ring.
pub(crate) fn validate(wr: &SendWr, lim: &SendLimits) -> Result<()> {
    let allowed = match lim.transport {
        Transport::Rc => true,
        Transport::Uc => matches!(
            wr.op,
            SendOp::Send
                | SendOp::SendWithImm { .. }
                | SendOp::RdmaWrite { .. }
                | SendOp::RdmaWriteWithImm { .. }
        ),
        Transport::Ud | Transport::Mlx => wr.op.is_send(),
    };
    if !allowed {
        return Err(HcaError::InvalidParameter(format!(
            "{:?} not supported on {:?} QP",
            wr.op, lim.transport
        )));
    }
    if matches!(lim.transport, Transport::Ud | Transport::Mlx) && wr.ud.is_none() {
        return Err(HcaError::InvalidParameter(
            "datagram send without destination".into(),
        ));
    }
    match wr.payload {
        Payload::Gather(ref sges) => {
            if sges.len() > lim.max_gs as usize {
                return Err(HcaError::TooManySge {
                    requested: sges.len(),
                    max: lim.max_gs as usize,
                });
            }
        }
        Payload::Inline(ref data) => {
            if lim.transport == Transport::Mlx {
                return Err(HcaError::InvalidParameter(
                    "inline data on special QP".into(),
                ));
            }
            if data.len() > lim.max_inline as usize {
                return Err(HcaError::InlineTooLong {
                    len: data.len(),
                    max: lim.max_inline as usize,
                });
            }
        }
    }
    let needed = NEXT_SEG_SIZE + transport_bytes(wr, lim.transport) + payload_bytes(&wr.payload);
    if needed > lim.wqe_size {
        return Err(HcaError::InvalidParameter(format!(
            "request needs {needed} bytes, slot holds {}",
            lim.wqe_size
        )));
    }
    Ok(())
}

/// Writes the next segment header of a fresh WQE. The link words stay zero
/// until the WQE is published.
pub(crate) fn put_header(slot: &RingSlot<'_>, wr: &SendWr, sig_all: bool) {
    slot.put_be32(next::NDA_OP, 0);
    slot.put_be32(next::EE_NDS, 0);
    let flags = NextFlags::for_send(wr.flags.signaled || sig_all, wr.flags.solicited);
    slot.put_be32(next::FLAGS, u32::from(flags));
    slot.put_be32(next::IMM, wr.op.imm().unwrap_or(0));
}

/// Writes the payload at `off` and returns the offset past it.
pub(crate) fn put_payload(slot: &RingSlot<'_>, mut off: usize, payload: &Payload) -> usize {
    match *payload {
        Payload::Gather(ref sges) => {
            for sge in sges {
                put_data_seg(slot, off, sge);
                off += DATA_SEG_SIZE;
            }
            off
        }
        Payload::Inline(ref data) => {
            slot.put_be32(off, INLINE_SEG | data.len() as u32);
            slot.put_bytes(off + INLINE_HDR_SIZE, data);
            off + seg_align(data.len() + INLINE_HDR_SIZE)
        }
    }
}

/// Encodes an RC, UC or UD send request into `slot`.
///
/// The request must have passed [`validate`].
pub(crate) fn encode(slot: &RingSlot<'_>, wr: &SendWr, lim: &SendLimits, sig_all: bool) -> Encoded {
    put_header(slot, wr, sig_all);
    let mut off = NEXT_SEG_SIZE;
    match lim.transport {
        Transport::Rc | Transport::Uc | Transport::Mlx => match wr.op {
            SendOp::RdmaWrite { remote_addr, rkey }
            | SendOp::RdmaWriteWithImm {
                remote_addr, rkey, ..
            }
            | SendOp::RdmaRead { remote_addr, rkey } => {
                put_raddr_seg(slot, off, remote_addr, rkey);
                off += RADDR_SEG_SIZE;
            }
            SendOp::CompareSwap {
                remote_addr,
                rkey,
                compare,
                swap,
            } => {
                put_raddr_seg(slot, off, remote_addr, rkey);
                put_atomic_seg(slot, off + RADDR_SEG_SIZE, swap, compare);
                off += RADDR_SEG_SIZE + ATOMIC_SEG_SIZE;
            }
            SendOp::FetchAdd {
                remote_addr,
                rkey,
                add,
            } => {
                put_raddr_seg(slot, off, remote_addr, rkey);
                put_atomic_seg(slot, off + RADDR_SEG_SIZE, add, 0);
                off += RADDR_SEG_SIZE + ATOMIC_SEG_SIZE;
            }
            SendOp::Send | SendOp::SendWithImm { .. } => {}
        },
        Transport::Ud => {
            if let Some(ref ud) = wr.ud {
                if lim.memfree {
                    let av = ud.ah.av.to_raw(ud.ah.pd);
                    slot.put_bytes(off, bytemuck::bytes_of(&av));
                } else {
                    slot.put_be32(off, 0);
                    slot.put_be32(off + 4, ud.ah.key);
                    slot.put_be64(off + 8, ud.ah.addr);
                    slot.zero(off + 16, 16);
                }
                slot.put_be32(off + AV_SIZE, ud.remote_qpn);
                slot.put_be32(off + AV_SIZE + 4, ud.remote_qkey);
                slot.zero(off + AV_SIZE + 8, 8);
            }
            off += UD_SEG_SIZE;
        }
    }
    off = put_payload(slot, off, &wr.payload);
    Encoded {
        op: hw_opcode(&wr.op),
        size: size16(off),
        fence: wr.flags.fence,
    }
}

/// Prelinks a memory-free send ring. Hardware follows these links and
/// learns how many entries are valid from the doorbell.
pub(crate) fn init_send_ring(wq: &WorkQueue) {
    let max = wq.geometry().max;
    for i in 0..max {
        wq.slot(i)
            .put_be32(next::NDA_OP, wq.wqe_addr((i + 1) % max));
    }
}
