//! Special QP sends.
//!
//! QP0 and QP1 traffic is sent as raw packets: software builds the LRH,
//! BTH and DETH headers in a per-QP header buffer and the WQE gathers them
//! ahead of the payload. The ICRC is left to hardware.

#![allow(clippy::as_conversions, clippy::cast_possible_truncation)]

use bilge::prelude::*;

use crate::{
    constants::{PERMISSIVE_LID, UD_HEADER_SIZE},
    error::{HcaError, Result},
    mem::{DmaBuf, RingSlot},
    types::{SendWr, Sge},
};

use super::{
    next, put_data_seg, send::{hw_opcode, put_header, put_payload, Encoded}, size16, NextFlags,
    DATA_SEG_SIZE, NEXT_SEG_SIZE,
};

const LRH_BYTES: usize = 8;
const BTH_BYTES: usize = 12;
const DETH_BYTES: usize = 8;
const IMM_BYTES: usize = 4;
const ICRC_BYTES: usize = 4;

/// Link next header: BTH follows the LRH
const LNH_IBA_LOCAL: u8 = 2;
/// BTH opcode of a UD send-only packet
const UD_SEND_ONLY: u8 = 0x64;
/// BTH opcode of a UD send-only packet with immediate
const UD_SEND_ONLY_IMM: u8 = 0x65;
/// Q_Keys with this bit set select the Q_Key of the sending QP
const QKEY_FROM_QP: u32 = 1 << 31;

/// Per special QP state used to build headers.
#[derive(Debug)]
pub(crate) struct MlxHeader<'a> {
    /// Header buffer, `UD_HEADER_SIZE` bytes per send slot
    pub(crate) buf: &'a DmaBuf,
    /// Key covering the header buffer
    pub(crate) lkey: u32,
    /// Sending as QP0
    pub(crate) is_qp0: bool,
    /// P_Key placed in the BTH
    pub(crate) pkey: u16,
    /// Q_Key of the QP
    pub(crate) qkey: u32,
    /// PSN of this packet
    pub(crate) psn: u32,
}

/// Checks what [`encode`] cannot express.
pub(crate) fn validate(wr: &SendWr) -> Result<()> {
    if wr.ud.is_some_and(|ud| ud.ah.av.grh.is_some()) {
        return Err(HcaError::InvalidParameter(
            "global route on special QP".into(),
        ));
    }
    Ok(())
}

#[bitsize(16)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct LrhHead {
    lnh: u2,
    rsvd0: u2,
    sl: u4,
    lver: u4,
    vl: u4,
}

#[bitsize(8)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct BthFlags {
    tver: u4,
    pad: u2,
    mig: bool,
    se: bool,
}

/// Packs the headers for `wr` at slot `ind` of the header buffer and
/// returns their length.
fn pack_headers(hdr: &MlxHeader<'_>, ind: u32, wr: &SendWr) -> usize {
    let view = RingSlot::new(hdr.buf, ind as usize * UD_HEADER_SIZE, UD_HEADER_SIZE);
    let Some(ud) = wr.ud else {
        return 0;
    };
    let av = ud.ah.av;
    let imm = wr.op.imm();
    let payload = wr.payload.byte_len() as usize;
    let imm_bytes = if imm.is_some() { IMM_BYTES } else { 0 };
    let len = LRH_BYTES + BTH_BYTES + DETH_BYTES + imm_bytes;
    let words = (len + payload + ICRC_BYTES + 3) / 4;

    let vl = if hdr.is_qp0 { 15 } else { 0 };
    let lrh = LrhHead::new(
        u2::new(LNH_IBA_LOCAL),
        u2::new(0),
        u4::masked_new(av.sl),
        u4::new(0),
        u4::new(vl),
    );
    let slid = if av.dlid == PERMISSIVE_LID {
        PERMISSIVE_LID
    } else {
        u16::from(av.src_path_bits & 0x7f)
    };
    view.put_be16(0, u16::from(lrh));
    view.put_be16(2, av.dlid);
    view.put_be16(4, (words & 0x7ff) as u16);
    view.put_be16(6, slid);

    let bth = BthFlags::new(
        u4::new(0),
        u2::masked_new(((4 - (payload & 3)) & 3) as u8),
        false,
        wr.flags.solicited,
    );
    view.put_u8(8, if imm.is_some() { UD_SEND_ONLY_IMM } else { UD_SEND_ONLY });
    view.put_u8(9, u8::from(bth));
    view.put_be16(10, hdr.pkey);
    view.put_be32(12, ud.remote_qpn & 0x00ff_ffff);
    view.put_be32(16, hdr.psn & 0x00ff_ffff);

    let qkey = if ud.remote_qkey & QKEY_FROM_QP != 0 {
        hdr.qkey
    } else {
        ud.remote_qkey
    };
    view.put_be32(20, qkey);
    view.put_be32(24, u32::from(!hdr.is_qp0));
    if let Some(imm) = imm {
        view.put_be32(28, imm);
    }
    len
}

/// Encodes a special QP send into `slot`, the WQE at index `ind`.
///
/// The request must have passed both `send::validate` and [`validate`].
pub(crate) fn encode(
    slot: &RingSlot<'_>,
    ind: u32,
    wr: &SendWr,
    hdr: &MlxHeader<'_>,
    sig_all: bool,
) -> Encoded {
    put_header(slot, wr, sig_all);
    let header_len = pack_headers(hdr, ind, wr);
    let dlid = wr.ud.map_or(0, |ud| ud.ah.av.dlid);
    let sl = wr.ud.map_or(0, |ud| ud.ah.av.sl);

    let mut flags = NextFlags::from(slot.get_be32(next::FLAGS));
    flags.set_solicit(false);
    flags.set_always_one(false);
    flags.set_vl15(hdr.is_qp0);
    flags.set_slr(dlid == PERMISSIVE_LID);
    flags.set_sl(u4::masked_new(sl));
    slot.put_be32(next::FLAGS, u32::from(flags));
    slot.put_be16(next::RLID, dlid);
    slot.put_be16(next::VCRC, 0);

    let header_seg = Sge {
        addr: hdr.buf.addr() + (ind as usize * UD_HEADER_SIZE) as u64,
        length: header_len as u32,
        lkey: hdr.lkey,
    };
    put_data_seg(slot, NEXT_SEG_SIZE, &header_seg);
    let mut off = put_payload(slot, NEXT_SEG_SIZE + DATA_SEG_SIZE, &wr.payload);

    slot.put_be32(off, (1 << 31) | ICRC_BYTES as u32);
    slot.put_be32(off + 4, 0);
    off += DATA_SEG_SIZE;

    Encoded {
        op: hw_opcode(&wr.op),
        size: size16(off),
        fence: wr.flags.fence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AddressHandle, GlobalRoute, SendOp, UdDest};

    fn gsi_send(dlid: u16, qkey: u32) -> SendWr {
        let mut ah = AddressHandle::default();
        ah.av.dlid = dlid;
        ah.av.sl = 3;
        ah.av.src_path_bits = 1;
        SendWr {
            op: SendOp::SendWithImm { imm: 0xfeed },
            ud: Some(UdDest {
                ah,
                remote_qpn: 1,
                remote_qkey: qkey,
                pkey_index: 0,
            }),
            ..SendWr::send(
                7,
                vec![Sge {
                    addr: 0x4000,
                    length: 255,
                    lkey: 9,
                }],
            )
        }
    }

    #[test]
    fn qp1_send_builds_headers() {
        let hdr_buf = DmaBuf::alloc(4 * UD_HEADER_SIZE).unwrap();
        let wqe_buf = DmaBuf::alloc(128).unwrap();
        let slot = RingSlot::new(&wqe_buf, 0, 128);
        let hdr = MlxHeader {
            buf: &hdr_buf,
            lkey: 0x100,
            is_qp0: false,
            pkey: 0xffff,
            qkey: 0x8001_0000,
            psn: 0x0100_0005,
        };
        let wr = gsi_send(0x22, 0x8000_0000);
        let enc = encode(&slot, 2, &wr, &hdr, false);
        assert_eq!(enc.size, 4);

        // next segment: CQ update kept, solicit and bit 0 cleared, SL 3
        assert_eq!(slot.get_be32(next::FLAGS), (1 << 3) | (3 << 8));
        assert_eq!(slot.get_be16(next::RLID), 0x22);
        // header reference
        assert_eq!(slot.get_be32(16), 32);
        assert_eq!(slot.get_be32(20), 0x100);
        // ICRC
        assert_eq!(slot.get_be32(48), (1 << 31) | 4);

        let h = RingSlot::new(&hdr_buf, 2 * UD_HEADER_SIZE, UD_HEADER_SIZE);
        assert_eq!(h.get_u8(0), 0x00);
        assert_eq!(h.get_u8(1), (3 << 4) | 2);
        assert_eq!(h.get_be16(2), 0x22);
        assert_eq!(h.get_be16(4), ((32 + 255 + 4 + 3) / 4) as u16);
        assert_eq!(h.get_be16(6), 1);
        assert_eq!(h.get_u8(8), UD_SEND_ONLY_IMM);
        assert_eq!(h.get_u8(9), 1 << 4);
        assert_eq!(h.get_be16(10), 0xffff);
        assert_eq!(h.get_be32(16), 5);
        // Q_Key taken from the QP
        assert_eq!(h.get_be32(20), 0x8001_0000);
        assert_eq!(h.get_be32(24), 1);
        assert_eq!(h.get_be32(28), 0xfeed);
    }

    #[test]
    fn qp0_permissive_lid_sets_vl15_and_slr() {
        let hdr_buf = DmaBuf::alloc(UD_HEADER_SIZE).unwrap();
        let wqe_buf = DmaBuf::alloc(128).unwrap();
        let slot = RingSlot::new(&wqe_buf, 0, 128);
        let hdr = MlxHeader {
            buf: &hdr_buf,
            lkey: 0x100,
            is_qp0: true,
            pkey: 0xffff,
            qkey: 0,
            psn: 0,
        };
        let mut wr = gsi_send(PERMISSIVE_LID, 0x1234);
        wr.op = SendOp::Send;
        encode(&slot, 0, &wr, &hdr, true);
        assert_eq!(
            slot.get_be32(next::FLAGS),
            (1 << 17) | (1 << 16) | (1 << 3) | (3 << 8)
        );
        let h = RingSlot::new(&hdr_buf, 0, UD_HEADER_SIZE);
        assert_eq!(h.get_u8(0), 15 << 4);
        assert_eq!(h.get_be16(6), PERMISSIVE_LID);
        assert_eq!(h.get_u8(8), UD_SEND_ONLY);
        assert_eq!(h.get_be32(20), 0x1234);
        assert_eq!(h.get_be32(24), 0);
        assert_eq!(slot.get_be32(16), 28);
    }

    #[test]
    fn global_route_is_rejected() {
        let mut wr = gsi_send(1, 0);
        if let Some(ref mut ud) = wr.ud {
            ud.ah.av.grh = Some(GlobalRoute::default());
        }
        assert!(validate(&wr).is_err());
        assert!(validate(&gsi_send(1, 0)).is_ok());
    }
}
