//! QP context mailbox.
//!
//! MODIFY_QP and QUERY_QP exchange a 512-byte mailbox: the optional
//! parameter mask at offset 0 followed by the QP context at offset 8.

#![allow(clippy::as_conversions, clippy::cast_possible_truncation)]

use bilge::prelude::*;

use crate::{
    config::HcaConfig,
    constants::{ACK_REQ_FREQ, FLIGHT_LIMIT, QP_MAILBOX_SIZE, RDB_ENTRY_SIZE},
    error::{HcaError, Result},
    types::{AddressVector, GlobalRoute},
};

use super::{
    AccessFlags, MigState, PathMtu, QpAttr, QpAttrMask as M, QpCached, QpState, QueuePair,
    Transport,
};

const CONTEXT_OFFSET: usize = 8;

/// Byte offsets inside the QP context.
mod off {
    pub(super) const FLAGS: usize = 0;
    pub(super) const TAVOR_SCHED_QUEUE: usize = 4;
    pub(super) const MTU_MSGMAX: usize = 8;
    pub(super) const RQ_SIZE_STRIDE: usize = 9;
    pub(super) const SQ_SIZE_STRIDE: usize = 10;
    pub(super) const ARBEL_SCHED_QUEUE: usize = 11;
    pub(super) const USR_PAGE: usize = 12;
    pub(super) const LOCAL_QPN: usize = 16;
    pub(super) const REMOTE_QPN: usize = 20;
    pub(super) const PRI_PATH: usize = 32;
    pub(super) const ALT_PATH: usize = 64;
    pub(super) const PD: usize = 100;
    pub(super) const WQE_LKEY: usize = 108;
    pub(super) const PARAMS1: usize = 112;
    pub(super) const NEXT_SEND_PSN: usize = 120;
    pub(super) const CQN_SND: usize = 124;
    pub(super) const SND_WQE_BASE_L: usize = 128;
    pub(super) const SND_DB_INDEX: usize = 132;
    pub(super) const PARAMS2: usize = 144;
    pub(super) const RNR_NEXTRECVPSN: usize = 148;
    pub(super) const RA_BUFF_INDX: usize = 152;
    pub(super) const CQN_RCV: usize = 156;
    pub(super) const RCV_DB_INDEX: usize = 164;
    pub(super) const QKEY: usize = 168;
    pub(super) const SRQN: usize = 172;
}

/// Byte offsets inside an address path.
mod path {
    pub(super) const PORT_PKEY: usize = 0;
    pub(super) const RNR_RETRY: usize = 4;
    pub(super) const G_MYLMC: usize = 5;
    pub(super) const RLID: usize = 6;
    pub(super) const ACKTO: usize = 8;
    pub(super) const MGID_INDEX: usize = 9;
    pub(super) const STATIC_RATE: usize = 10;
    pub(super) const HOP_LIMIT: usize = 11;
    pub(super) const SL_TCLASS_FLOWLABEL: usize = 12;
    pub(super) const RGID: usize = 16;
}

/// Optional parameter bits.
pub(crate) mod optpar {
    pub(crate) const ALT_ADDR_PATH: u32 = 1 << 0;
    pub(crate) const RRE: u32 = 1 << 1;
    pub(crate) const RAE: u32 = 1 << 2;
    pub(crate) const RWE: u32 = 1 << 3;
    pub(crate) const PKEY_INDEX: u32 = 1 << 4;
    pub(crate) const Q_KEY: u32 = 1 << 5;
    pub(crate) const RNR_TIMEOUT: u32 = 1 << 6;
    pub(crate) const PRIMARY_ADDR_PATH: u32 = 1 << 7;
    pub(crate) const SRA_MAX: u32 = 1 << 8;
    pub(crate) const RRA_MAX: u32 = 1 << 9;
    pub(crate) const PM_STATE: u32 = 1 << 10;
    pub(crate) const PORT_NUM: u32 = 1 << 11;
    pub(crate) const RETRY_COUNT: u32 = 1 << 12;
    pub(crate) const ALT_RNR_RETRY: u32 = 1 << 13;
    pub(crate) const ACK_TIMEOUT: u32 = 1 << 14;
    pub(crate) const RNR_RETRY: u32 = 1 << 15;
    pub(crate) const SCHED_QUEUE: u32 = 1 << 16;
}

/// params1: send side enables
const BIT_SRE: u32 = 1 << 15;
const BIT_SWE: u32 = 1 << 14;
const BIT_SAE: u32 = 1 << 13;
const BIT_SSC: u32 = 1 << 3;
/// params2: receive side enables
const BIT_RRE: u32 = 1 << 15;
const BIT_RWE: u32 = 1 << 14;
const BIT_RAE: u32 = 1 << 13;
const BIT_RIC: u32 = 1 << 4;
const BIT_RSC: u32 = 1 << 3;

/// Maximum message size, log2, for datagram QPs
const UD_MSGMAX: u8 = 11;
/// Maximum message size, log2, for connected QPs
const RC_MSGMAX: u8 = 31;

#[bitsize(32)]
#[derive(Clone, Copy, DebugBits, DefaultBits, FromBits)]
struct ContextFlags {
    rsvd0: u8,
    de: bool,
    rsvd1: u2,
    pm_state: u2,
    rsvd2: u3,
    st: u3,
    rsvd3: u9,
    state: u4,
}

/// A MODIFY_QP / QUERY_QP mailbox.
#[derive(Debug, Clone)]
pub(crate) struct Mailbox(Vec<u8>);

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self(vec![0; QP_MAILBOX_SIZE])
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Self {
        let mut buf = bytes;
        buf.resize(QP_MAILBOX_SIZE, 0);
        Self(buf)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    #[cfg(test)]
    pub(crate) fn optpar(&self) -> u32 {
        self.get32_raw(0)
    }

    fn add_optpar(&mut self, bits: u32) {
        let v = self.get32_raw(0) | bits;
        self.0[..4].copy_from_slice(&v.to_be_bytes());
    }

    fn get32_raw(&self, at: usize) -> u32 {
        u32::from_be_bytes([self.0[at], self.0[at + 1], self.0[at + 2], self.0[at + 3]])
    }

    pub(crate) fn get32(&self, ctx_off: usize) -> u32 {
        self.get32_raw(CONTEXT_OFFSET + ctx_off)
    }

    pub(crate) fn get16(&self, ctx_off: usize) -> u16 {
        let at = CONTEXT_OFFSET + ctx_off;
        u16::from_be_bytes([self.0[at], self.0[at + 1]])
    }

    pub(crate) fn get8(&self, ctx_off: usize) -> u8 {
        self.0[CONTEXT_OFFSET + ctx_off]
    }

    fn put32(&mut self, ctx_off: usize, v: u32) {
        let at = CONTEXT_OFFSET + ctx_off;
        self.0[at..at + 4].copy_from_slice(&v.to_be_bytes());
    }

    fn or32(&mut self, ctx_off: usize, v: u32) {
        let cur = self.get32(ctx_off);
        self.put32(ctx_off, cur | v);
    }

    fn put16(&mut self, ctx_off: usize, v: u16) {
        let at = CONTEXT_OFFSET + ctx_off;
        self.0[at..at + 2].copy_from_slice(&v.to_be_bytes());
    }

    fn put8(&mut self, ctx_off: usize, v: u8) {
        self.0[CONTEXT_OFFSET + ctx_off] = v;
    }

    fn or8(&mut self, ctx_off: usize, v: u8) {
        self.0[CONTEXT_OFFSET + ctx_off] |= v;
    }

    fn put_bytes(&mut self, ctx_off: usize, src: &[u8]) {
        let at = CONTEXT_OFFSET + ctx_off;
        self.0[at..at + src.len()].copy_from_slice(src);
    }

    fn get_bytes<const N: usize>(&self, ctx_off: usize) -> [u8; N] {
        let at = CONTEXT_OFFSET + ctx_off;
        let mut out = [0; N];
        out.copy_from_slice(&self.0[at..at + N]);
        out
    }

    /// Writes the address path fields of `av` at `base`.
    fn put_path(&mut self, base: usize, av: &AddressVector, gid_table_len: u16) -> Result<()> {
        self.put8(base + path::G_MYLMC, av.src_path_bits & 0x7f);
        self.put16(base + path::RLID, av.dlid);
        self.put8(base + path::STATIC_RATE, av.static_rate & 0xf);
        let mut sl_tclass_flowlabel = u32::from(av.sl) << 28;
        if let Some(ref grh) = av.grh {
            if u16::from(grh.sgid_index) >= gid_table_len {
                return Err(HcaError::InvalidParameter(format!(
                    "GID index {} outside of table of {gid_table_len}",
                    grh.sgid_index
                )));
            }
            self.or8(base + path::G_MYLMC, 0x80);
            self.put8(base + path::MGID_INDEX, grh.sgid_index);
            self.put8(base + path::HOP_LIMIT, grh.hop_limit);
            sl_tclass_flowlabel |=
                (u32::from(grh.traffic_class) << 20) | (grh.flow_label & 0x000f_ffff);
            self.put_bytes(base + path::RGID, &grh.dgid);
        }
        self.put32(base + path::SL_TCLASS_FLOWLABEL, sl_tclass_flowlabel);
        Ok(())
    }

    fn get_path(&self, base: usize) -> AddressVector {
        let g_mylmc = self.get8(base + path::G_MYLMC);
        let sltf = self.get32(base + path::SL_TCLASS_FLOWLABEL);
        let grh = (g_mylmc & 0x80 != 0).then(|| GlobalRoute {
            dgid: self.get_bytes::<16>(base + path::RGID),
            sgid_index: self.get8(base + path::MGID_INDEX),
            flow_label: sltf & 0x000f_ffff,
            hop_limit: self.get8(base + path::HOP_LIMIT),
            traffic_class: ((sltf >> 20) & 0xff) as u8,
        });
        AddressVector {
            port: ((self.get32(base + path::PORT_PKEY) >> 24) & 0x3) as u8,
            dlid: self.get16(base + path::RLID),
            sl: (sltf >> 28) as u8,
            src_path_bits: g_mylmc & 0x7f,
            static_rate: self.get8(base + path::STATIC_RATE),
            grh,
        }
    }
}

/// Number of the highest set bit, 1-based.
fn fls(v: u32) -> u32 {
    32 - v.leading_zeros()
}

/// Hardware access bits from the supplied or cached access flags and
/// responder depth. Without responder resources only writes are allowed.
fn hw_access_flags(attr: &QpAttr, mask: M, cached: &QpCached) -> u32 {
    let depth = if mask.contains(M::MAX_DEST_RD_ATOMIC) {
        attr.max_dest_rd_atomic
    } else {
        cached.resp_depth
    };
    let mut access = if mask.contains(M::ACCESS_FLAGS) {
        attr.qp_access_flags
    } else {
        cached.access
    };
    if depth == 0 {
        access = access & AccessFlags::REMOTE_WRITE;
    }
    let mut hw = 0;
    if access.contains(AccessFlags::REMOTE_READ) {
        hw |= BIT_RRE;
    }
    if access.contains(AccessFlags::REMOTE_ATOMIC) {
        hw |= BIT_RAE;
    }
    if access.contains(AccessFlags::REMOTE_WRITE) {
        hw |= BIT_RWE;
    }
    hw
}

/// Builds the MODIFY_QP mailbox for moving `qp` from `cur` to `new`.
pub(crate) fn build(
    qp: &QueuePair,
    cached: &QpCached,
    cur: QpState,
    new: QpState,
    attr: &QpAttr,
    mask: M,
    config: &HcaConfig,
) -> Result<Mailbox> {
    let limits = &config.limits;
    let mut mb = Mailbox::new();

    let mut flags = ContextFlags::from(0);
    flags.set_state(u4::masked_new(new.hw() as u8));
    flags.set_st(u3::masked_new(qp.transport.hw() as u8));
    flags.set_de(true);
    let pm_state = if mask.contains(M::PATH_MIG_STATE) {
        mb.add_optpar(optpar::PM_STATE);
        attr.path_mig_state
    } else {
        MigState::Migrated
    };
    flags.set_pm_state(u2::masked_new(pm_state.hw() as u8));
    mb.put32(off::FLAGS, u32::from(flags));

    match qp.transport {
        Transport::Ud | Transport::Mlx => {
            mb.put8(off::MTU_MSGMAX, ((PathMtu::Mtu2048 as u8) << 5) | UD_MSGMAX);
        }
        Transport::Rc | Transport::Uc => {
            if mask.contains(M::PATH_MTU) {
                mb.put8(off::MTU_MSGMAX, ((attr.path_mtu as u8) << 5) | RC_MSGMAX);
            }
        }
    }

    if qp.memfree {
        let stride = |max: u32, shift: u8| -> u8 {
            let size = if max > 0 { (max.trailing_zeros() as u8) << 3 } else { 0 };
            size | (shift - 4)
        };
        let rq = qp.rq.geometry();
        let sq = qp.sq.geometry();
        mb.put8(off::RQ_SIZE_STRIDE, stride(rq.max, rq.wqe_shift));
        mb.put8(off::SQ_SIZE_STRIDE, stride(sq.max, sq.wqe_shift));
    }

    mb.put32(off::USR_PAGE, config.uar_index);
    mb.put32(off::LOCAL_QPN, qp.qpn);
    if mask.contains(M::DEST_QPN) {
        mb.put32(off::REMOTE_QPN, attr.dest_qp_num & 0x00ff_ffff);
    }

    let pri = off::PRI_PATH;
    let alt = off::ALT_PATH;
    if let Some(ref sp) = qp.special {
        mb.or32(pri + path::PORT_PKEY, u32::from(sp.port) << 24);
    } else if mask.contains(M::PORT) {
        mb.or32(pri + path::PORT_PKEY, u32::from(attr.port_num) << 24);
        mb.add_optpar(optpar::PORT_NUM);
    }
    if mask.contains(M::PKEY_INDEX) {
        mb.or32(pri + path::PORT_PKEY, u32::from(attr.pkey_index));
        mb.add_optpar(optpar::PKEY_INDEX);
    }
    if mask.contains(M::RNR_RETRY) {
        let v = attr.rnr_retry << 5;
        mb.put8(pri + path::RNR_RETRY, v);
        mb.put8(alt + path::RNR_RETRY, v);
        mb.add_optpar(optpar::RNR_RETRY | optpar::ALT_RNR_RETRY);
    }
    if mask.contains(M::AV) {
        mb.put_path(pri, &attr.ah_attr, limits.gid_table_len)?;
        mb.add_optpar(optpar::PRIMARY_ADDR_PATH);
    }
    if qp.transport == Transport::Rc && cur == QpState::Init && new == QpState::Rtr {
        if qp.memfree {
            mb.or8(off::ARBEL_SCHED_QUEUE, 1);
        } else {
            mb.or32(off::TAVOR_SCHED_QUEUE, 1);
        }
        mb.add_optpar(optpar::SCHED_QUEUE);
    }
    if mask.contains(M::TIMEOUT) {
        mb.put8(pri + path::ACKTO, attr.timeout << 3);
        mb.add_optpar(optpar::ACK_TIMEOUT);
    }
    if mask.contains(M::ALT_PATH) {
        mb.put_path(alt, &attr.alt_ah_attr, limits.gid_table_len)?;
        mb.or32(
            alt + path::PORT_PKEY,
            u32::from(attr.alt_pkey_index) | (u32::from(attr.alt_port_num) << 24),
        );
        mb.put8(alt + path::ACKTO, attr.alt_timeout << 3);
        mb.add_optpar(optpar::ALT_ADDR_PATH);
    }

    mb.put32(off::PD, qp.pd);
    mb.put32(off::WQE_LKEY, qp.lkey);
    let mut params1 =
        (u32::from(ACK_REQ_FREQ) << 28) | (u32::from(FLIGHT_LIMIT) << 24) | BIT_SWE;
    if qp.sq_sig_all {
        params1 |= BIT_SSC;
    }
    if mask.contains(M::RETRY_CNT) {
        params1 |= u32::from(attr.retry_cnt & 0x7) << 16;
        mb.add_optpar(optpar::RETRY_COUNT);
    }
    if mask.contains(M::MAX_QP_RD_ATOMIC) {
        if attr.max_rd_atomic > 0 {
            params1 |= BIT_SRE | BIT_SAE;
            params1 |= fls(u32::from(attr.max_rd_atomic) - 1) << 21;
        }
        mb.add_optpar(optpar::SRA_MAX);
    }
    mb.put32(off::PARAMS1, params1);

    if mask.contains(M::SQ_PSN) {
        mb.put32(off::NEXT_SEND_PSN, attr.sq_psn & 0x00ff_ffff);
    }
    mb.put32(off::CQN_SND, qp.send_cqn);
    if qp.memfree {
        mb.put32(off::SND_WQE_BASE_L, qp.sq.geometry().offset as u32);
        mb.put32(off::SND_DB_INDEX, qp.sq.doorbell().record_index());
    }

    let mut params2 = BIT_RSC;
    if mask.contains(M::MAX_DEST_RD_ATOMIC) {
        if attr.max_dest_rd_atomic > 0 {
            params2 |= fls(u32::from(attr.max_dest_rd_atomic) - 1) << 21;
        }
        mb.add_optpar(optpar::RRA_MAX);
    }
    if mask.intersects(M::ACCESS_FLAGS | M::MAX_DEST_RD_ATOMIC) {
        params2 |= hw_access_flags(attr, mask, cached);
        mb.add_optpar(optpar::RWE | optpar::RRE | optpar::RAE);
    }
    if qp.srqn.is_some() {
        params2 |= BIT_RIC;
    }
    mb.put32(off::PARAMS2, params2);

    let mut rnr_nextrecvpsn = 0;
    if mask.contains(M::MIN_RNR_TIMER) {
        rnr_nextrecvpsn |= u32::from(attr.min_rnr_timer & 0x1f) << 24;
        mb.add_optpar(optpar::RNR_TIMEOUT);
    }
    if mask.contains(M::RQ_PSN) {
        rnr_nextrecvpsn |= attr.rq_psn & 0x00ff_ffff;
    }
    mb.put32(off::RNR_NEXTRECVPSN, rnr_nextrecvpsn);

    let qp_index = qp.qpn & (limits.num_qps - 1);
    mb.put32(
        off::RA_BUFF_INDX,
        config.rdb_base + ((qp_index * RDB_ENTRY_SIZE) << limits.rdb_shift),
    );
    mb.put32(off::CQN_RCV, qp.recv_cqn);
    if qp.memfree {
        mb.put32(off::RCV_DB_INDEX, qp.rq.doorbell().record_index());
    }
    if mask.contains(M::QKEY) {
        mb.put32(off::QKEY, attr.qkey);
        mb.add_optpar(optpar::Q_KEY);
    }
    if let Some(srqn) = qp.srqn {
        mb.put32(off::SRQN, (1 << 24) | srqn);
    }
    Ok(mb)
}

/// Decodes a QUERY_QP mailbox. The second value is set while the send
/// queue is draining.
pub(crate) fn decode(mb: &Mailbox, transport: Transport) -> (QpAttr, bool) {
    let flags = ContextFlags::from(mb.get32(off::FLAGS));
    let (state, draining) = QpState::from_hw(u32::from(flags.state().value()));
    let params1 = mb.get32(off::PARAMS1);
    let params2 = mb.get32(off::PARAMS2);
    let rnr_nextrecvpsn = mb.get32(off::RNR_NEXTRECVPSN);
    let pri_port_pkey = mb.get32(off::PRI_PATH + path::PORT_PKEY);

    let mut access = AccessFlags::empty();
    if params2 & BIT_RRE != 0 {
        access |= AccessFlags::REMOTE_READ;
    }
    if params2 & BIT_RWE != 0 {
        access |= AccessFlags::REMOTE_WRITE;
    }
    if params2 & BIT_RAE != 0 {
        access |= AccessFlags::REMOTE_ATOMIC;
    }

    let mut attr = QpAttr {
        qp_state: state,
        cur_qp_state: state,
        path_mtu: PathMtu::from_hw(mb.get8(off::MTU_MSGMAX) >> 5),
        path_mig_state: MigState::from_hw(u32::from(flags.pm_state().value())),
        qkey: mb.get32(off::QKEY),
        rq_psn: rnr_nextrecvpsn & 0x00ff_ffff,
        sq_psn: mb.get32(off::NEXT_SEND_PSN) & 0x00ff_ffff,
        dest_qp_num: mb.get32(off::REMOTE_QPN) & 0x00ff_ffff,
        qp_access_flags: access,
        pkey_index: (pri_port_pkey & 0x7f) as u16,
        port_num: ((pri_port_pkey >> 24) & 0x3) as u8,
        sq_draining: draining,
        max_rd_atomic: 1 << ((params1 >> 21) & 0x7),
        max_dest_rd_atomic: 1 << ((params2 >> 21) & 0x7),
        min_rnr_timer: ((rnr_nextrecvpsn >> 24) & 0x1f) as u8,
        timeout: mb.get8(off::PRI_PATH + path::ACKTO) >> 3,
        retry_cnt: ((params1 >> 16) & 0x7) as u8,
        rnr_retry: mb.get8(off::PRI_PATH + path::RNR_RETRY) >> 5,
        alt_timeout: mb.get8(off::ALT_PATH + path::ACKTO) >> 3,
        ..QpAttr::default()
    };
    if matches!(transport, Transport::Rc | Transport::Uc) {
        attr.ah_attr = mb.get_path(off::PRI_PATH);
        attr.alt_ah_attr = mb.get_path(off::ALT_PATH);
        attr.alt_pkey_index = (mb.get32(off::ALT_PATH + path::PORT_PKEY) & 0x7f) as u16;
        attr.alt_port_num = attr.alt_ah_attr.port;
    }
    (attr, draining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_round_trips() {
        let av = AddressVector {
            port: 2,
            dlid: 0x44,
            sl: 3,
            src_path_bits: 1,
            static_rate: 2,
            grh: Some(GlobalRoute {
                dgid: [7; 16],
                sgid_index: 2,
                flow_label: 0x12345,
                hop_limit: 9,
                traffic_class: 0x20,
            }),
        };
        let mut mb = Mailbox::new();
        mb.put_path(off::PRI_PATH, &av, 32).unwrap();
        mb.or32(off::PRI_PATH + path::PORT_PKEY, 2 << 24);
        assert_eq!(mb.get_path(off::PRI_PATH), av);
        // the context starts 8 bytes into the mailbox
        assert_eq!(mb.as_bytes()[8 + 32 + 6..8 + 32 + 8], [0, 0x44]);
    }

    #[test]
    fn gid_index_checked_against_table() {
        let av = AddressVector {
            grh: Some(GlobalRoute {
                sgid_index: 4,
                ..GlobalRoute::default()
            }),
            ..AddressVector::default()
        };
        let mut mb = Mailbox::new();
        assert!(mb.put_path(off::PRI_PATH, &av, 4).is_err());
    }

    #[test]
    fn flags_word_layout() {
        let mut flags = ContextFlags::from(0);
        flags.set_state(u4::new(3));
        flags.set_st(u3::new(7));
        flags.set_de(true);
        flags.set_pm_state(u2::new(3));
        assert_eq!(u32::from(flags), (3 << 28) | (7 << 16) | (1 << 8) | (3 << 11));
    }

    #[test]
    fn fls_matches_depth_encoding() {
        assert_eq!(fls(0), 0);
        assert_eq!(fls(1), 1);
        assert_eq!(fls(3), 2);
        assert_eq!(fls(4), 3);
    }
}
