#![allow(clippy::as_conversions, clippy::cast_possible_truncation)]

use crate::{
    error::{HcaError, Result},
    mem::{DmaBuf, RingSlot},
    ring::{RingGeometry, WorkQueue},
    types::Sge,
};

use super::{next, put_data_seg, put_inval_seg, size16, DATA_SEG_SIZE, INVAL_LKEY, NEXT_SEG_SIZE};

/// Checks the scatter list of a receive request.
pub(crate) fn validate(sg_list: &[Sge], max_gs: u32) -> Result<()> {
    if sg_list.len() > max_gs as usize {
        return Err(HcaError::TooManySge {
            requested: sg_list.len(),
            max: max_gs as usize,
        });
    }
    Ok(())
}

/// Writes the scatter list after the next segment and returns the WQE size
/// in 16-byte units.
///
/// With `terminate`, a list shorter than `max_gs` is closed by an entry
/// carrying the invalid lkey.
pub(crate) fn put_scatter(
    slot: &RingSlot<'_>,
    sg_list: &[Sge],
    max_gs: u32,
    terminate: bool,
) -> u8 {
    let mut off = NEXT_SEG_SIZE;
    for sge in sg_list {
        put_data_seg(slot, off, sge);
        off += DATA_SEG_SIZE;
    }
    if terminate && sg_list.len() < max_gs as usize {
        put_inval_seg(slot, off);
    }
    size16(off)
}

fn fill_inval_lkeys(slot: &RingSlot<'_>) {
    for off in (NEXT_SEG_SIZE..slot.size()).step_by(DATA_SEG_SIZE) {
        slot.put_be32(off + 4, INVAL_LKEY);
    }
}

/// Links every receive WQE to its successor.
///
/// Memory-free rings are linked once with their full size since hardware
/// learns about new entries from the doorbell record. Legacy rings only get
/// the address here; sizes are filled in as entries are posted.
pub(crate) fn init_recv_ring(wq: &WorkQueue, memfree: bool) {
    let geo = *wq.geometry();
    for i in 0..geo.max {
        let slot = wq.slot(i);
        let next_ind = (i + 1) % geo.max;
        if memfree {
            let size = size16(NEXT_SEG_SIZE + geo.max_gs as usize * DATA_SEG_SIZE);
            slot.put_be32(next::NDA_OP, next_ind << geo.wqe_shift);
            slot.put_be32(next::EE_NDS, u32::from(size));
            fill_inval_lkeys(&slot);
        } else {
            slot.put_be32(next::NDA_OP, (next_ind << geo.wqe_shift) | 1);
        }
    }
}

/// Links SRQ WQEs in slot order; the last one links nowhere.
pub(crate) fn init_srq_ring(buf: &DmaBuf, geo: &RingGeometry) {
    for i in 0..geo.max {
        let slot = RingSlot::new(buf, (i as usize) << geo.wqe_shift, geo.wqe_size());
        let nda_op = if i + 1 < geo.max {
            ((i + 1) << geo.wqe_shift) | 1
        } else {
            0
        };
        slot.put_be32(next::NDA_OP, nda_op);
        fill_inval_lkeys(&slot);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::doorbell::DoorbellMode;

    fn queue(max: u32) -> WorkQueue {
        let geo = RingGeometry {
            max,
            wqe_shift: 6,
            max_gs: 3,
            offset: 0,
        };
        WorkQueue::new(
            geo,
            DoorbellMode::Legacy,
            Arc::new(DmaBuf::alloc(geo.bytes()).unwrap()),
        )
    }

    #[test]
    fn legacy_ring_links_addresses() {
        let wq = queue(4);
        init_recv_ring(&wq, false);
        assert_eq!(wq.slot(0).get_be32(next::NDA_OP), 64 | 1);
        assert_eq!(wq.slot(3).get_be32(next::NDA_OP), 1);
        assert_eq!(wq.slot(3).get_be32(next::EE_NDS), 0);
    }

    #[test]
    fn memfree_ring_is_prelinked() {
        let wq = queue(4);
        init_recv_ring(&wq, true);
        let slot = wq.slot(1);
        assert_eq!(slot.get_be32(next::NDA_OP), 128);
        assert_eq!(slot.get_be32(next::EE_NDS), 4);
        assert_eq!(slot.get_be32(20), INVAL_LKEY);
        assert_eq!(slot.get_be32(52), INVAL_LKEY);
    }

    #[test]
    fn scatter_is_terminated_when_short() {
        let wq = queue(2);
        let slot = wq.slot(0);
        init_recv_ring(&wq, true);
        let sge = Sge {
            addr: 0x10,
            length: 8,
            lkey: 2,
        };
        assert_eq!(put_scatter(&slot, &[sge], 3, true), 2);
        assert_eq!(slot.get_be32(20), 2);
        assert_eq!(slot.get_be32(32), 0);
        assert_eq!(slot.get_be32(36), INVAL_LKEY);
        assert!(validate(&[sge; 4], 3).is_err());
    }

    #[test]
    fn srq_ring_ends_in_null_link() {
        let geo = RingGeometry {
            max: 3,
            wqe_shift: 6,
            max_gs: 3,
            offset: 0,
        };
        let buf = DmaBuf::alloc(geo.bytes()).unwrap();
        init_srq_ring(&buf, &geo);
        assert_eq!(buf.read_be32(0), 64 | 1);
        assert_eq!(buf.read_be32(64), 128 | 1);
        assert_eq!(buf.read_be32(128), 0);
    }
}
