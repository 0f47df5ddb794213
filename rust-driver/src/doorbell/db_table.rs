use std::{io, sync::Arc};

use bitvec::vec::BitVec;
use log::debug;
use parking_lot::Mutex;

use crate::{
    barrier::wmb,
    constants::DB_REC_SIZE,
    error::{HcaError, Result},
    mem::DmaBuf,
};

/// Kind of a doorbell record, stored in its tag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::missing_docs_in_private_items)]
pub(crate) enum DbRecordType {
    CqSetCi = 1,
    CqArm = 2,
    Sq = 3,
    Rq = 4,
    Srq = 5,
}

impl DbRecordType {
    /// Send and arm records are packed from the front of the page,
    /// the others from the back.
    fn from_front(self) -> bool {
        matches!(self, DbRecordType::CqArm | DbRecordType::Sq)
    }
}

struct Inner {
    page: DmaBuf,
    used: Mutex<BitVec>,
}

/// Table of 8-byte doorbell records shared with the device.
#[derive(Clone)]
pub(crate) struct DoorbellTable {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DoorbellTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoorbellTable")
            .field("page", &self.inner.page)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
impl DoorbellTable {
    /// Maps a page holding `num_records` records.
    pub(crate) fn new(num_records: u32) -> io::Result<Self> {
        let len = num_records as usize;
        let page = DmaBuf::alloc(len * DB_REC_SIZE)?;
        let mut used = BitVec::with_capacity(len);
        used.resize(len, false);
        Ok(Self {
            inner: Arc::new(Inner {
                page,
                used: Mutex::new(used),
            }),
        })
    }

    /// Allocates a record for object `qn` and writes its tag.
    pub(crate) fn alloc(&self, ty: DbRecordType, qn: u32) -> Result<DbRecord> {
        let index = {
            let mut used = self.inner.used.lock();
            let free = if ty.from_front() {
                used.first_zero()
            } else {
                used.last_zero()
            };
            let index = free.ok_or_else(|| {
                HcaError::InsufficientResources("doorbell records exhausted".into())
            })?;
            used.set(index, true);
            index
        };
        let rec = DbRecord {
            table: Arc::clone(&self.inner),
            index: index as u32,
        };
        rec.set([0, (qn << 8) | ((ty as u32) << 5)]);
        debug!("doorbell record {index} allocated for {ty:?} {qn:#x}");
        Ok(rec)
    }

    /// Number of records in use.
    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        self.inner.used.lock().count_ones()
    }

    /// Reads both words of a record.
    #[cfg(test)]
    pub(crate) fn read(&self, index: u32) -> [u32; 2] {
        let off = index as usize * DB_REC_SIZE;
        [
            self.inner.page.read_be32(off),
            self.inner.page.read_be32(off + 4),
        ]
    }
}

/// One allocated doorbell record. Dropping it frees the record.
pub(crate) struct DbRecord {
    table: Arc<Inner>,
    index: u32,
}

impl std::fmt::Debug for DbRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbRecord").field("index", &self.index).finish()
    }
}

#[allow(clippy::as_conversions)]
impl DbRecord {
    fn offset(&self) -> usize {
        self.index as usize * DB_REC_SIZE
    }

    /// Index of the record, as placed in context images.
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Writes the counter word.
    pub(crate) fn set_counter(&self, value: u32) {
        self.table.page.write_be32(self.offset(), value);
    }

    /// Writes both words, counter first.
    pub(crate) fn set(&self, words: [u32; 2]) {
        let off = self.offset();
        self.table.page.write_be32(off, words[0]);
        wmb();
        self.table.page.write_be32(off + 4, words[1]);
    }

    /// Reads both words.
    #[cfg(test)]
    pub(crate) fn get(&self) -> [u32; 2] {
        let off = self.offset();
        [
            self.table.page.read_be32(off),
            self.table.page.read_be32(off + 4),
        ]
    }
}

impl Drop for DbRecord {
    fn drop(&mut self) {
        self.set([0, 0]);
        self.table.used.lock().set(self.index as usize, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_fill_from_opposite_ends() {
        let table = DoorbellTable::new(8).unwrap();
        let sq = table.alloc(DbRecordType::Sq, 0x40).unwrap();
        let arm = table.alloc(DbRecordType::CqArm, 0x3).unwrap();
        let rq = table.alloc(DbRecordType::Rq, 0x40).unwrap();
        let ci = table.alloc(DbRecordType::CqSetCi, 0x3).unwrap();
        assert_eq!(sq.index(), 0);
        assert_eq!(arm.index(), 1);
        assert_eq!(rq.index(), 7);
        assert_eq!(ci.index(), 6);
        assert_eq!(table.read(0), [0, (0x40 << 8) | (3 << 5)]);
        assert_eq!(table.read(7), [0, (0x40 << 8) | (4 << 5)]);
    }

    #[test]
    fn exhaustion_is_reported_and_drop_frees() {
        let table = DoorbellTable::new(2).unwrap();
        let a = table.alloc(DbRecordType::Sq, 1).unwrap();
        let _b = table.alloc(DbRecordType::Srq, 2).unwrap();
        let err = table.alloc(DbRecordType::Rq, 3).unwrap_err();
        assert!(matches!(err, HcaError::InsufficientResources(_)));

        a.set_counter(5);
        assert_eq!(a.get()[0], 5);
        drop(a);
        assert_eq!(table.in_use(), 1);
        assert_eq!(table.read(0), [0, 0]);
        let c = table.alloc(DbRecordType::Sq, 3).unwrap();
        assert_eq!(c.index(), 0);
    }
}
