//! Generation checked object tables.
//!
//! A table maps 24-bit object numbers to live objects. The low bits of a
//! number index a slot; the remaining bits carry a generation that changes
//! each time the slot is reused, so a number kept after destroy never
//! resolves to the object created in its place.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use bitvec::vec::BitVec;
use parking_lot::{Mutex, RwLock};

use crate::constants::{OBJ_NUM_MASK, TABLE_SHARDS};

/// Slot allocation state
struct Allocator {
    /// Bitmap tracking allocated slots
    bitmap: BitVec,
    /// Generation of each slot
    generations: Vec<u32>,
}

/// Entries of one shard, indexed by `slot / TABLE_SHARDS`
type Shard<T> = Vec<Option<(u32, Arc<T>)>>;

/// Sharded table of objects keyed by generation checked numbers.
pub(crate) struct ObjectTable<T> {
    /// log2 of the table size
    index_bits: u32,
    /// Slots below this index are never handed out by `reserve_number`
    reserved: u32,
    alloc: Mutex<Allocator>,
    shards: Box<[RwLock<Shard<T>>]>,
}

#[allow(clippy::as_conversions)] // u32 to usize
impl<T> ObjectTable<T> {
    /// Creates a table of `size` slots, a power of two, with the first
    /// `reserved` slots withheld from allocation.
    pub(crate) fn new(size: u32, reserved: u32) -> Self {
        debug_assert!(size.is_power_of_two());
        let len = size as usize;
        let mut bitmap = BitVec::with_capacity(len);
        bitmap.resize(len, false);
        for i in 0..reserved.min(size) as usize {
            bitmap.set(i, true);
        }
        let generations = (0..len).map(|_| rand::random::<u32>()).collect();
        let per_shard = len.div_ceil(TABLE_SHARDS);
        let shards = (0..TABLE_SHARDS)
            .map(|_| RwLock::new((0..per_shard).map(|_| None).collect()))
            .collect();
        Self {
            index_bits: size.trailing_zeros(),
            reserved,
            alloc: Mutex::new(Allocator {
                bitmap,
                generations,
            }),
            shards,
        }
    }

    fn index(&self, number: u32) -> usize {
        (number & ((1 << self.index_bits) - 1)) as usize
    }

    fn shard(&self, index: usize) -> (&RwLock<Shard<T>>, usize) {
        (&self.shards[index % TABLE_SHARDS], index / TABLE_SHARDS)
    }

    fn compose(&self, generation: u32, index: usize) -> u32 {
        let generation = generation.checked_shl(self.index_bits).unwrap_or(0);
        (generation | index as u32) & OBJ_NUM_MASK
    }

    /// Takes a free slot and returns the number the object will be known by.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn reserve_number(&self) -> Option<u32> {
        let mut alloc = self.alloc.lock();
        let index = alloc.bitmap.first_zero()?;
        alloc.bitmap.set(index, true);
        Some(self.compose(alloc.generations[index], index))
    }

    /// Returns a slot taken by `reserve_number` to the free pool.
    pub(crate) fn release_number(&self, number: u32) {
        let index = self.index(number);
        if index < self.reserved as usize {
            return;
        }
        let mut alloc = self.alloc.lock();
        alloc.bitmap.set(index, false);
        alloc.generations[index] = alloc.generations[index].wrapping_add(1);
    }

    /// Publishes `value` under a reserved number.
    pub(crate) fn insert(&self, number: u32, value: Arc<T>) {
        let (shard, pos) = self.shard(self.index(number));
        shard.write()[pos] = Some((number, value));
    }

    /// Publishes `value` under a fixed number inside the withheld range.
    ///
    /// Returns `false` if the number is outside the range or already taken.
    pub(crate) fn insert_reserved(&self, number: u32, value: Arc<T>) -> bool {
        if number >= self.reserved {
            return false;
        }
        let (shard, pos) = self.shard(self.index(number));
        let mut entries = shard.write();
        if entries[pos].is_some() {
            return false;
        }
        entries[pos] = Some((number, value));
        true
    }

    /// Resolves a number, rejecting numbers of destroyed objects.
    pub(crate) fn get(&self, number: u32) -> Option<Arc<T>> {
        let (shard, pos) = self.shard(self.index(number));
        match shard.read().get(pos)? {
            Some((n, value)) if *n == number => Some(Arc::clone(value)),
            _ => None,
        }
    }

    /// Unpublishes the object. The slot stays taken until `release_number`.
    pub(crate) fn remove(&self, number: u32) -> Option<Arc<T>> {
        let (shard, pos) = self.shard(self.index(number));
        let mut entries = shard.write();
        if !matches!(entries.get(pos), Some(Some((n, _))) if *n == number) {
            return None;
        }
        entries[pos].take().map(|(_, v)| v)
    }

    /// Numbers of all published objects.
    pub(crate) fn numbers(&self) -> Vec<u32> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .iter()
                    .flatten()
                    .map(|(n, _)| *n)
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Marks a count that destroy has closed
const CLOSED: u32 = u32::MAX;

/// Number of QPs attached to a CQ or SRQ.
///
/// Destroy closes the count only while it is zero. A closed count refuses
/// further attachments.
#[derive(Debug, Default)]
pub(crate) struct AttachCount(AtomicU32);

impl AttachCount {
    /// Attaches one QP. Returns `false` once the count is closed.
    pub(crate) fn attach(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n != CLOSED).then(|| n + 1)
            })
            .is_ok()
    }

    pub(crate) fn detach(&self) {
        let _ignore = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n != CLOSED && n > 0).then(|| n - 1)
            });
    }

    /// Closes the count if nothing is attached.
    ///
    /// On failure returns the number of attached QPs, or `None` if another
    /// caller already closed it.
    pub(crate) fn close(&self) -> std::result::Result<(), Option<u32>> {
        self.0
            .compare_exchange(0, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|n| (n != CLOSED).then_some(n))
    }

    /// Attached QPs; zero once closed.
    #[cfg(test)]
    pub(crate) fn get(&self) -> u32 {
        match self.0.load(Ordering::Acquire) {
            CLOSED => 0,
            n => n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_number_does_not_resolve_after_reuse() {
        let table = ObjectTable::<u32>::new(4, 1);
        let first = table.reserve_number().unwrap();
        assert_eq!(first & 3, 1);
        table.insert(first, Arc::new(10));
        assert_eq!(*table.get(first).unwrap(), 10);

        assert_eq!(*table.remove(first).unwrap(), 10);
        table.release_number(first);

        let second = table.reserve_number().unwrap();
        assert_eq!(second & 3, 1);
        assert_ne!(first, second);
        table.insert(second, Arc::new(20));
        assert!(table.get(first).is_none());
        assert!(table.remove(first).is_none());
        assert_eq!(*table.get(second).unwrap(), 20);
    }

    #[test]
    fn exhaustion_returns_none() {
        let table = ObjectTable::<()>::new(4, 2);
        assert!(table.reserve_number().is_some());
        assert!(table.reserve_number().is_some());
        assert!(table.reserve_number().is_none());
    }

    #[test]
    fn numbers_fit_in_24_bits() {
        let table = ObjectTable::<()>::new(1 << 12, 0);
        for _ in 0..8 {
            let n = table.reserve_number().unwrap();
            assert_eq!(n & !OBJ_NUM_MASK, 0);
        }
    }

    #[test]
    fn reserved_range_takes_fixed_numbers() {
        let table = ObjectTable::<u8>::new(16, 4);
        assert!(table.insert_reserved(2, Arc::new(1)));
        assert!(!table.insert_reserved(2, Arc::new(2)));
        assert!(!table.insert_reserved(4, Arc::new(3)));
        assert_eq!(*table.get(2).unwrap(), 1);
        assert_eq!(table.numbers(), vec![2]);
        table.remove(2);
        table.release_number(2);
        assert!(table.get(2).is_none());
        assert_eq!(table.reserve_number().map(|n| n & 15), Some(4));
    }

    #[test]
    fn attach_count_closes_only_when_idle() {
        let count = AttachCount::default();
        assert!(count.attach());
        assert!(count.attach());
        assert_eq!(count.close(), Err(Some(2)));
        count.detach();
        count.detach();
        assert_eq!(count.get(), 0);
        assert_eq!(count.close(), Ok(()));
        assert_eq!(count.close(), Err(None));
        assert!(!count.attach());
        count.detach();
        assert_eq!(count.get(), 0);
        assert!(!count.attach());
    }
}
