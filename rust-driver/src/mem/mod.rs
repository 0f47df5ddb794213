use std::io;

use memmap2::{MmapMut, MmapOptions};

use crate::constants::PAGE_SIZE;

/// Bounds checked views of ring slots
pub(crate) mod slot;

pub(crate) use slot::RingSlot;

/// Host memory shared with the device.
///
/// All accesses are volatile: the device may read or write the memory at any
/// time, so the compiler must not cache or elide them. Multi-byte fields are
/// stored big-endian as the hardware expects.
pub(crate) struct DmaBuf {
    /// Start of the mapping
    ptr: *mut u8,
    /// Length of the mapping in bytes
    len: usize,
    /// Mmap handle keeping the mapping alive
    _mmap: MmapMut,
}

impl std::fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuf")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

#[allow(unsafe_code)]
impl DmaBuf {
    /// Maps at least `len` zeroed bytes, rounded up to whole pages.
    pub(crate) fn alloc(len: usize) -> io::Result<Self> {
        let len = len.max(1).next_multiple_of(PAGE_SIZE);
        let mut mmap = MmapOptions::new().len(len).map_anon()?;
        let ptr = mmap.as_mut_ptr();
        Ok(Self {
            ptr,
            len,
            _mmap: mmap,
        })
    }

    /// Length of the mapping in bytes.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Address the device uses to reach the buffer.
    #[allow(clippy::as_conversions)] // pointer to integer
    pub(crate) fn addr(&self) -> u64 {
        self.ptr as u64
    }

    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "access {offset:#x}+{len} out of bounds of {:#x}",
            self.len
        );
    }

    pub(crate) fn read_u8(&self, offset: usize) -> u8 {
        self.check(offset, 1);
        unsafe { self.ptr.add(offset).read_volatile() }
    }

    pub(crate) fn write_u8(&self, offset: usize, value: u8) {
        self.check(offset, 1);
        unsafe { self.ptr.add(offset).write_volatile(value) }
    }

    /// Reads a big-endian word at a 4-byte aligned offset.
    pub(crate) fn read_be32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        debug_assert_eq!(offset % 4, 0, "unaligned word access");
        let raw = unsafe { self.ptr.add(offset).cast::<u32>().read_volatile() };
        u32::from_be(raw)
    }

    /// Writes a big-endian word at a 4-byte aligned offset.
    pub(crate) fn write_be32(&self, offset: usize, value: u32) {
        self.check(offset, 4);
        debug_assert_eq!(offset % 4, 0, "unaligned word access");
        unsafe {
            self.ptr
                .add(offset)
                .cast::<u32>()
                .write_volatile(value.to_be());
        }
    }

    /// Writes a big-endian 64-bit value as two words, high word first.
    #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
    pub(crate) fn write_be64(&self, offset: usize, value: u64) {
        self.write_be32(offset, (value >> 32) as u32);
        self.write_be32(offset + 4, value as u32);
    }

    #[cfg(test)]
    pub(crate) fn read_be64(&self, offset: usize) -> u64 {
        (u64::from(self.read_be32(offset)) << 32) | u64::from(self.read_be32(offset + 4))
    }

    pub(crate) fn write_bytes(&self, offset: usize, src: &[u8]) {
        self.check(offset, src.len());
        for (i, byte) in src.iter().enumerate() {
            unsafe { self.ptr.add(offset + i).write_volatile(*byte) }
        }
    }

    pub(crate) fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len());
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = unsafe { self.ptr.add(offset + i).read_volatile() };
        }
    }

    pub(crate) fn read_array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0; N];
        self.read_bytes(offset, &mut out);
        out
    }

    pub(crate) fn fill(&self, offset: usize, len: usize, value: u8) {
        self.check(offset, len);
        for i in 0..len {
            unsafe { self.ptr.add(offset + i).write_volatile(value) }
        }
    }
}

#[allow(unsafe_code)]
unsafe impl Send for DmaBuf {}

#[allow(unsafe_code)]
unsafe impl Sync for DmaBuf {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dma_buf_rounds_to_pages() {
        let buf = DmaBuf::alloc(100).unwrap();
        assert_eq!(buf.len(), PAGE_SIZE);
        let buf = DmaBuf::alloc(PAGE_SIZE + 1).unwrap();
        assert_eq!(buf.len(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_dma_buf_big_endian_layout() {
        let buf = DmaBuf::alloc(64).unwrap();
        buf.write_be32(0, 0x1122_3344);
        assert_eq!(buf.read_array::<4>(0), [0x11, 0x22, 0x33, 0x44]);
        assert_eq!(buf.read_be32(0), 0x1122_3344);

        buf.write_be64(8, 0x0102_0304_0506_0708);
        assert_eq!(
            buf.read_array::<8>(8),
            [1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(buf.read_be64(8), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_dma_buf_starts_zeroed() {
        let buf = DmaBuf::alloc(PAGE_SIZE).unwrap();
        assert!(buf.read_array::<64>(0).iter().all(|b| *b == 0));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_dma_buf_bounds_checked() {
        let buf = DmaBuf::alloc(PAGE_SIZE).unwrap();
        buf.write_be32(PAGE_SIZE - 2, 0);
    }
}
