use super::DmaBuf;

/// A fixed size slot inside a [`DmaBuf`].
///
/// The slot is a view rather than a `&mut [u8; N]`: the device owns the same
/// memory concurrently, so every access goes through the volatile accessors
/// of the buffer and is checked against the slot bounds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RingSlot<'a> {
    buf: &'a DmaBuf,
    base: usize,
    size: usize,
}

impl<'a> RingSlot<'a> {
    /// Creates a view of `size` bytes at `base`.
    pub(crate) fn new(buf: &'a DmaBuf, base: usize, size: usize) -> Self {
        assert!(
            base.checked_add(size).is_some_and(|end| end <= buf.len()),
            "slot {base:#x}+{size} outside of ring"
        );
        Self { buf, base, size }
    }

    /// Size of the slot in bytes.
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Offset of the slot inside its buffer.
    #[cfg(test)]
    pub(crate) fn base(&self) -> usize {
        self.base
    }

    fn at(&self, offset: usize, len: usize) -> usize {
        assert!(
            offset + len <= self.size,
            "field {offset:#x}+{len} outside of {}-byte slot",
            self.size
        );
        self.base + offset
    }

    pub(crate) fn put_be32(&self, offset: usize, value: u32) {
        self.buf.write_be32(self.at(offset, 4), value);
    }

    pub(crate) fn get_be32(&self, offset: usize) -> u32 {
        self.buf.read_be32(self.at(offset, 4))
    }

    pub(crate) fn put_be64(&self, offset: usize, value: u64) {
        self.buf.write_be64(self.at(offset, 8), value);
    }

    pub(crate) fn put_be16(&self, offset: usize, value: u16) {
        self.put_bytes(offset, &value.to_be_bytes());
    }

    pub(crate) fn get_be16(&self, offset: usize) -> u16 {
        let mut raw = [0; 2];
        self.buf.read_bytes(self.at(offset, 2), &mut raw);
        u16::from_be_bytes(raw)
    }

    pub(crate) fn put_u8(&self, offset: usize, value: u8) {
        self.buf.write_u8(self.at(offset, 1), value);
    }

    pub(crate) fn get_u8(&self, offset: usize) -> u8 {
        self.buf.read_u8(self.at(offset, 1))
    }

    pub(crate) fn put_bytes(&self, offset: usize, src: &[u8]) {
        self.buf.write_bytes(self.at(offset, src.len()), src);
    }

    pub(crate) fn get_bytes<const N: usize>(&self, offset: usize) -> [u8; N] {
        self.buf.read_array(self.at(offset, N))
    }

    pub(crate) fn zero(&self, offset: usize, len: usize) {
        self.buf.fill(self.at(offset, len), len, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_writes_land_at_base() {
        let buf = DmaBuf::alloc(4096).unwrap();
        let slot = RingSlot::new(&buf, 128, 64);
        slot.put_be32(4, 0xdead_beef);
        slot.put_be16(8, 0x1234);
        slot.put_u8(63, 0x80);
        assert_eq!(buf.read_be32(132), 0xdead_beef);
        assert_eq!(slot.get_be16(8), 0x1234);
        assert_eq!(buf.read_u8(191), 0x80);
    }

    #[test]
    #[should_panic(expected = "outside of 64-byte slot")]
    fn slot_rejects_field_past_end() {
        let buf = DmaBuf::alloc(4096).unwrap();
        let slot = RingSlot::new(&buf, 0, 64);
        slot.put_be64(60, 0);
    }

    #[test]
    #[should_panic(expected = "outside of ring")]
    fn slot_rejects_view_past_buffer() {
        let buf = DmaBuf::alloc(4096).unwrap();
        let _slot = RingSlot::new(&buf, 4096 - 32, 64);
    }
}
