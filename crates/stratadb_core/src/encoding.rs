//! Fixed-width big-endian encoding helpers for persisted formats.
//!
//! Offsets are stored in 5 bytes (1 TB of arena), small counts in 1-3 bytes.
//! Big-endian keeps encoded integers comparable as bytes.

use crate::error::{CoreError, CoreResult};

/// Largest offset that fits in the 5-byte on-disk form.
pub const MAX_OFFSET: u64 = stratadb_storage::ARENA_MAX_SIZE - 1;

/// Appends fixed-width integers and strings to a byte buffer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty writer with room for `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Writes one byte.
    pub fn put1(&mut self, n: u8) -> &mut Self {
        self.buf.push(n);
        self
    }

    /// Writes a 2-byte value.
    pub fn put2(&mut self, n: u16) -> &mut Self {
        self.buf.extend_from_slice(&n.to_be_bytes());
        self
    }

    /// Writes the low 3 bytes of `n`. Callers bound `n` below 2^24.
    pub fn put3(&mut self, n: u32) -> &mut Self {
        debug_assert!(n < 1 << 24);
        self.buf.extend_from_slice(&n.to_be_bytes()[1..]);
        self
    }

    /// Writes the low 5 bytes of `n`. Arena offsets always fit, since the
    /// arena refuses to grow past `ARENA_MAX_SIZE`.
    pub fn put5(&mut self, n: u64) -> &mut Self {
        debug_assert!(n <= MAX_OFFSET);
        self.buf.extend_from_slice(&n.to_be_bytes()[3..]);
        self
    }

    /// Writes a signed 8-byte value.
    pub fn put_i64(&mut self, n: i64) -> &mut Self {
        self.buf.extend_from_slice(&n.to_be_bytes());
        self
    }

    /// Writes raw bytes without a length prefix.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Writes a string with a 2-byte length prefix. Callers bound the length
    /// to 65535 bytes.
    pub fn put_str(&mut self, s: &str) -> &mut Self {
        debug_assert!(s.len() <= usize::from(u16::MAX));
        self.put2(s.len() as u16);
        self.put_bytes(s.as_bytes())
    }

    /// Overwrites 3 bytes at `pos`, used to patch reserved slots.
    pub fn patch3(&mut self, pos: usize, n: u32) {
        self.buf[pos..pos + 3].copy_from_slice(&n.to_be_bytes()[1..]);
    }

    /// Returns the written bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads fixed-width integers and strings from a byte slice.
///
/// Every read is bounds checked; running off the end is reported as
/// corruption since all callers read bytes that were checksummed as a unit.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// True if all bytes have been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Reads `len` raw bytes.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if fewer than `len` bytes remain.
    pub fn get_bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                CoreError::corruption(format!(
                    "unexpected end of data: need {len} bytes at {}",
                    self.pos
                ))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// Returns a corruption error at end of data.
    pub fn get1(&mut self) -> CoreResult<u8> {
        Ok(self.get_bytes(1)?[0])
    }

    /// Reads a 2-byte value.
    ///
    /// # Errors
    ///
    /// Returns a corruption error at end of data.
    pub fn get2(&mut self) -> CoreResult<u16> {
        let b = self.get_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a 3-byte value.
    ///
    /// # Errors
    ///
    /// Returns a corruption error at end of data.
    pub fn get3(&mut self) -> CoreResult<u32> {
        let b = self.get_bytes(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    /// Reads a 5-byte value.
    ///
    /// # Errors
    ///
    /// Returns a corruption error at end of data.
    pub fn get5(&mut self) -> CoreResult<u64> {
        let b = self.get_bytes(5)?;
        Ok(u64::from_be_bytes([0, 0, 0, b[0], b[1], b[2], b[3], b[4]]))
    }

    /// Reads a signed 8-byte value.
    ///
    /// # Errors
    ///
    /// Returns a corruption error at end of data.
    pub fn get_i64(&mut self) -> CoreResult<i64> {
        let b = self.get_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_be_bytes(arr))
    }

    /// Reads a string written by [`Writer::put_str`].
    ///
    /// # Errors
    ///
    /// Returns a corruption error at end of data or on invalid UTF-8.
    pub fn get_str(&mut self) -> CoreResult<&'a str> {
        let len = usize::from(self.get2()?);
        let bytes = self.get_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| CoreError::corruption("invalid UTF-8 string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_widths_read_back() {
        let mut w = Writer::new();
        w.put1(7).put2(0x1234).put3(0x00AB_CDEF).put5(MAX_OFFSET);
        w.put_i64(-5).put_str("customers");
        let buf = w.into_inner();
        assert_eq!(buf.len(), 1 + 2 + 3 + 5 + 8 + 2 + 9);

        let mut r = Reader::new(&buf);
        assert_eq!(r.get1().unwrap(), 7);
        assert_eq!(r.get2().unwrap(), 0x1234);
        assert_eq!(r.get3().unwrap(), 0x00AB_CDEF);
        assert_eq!(r.get5().unwrap(), MAX_OFFSET);
        assert_eq!(r.get_i64().unwrap(), -5);
        assert_eq!(r.get_str().unwrap(), "customers");
        assert!(r.is_empty());
    }

    #[test]
    fn five_byte_offsets_sort_as_bytes() {
        let mut a = Writer::new();
        a.put5(255);
        let mut b = Writer::new();
        b.put5(256);
        assert!(a.into_inner() < b.into_inner());
    }

    #[test]
    fn patch_reserved_slot() {
        let mut w = Writer::new();
        w.put3(0).put1(9);
        w.patch3(0, 77);
        let buf = w.into_inner();
        assert_eq!(Reader::new(&buf).get3().unwrap(), 77);
    }

    #[test]
    fn reading_past_end_is_corruption() {
        let mut r = Reader::new(&[1, 2]);
        assert!(matches!(r.get3(), Err(CoreError::Corruption { .. })));
        let mut r = Reader::new(&[0, 5, b'a']);
        assert!(r.get_str().is_err());
    }
}
