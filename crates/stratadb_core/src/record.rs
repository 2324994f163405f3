//! Framed data records stored in the arena.
//!
//! ```text
//! | total_len (4) | nfields (2) | { field_len (2) | field }* | crc32 (4) |
//! ```
//!
//! `total_len` covers the whole frame including the checksum, so a record can
//! be verified knowing only its offset.

use crate::btree::LeafKeys;
use crate::checksum::{self, CKSUM_LEN};
use crate::encoding::{Reader, Writer};
use crate::error::{CoreError, CoreResult};
use crate::ixkey::IndexSpec;
use stratadb_storage::Arena;

const LEN_SIZE: usize = 4;

/// A data record: an ordered list of byte fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    fields: Vec<Vec<u8>>,
}

impl Record {
    /// Creates a record from its fields.
    #[must_use]
    pub fn new(fields: Vec<Vec<u8>>) -> Self {
        Self { fields }
    }

    /// Returns field `i`, or an empty slice if the record is shorter.
    #[must_use]
    pub fn field(&self, i: usize) -> &[u8] {
        self.fields.get(i).map_or(&[], Vec::as_slice)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the record has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Size of the framed record in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let body: usize = self.fields.iter().map(|f| 2 + f.len()).sum();
        LEN_SIZE + 2 + body + CKSUM_LEN
    }

    /// Encodes the framed record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] if a field is longer than
    /// 65535 bytes or there are more than 65535 fields.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let total = self.encoded_len();
        let nfields = u16::try_from(self.fields.len()).map_err(|_| {
            CoreError::invalid_format(format!("record has {} fields, max {}", self.fields.len(), u16::MAX))
        })?;
        let total32 = u32::try_from(total)
            .map_err(|_| CoreError::invalid_format(format!("record of {total} bytes is too large")))?;
        let mut w = Writer::with_capacity(total);
        w.put_bytes(&total32.to_be_bytes());
        w.put2(nfields);
        for (i, f) in self.fields.iter().enumerate() {
            let len = u16::try_from(f.len()).map_err(|_| {
                CoreError::invalid_format(format!("field {i} is {} bytes, max {}", f.len(), u16::MAX))
            })?;
            w.put2(len);
            w.put_bytes(f);
        }
        let mut buf = w.into_inner();
        checksum::append(&mut buf);
        Ok(buf)
    }

    /// Appends the record to the arena and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not fit the frame format or the
    /// arena cannot allocate.
    pub fn write(&self, arena: &Arena) -> CoreResult<u64> {
        Ok(arena.append(&self.encode()?)?)
    }

    /// Reads and verifies the record at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ChecksumMismatch`] if the frame is damaged.
    pub fn read(arena: &Arena, offset: u64) -> CoreResult<Self> {
        let frame = read_frame(arena, offset)?;
        let mut r = Reader::new(&frame[LEN_SIZE..frame.len() - CKSUM_LEN]);
        let nfields = r.get2()?;
        let mut fields = Vec::with_capacity(usize::from(nfields));
        for _ in 0..nfields {
            let len = usize::from(r.get2()?);
            fields.push(r.get_bytes(len)?.to_vec());
        }
        Ok(Self { fields })
    }
}

/// Verifies the checksum of the record at `offset` without decoding it.
///
/// # Errors
///
/// Returns [`CoreError::ChecksumMismatch`] if the frame is damaged.
pub fn verify(arena: &Arena, offset: u64) -> CoreResult<()> {
    read_frame(arena, offset).map(|_| ())
}

fn read_frame(arena: &Arena, offset: u64) -> CoreResult<Vec<u8>> {
    let head = checksum::read_unit(arena, offset, LEN_SIZE)?;
    let total = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
    if total < LEN_SIZE + 2 + CKSUM_LEN {
        return Err(CoreError::corruption(format!(
            "record at {offset} has impossible length {total}"
        )));
    }
    let frame = checksum::read_unit(arena, offset, total)?;
    checksum::verify(&frame)?;
    Ok(frame)
}

/// Key accessor deriving leaf keys from framed records.
///
/// This is the standard [`LeafKeys`] implementation: the record at the leaf
/// offset is read and the index spec picks its key fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordKeys;

impl LeafKeys for RecordKeys {
    fn leaf_key(&self, arena: &Arena, spec: &IndexSpec, offset: u64) -> CoreResult<Vec<u8>> {
        Ok(spec.key(&Record::read(arena, offset)?))
    }

    fn verify_record(&self, arena: &Arena, offset: u64) -> CoreResult<()> {
        verify(arena, offset)
    }
}
