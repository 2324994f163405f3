//! CRC32 checksums for persisted nodes, records and blocks.
//!
//! Every persisted unit ends with a 4-byte little-endian CRC32 over the bytes
//! before it. A mismatch is always reported as
//! [`CoreError::ChecksumMismatch`] and is never tolerated.

use crate::error::{CoreError, CoreResult};
use stratadb_storage::{Arena, StorageError};

/// Length of a trailing checksum in bytes.
pub const CKSUM_LEN: usize = 4;

/// Computes the CRC32 of `data`.
#[must_use]
pub fn compute(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Appends the checksum of the current contents of `buf`.
pub fn append(buf: &mut Vec<u8>) {
    let crc = compute(buf);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Verifies that the last [`CKSUM_LEN`] bytes of `data` are the CRC32 of the rest.
///
/// # Errors
///
/// Returns [`CoreError::ChecksumMismatch`] on mismatch, or a corruption error
/// if `data` is too short to hold a checksum.
pub fn verify(data: &[u8]) -> CoreResult<()> {
    if data.len() < CKSUM_LEN {
        return Err(CoreError::corruption("too short for checksum"));
    }
    let (body, tail) = data.split_at(data.len() - CKSUM_LEN);
    let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let actual = compute(body);
    if expected != actual {
        tracing::warn!(expected, actual, "checksum mismatch");
        return Err(CoreError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Reads `len` bytes of a persisted unit at `offset`.
///
/// Offsets and lengths of persisted units come from persisted data, so a
/// unit reaching past the end of the arena means the store was cut short.
///
/// # Errors
///
/// Returns a corruption error for a read past the end, or any other
/// storage error as is.
pub(crate) fn read_unit(arena: &Arena, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
    arena.read(offset, len).map_err(|e| match e {
        StorageError::ReadPastEnd { size, .. } => {
            tracing::warn!(offset, len, size, "persisted unit past end of arena");
            CoreError::corruption(format!(
                "{len} bytes at {offset} reach past the end of the arena ({size} bytes)"
            ))
        }
        e => e.into(),
    })
}
