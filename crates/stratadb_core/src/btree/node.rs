//! Persisted B-tree node format.
//!
//! ```text
//! | size (2) | { offset (5) | npre (1) | ndiff (1) | diff }* | crc32 (4) |
//! ```
//!
//! `size` is the whole node including itself and the checksum. Each entry's
//! key is the first `npre` bytes of the previous entry's key followed by
//! `diff`. Leaf entries store only the shortest prefix of the true key that
//! separates it from its predecessor; tree entries store child separators.
//! The first entry of every node stores the empty key.

use crate::checksum::{self, CKSUM_LEN};
use crate::encoding::{Reader, Writer};
use crate::error::{CoreError, CoreResult};
use std::ops::Range;
use stratadb_storage::Arena;

/// Longest key a node entry can describe.
pub const MAX_KEY_LEN: usize = u8::MAX as usize;

const SIZE_LEN: usize = 2;
pub(crate) const ENTRY_HEADER: usize = 5 + 1 + 1;
pub(crate) const NODE_OVERHEAD: usize = SIZE_LEN + CKSUM_LEN;

/// One decoded node entry: a stored key and a child or record offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub key: Vec<u8>,
    pub offset: u64,
}

/// A decoded node plus its persisted size.
#[derive(Debug)]
pub(crate) struct Node {
    pub entries: Vec<Entry>,
    pub size: usize,
}

impl Node {
    /// Index of the entry to follow for `key`: the last one whose stored
    /// key is <= `key`.
    pub fn find(&self, key: &[u8]) -> usize {
        self.entries
            .partition_point(|e| e.key.as_slice() <= key)
            .saturating_sub(1)
    }
}

pub(crate) fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Shortest prefix of `key` that sorts after `prev`.
pub(crate) fn separator(prev: &[u8], key: &[u8]) -> Vec<u8> {
    let n = (common_prefix(prev, key) + 1).min(key.len());
    key[..n].to_vec()
}

/// Encoded size of an entry following one whose key is `prev`.
pub(crate) fn entry_size(prev: &[u8], key: &[u8]) -> usize {
    let npre = common_prefix(prev, key).min(MAX_KEY_LEN);
    ENTRY_HEADER + key.len() - npre
}

pub(crate) fn encode(entries: &[Entry]) -> CoreResult<Vec<u8>> {
    let mut w = Writer::with_capacity(256);
    w.put2(0);
    let mut prev: &[u8] = &[];
    for e in entries {
        if e.key.len() > MAX_KEY_LEN {
            return Err(CoreError::KeyTooLong {
                len: e.key.len(),
                max: MAX_KEY_LEN,
            });
        }
        let npre = common_prefix(prev, &e.key);
        let diff = &e.key[npre..];
        w.put5(e.offset)
            .put1(npre as u8)
            .put1(diff.len() as u8)
            .put_bytes(diff);
        prev = e.key.as_slice();
    }
    let mut buf = w.into_inner();
    let size = buf.len() + CKSUM_LEN;
    let size = u16::try_from(size)
        .map_err(|_| CoreError::invariant(format!("node of {size} bytes overflows size field")))?;
    buf[..SIZE_LEN].copy_from_slice(&size.to_be_bytes());
    checksum::append(&mut buf);
    Ok(buf)
}

fn decode(data: &[u8]) -> CoreResult<Vec<Entry>> {
    let mut r = Reader::new(&data[SIZE_LEN..data.len() - CKSUM_LEN]);
    let mut entries: Vec<Entry> = Vec::new();
    while !r.is_empty() {
        let offset = r.get5()?;
        let npre = usize::from(r.get1()?);
        let ndiff = usize::from(r.get1()?);
        let prev = entries.last().map_or(&[][..], |e| e.key.as_slice());
        if npre > prev.len() {
            return Err(CoreError::corruption(format!(
                "entry shares {npre} bytes with a {} byte key",
                prev.len()
            )));
        }
        let mut key = Vec::with_capacity(npre + ndiff);
        key.extend_from_slice(&prev[..npre]);
        key.extend_from_slice(r.get_bytes(ndiff)?);
        entries.push(Entry { key, offset });
    }
    Ok(entries)
}

/// Writes a node and returns its offset.
pub(crate) fn write(arena: &Arena, entries: &[Entry]) -> CoreResult<u64> {
    let buf = encode(entries)?;
    Ok(arena.append(&buf)?)
}

/// Reads and verifies the node at `offset`.
pub(crate) fn read(arena: &Arena, offset: u64) -> CoreResult<Node> {
    let head = checksum::read_unit(arena, offset, SIZE_LEN)?;
    let size = usize::from(u16::from_be_bytes([head[0], head[1]]));
    if size < NODE_OVERHEAD {
        return Err(CoreError::corruption(format!(
            "node at {offset} has impossible size {size}"
        )));
    }
    let data = checksum::read_unit(arena, offset, size)?;
    checksum::verify(&data)?;
    Ok(Node {
        entries: decode(&data)?,
        size,
    })
}

/// Splits a run of entries into node-sized chunks.
///
/// `sizes[i]` is the encoded size of entry `i`. Chunks hold at least
/// `min_len` entries when there are enough to go around, which keeps tree
/// levels shrinking even when single entries are close to the limit.
pub(crate) fn plan_chunks(sizes: &[usize], max_size: usize, min_len: usize) -> Vec<Range<usize>> {
    let total = NODE_OVERHEAD + sizes.iter().sum::<usize>();
    if total <= max_size || sizes.len() < 2 * min_len {
        return vec![0..sizes.len()];
    }
    let target = total / total.div_ceil(max_size);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut cur = NODE_OVERHEAD;
    for (i, &size) in sizes.iter().enumerate() {
        if i - start >= min_len && sizes.len() - i >= min_len && cur + size > target {
            chunks.push(start..i);
            start = i;
            cur = NODE_OVERHEAD;
        }
        cur += size;
    }
    chunks.push(start..sizes.len());
    chunks
}
