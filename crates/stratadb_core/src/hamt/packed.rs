//! Packed on-disk form of a [`Hamt`] generation.
//!
//! ```text
//! | size (3) | prev (5) | count (2) | finger (3) * (1 + count/16) | items | crc32 (4) |
//! item: | key_len (2) | key | body_len (3) | body |
//! ```
//!
//! Items are sorted by key. Finger `i` holds the block-relative offset of
//! item `16 * i` (or the end of the items), so a lookup binary searches the
//! fingers and then scans at most 16 items. `prev` links to the previous
//! generation block; 0 ends the chain.
//!
//! [`Hamt`]: super::Hamt

use super::{Hamt, HamtItem};
use crate::checksum::{self, CKSUM_LEN};
use crate::encoding::{Reader, Writer};
use crate::error::{CoreError, CoreResult};
use stratadb_storage::Arena;

/// Number of items between fingers.
pub const FINGER_SPACING: usize = 16;

const SIZE_LEN: usize = 3;
const HEADER_LEN: usize = SIZE_LEN + 5 + 2;
const FINGER_LEN: usize = 3;
const MAX_BLOCK: usize = (1 << 24) - 1;

/// An item that can be stored in a packed block.
pub trait PackedItem: HamtItem {
    /// Extra state needed to decode an item, such as the store environment.
    type Context: ?Sized;

    /// Writes everything except the key.
    fn write_body(&self, w: &mut Writer);

    /// Rebuilds an item from its key and body.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the body is malformed.
    fn read_body(key: &str, r: &mut Reader<'_>, ctx: &Self::Context) -> CoreResult<Self>;
}

/// Writes `items` as one block linked to `prev` and returns its offset.
///
/// # Errors
///
/// Returns an invariant violation if the items do not fit the block format,
/// or a storage error.
pub fn write_block<T: PackedItem>(arena: &Arena, mut items: Vec<&T>, prev: u64) -> CoreResult<u64> {
    items.sort_unstable_by(|a, b| a.key().cmp(b.key()));
    let count = u16::try_from(items.len())
        .map_err(|_| CoreError::invariant(format!("{} items overflow a block", items.len())))?;
    let nfingers = 1 + items.len() / FINGER_SPACING;

    let mut w = Writer::with_capacity(HEADER_LEN + nfingers * FINGER_LEN + 32 * items.len());
    w.put3(0).put5(prev).put2(count);
    let fingers_at = w.len();
    for _ in 0..nfingers {
        w.put3(0);
    }
    for (i, item) in items.iter().enumerate() {
        if i % FINGER_SPACING == 0 {
            let pos = block_pos(w.len())?;
            w.patch3(fingers_at + FINGER_LEN * (i / FINGER_SPACING), pos);
        }
        let mut body = Writer::new();
        item.write_body(&mut body);
        let body = body.into_inner();
        w.put_str(item.key());
        w.put3(block_pos(body.len())?);
        w.put_bytes(&body);
    }
    let end = block_pos(w.len())?;
    for f in items.len().div_ceil(FINGER_SPACING)..nfingers {
        w.patch3(fingers_at + FINGER_LEN * f, end);
    }
    let size = block_pos(w.len() + CKSUM_LEN)?;
    w.patch3(0, size);
    let mut buf = w.into_inner();
    checksum::append(&mut buf);
    Ok(arena.append(&buf)?)
}

fn block_pos(n: usize) -> CoreResult<u32> {
    if n > MAX_BLOCK {
        return Err(CoreError::invariant(format!("block of {n} bytes is too large")));
    }
    Ok(n as u32)
}

/// A verified block, searchable without decoding its items.
#[derive(Debug, Clone)]
pub struct PackedBlock {
    offset: u64,
    data: Vec<u8>,
    prev: u64,
    count: usize,
}

impl PackedBlock {
    /// Reads and verifies the block at `offset`.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the block is damaged.
    pub fn read(arena: &Arena, offset: u64) -> CoreResult<Self> {
        let head = checksum::read_unit(arena, offset, SIZE_LEN)?;
        let size = Reader::new(&head).get3()? as usize;
        if size < HEADER_LEN + FINGER_LEN + CKSUM_LEN {
            return Err(CoreError::corruption(format!(
                "block at {offset} has impossible size {size}"
            )));
        }
        let data = checksum::read_unit(arena, offset, size)?;
        checksum::verify(&data)?;
        let mut r = Reader::new(&data[SIZE_LEN..]);
        let prev = r.get5()?;
        let count = usize::from(r.get2()?);
        if prev >= offset && prev != 0 {
            return Err(CoreError::corruption(format!(
                "block at {offset} links forward to {prev}"
            )));
        }
        let block = Self {
            offset,
            data,
            prev,
            count,
        };
        let items_end = block.items_end();
        for i in 0..block.nfingers() {
            let f = block.finger(i)?;
            if f < block.items_start() || f > items_end {
                return Err(CoreError::corruption(format!(
                    "finger {i} of block at {offset} points outside its items"
                )));
            }
        }
        Ok(block)
    }

    /// Offset of this block.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset of the previous generation block, 0 if none.
    #[must_use]
    pub fn prev(&self) -> u64 {
        self.prev
    }

    /// Number of items.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    fn nfingers(&self) -> usize {
        1 + self.count / FINGER_SPACING
    }

    fn items_start(&self) -> usize {
        HEADER_LEN + FINGER_LEN * self.nfingers()
    }

    fn items_end(&self) -> usize {
        self.data.len() - CKSUM_LEN
    }

    fn finger(&self, i: usize) -> CoreResult<usize> {
        let at = HEADER_LEN + FINGER_LEN * i;
        Ok(Reader::new(&self.data[at..at + FINGER_LEN]).get3()? as usize)
    }

    /// Decodes the item header at `pos`: key, body and the position of the
    /// next item.
    fn item_at(&self, pos: usize) -> CoreResult<(&str, &[u8], usize)> {
        let mut r = Reader::new(&self.data[pos..self.items_end()]);
        let key = r.get_str()?;
        let len = r.get3()? as usize;
        let body = r.get_bytes(len)?;
        Ok((key, body, pos + r.pos()))
    }

    /// Position of the item with `key`.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the binary search needs more than
    /// `max_probe` probes, which cannot happen in a well formed block.
    fn find(&self, key: &str, max_probe: usize) -> CoreResult<Option<usize>> {
        let used = self.count.div_ceil(FINGER_SPACING);
        if used == 0 {
            return Ok(None);
        }
        let (mut lo, mut hi) = (0, used);
        let mut probes = 0;
        while hi - lo > 1 {
            probes += 1;
            if probes > max_probe {
                tracing::warn!(offset = self.offset, probes, "finger search exceeded probe limit");
                return Err(CoreError::invariant(format!(
                    "finger search in block at {} exceeded {max_probe} probes",
                    self.offset
                )));
            }
            let mid = (lo + hi) / 2;
            if self.item_at(self.finger(mid)?)?.0 <= key {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let mut pos = self.finger(lo)?;
        for _ in 0..FINGER_SPACING {
            if pos >= self.items_end() {
                break;
            }
            let (k, _, next) = self.item_at(pos)?;
            match k.cmp(key) {
                std::cmp::Ordering::Less => pos = next,
                std::cmp::Ordering::Equal => return Ok(Some(pos)),
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Looks up and decodes the item with `key`.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the block is malformed.
    pub fn get<T: PackedItem>(&self, key: &str, ctx: &T::Context, max_probe: usize) -> CoreResult<Option<T>> {
        let Some(pos) = self.find(key, max_probe)? else {
            return Ok(None);
        };
        let (key, body, _) = self.item_at(pos)?;
        T::read_body(key, &mut Reader::new(body), ctx).map(Some)
    }

    /// Decodes every item in key order.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the block is malformed.
    pub fn items<T: PackedItem>(&self, ctx: &T::Context) -> CoreResult<Vec<T>> {
        let mut items = Vec::with_capacity(self.count);
        let mut pos = self.items_start();
        for _ in 0..self.count {
            let (key, body, next) = self.item_at(pos)?;
            items.push(T::read_body(key, &mut Reader::new(body), ctx)?);
            pos = next;
        }
        if pos != self.items_end() {
            return Err(CoreError::corruption(format!(
                "block at {} has trailing bytes",
                self.offset
            )));
        }
        Ok(items)
    }
}

/// A chain of packed generation blocks, newest first, used for read-only
/// lookups without building a trie.
#[derive(Debug, Clone)]
pub struct PackedHamt {
    blocks: Vec<PackedBlock>,
    max_probe: usize,
}

impl PackedHamt {
    /// Reads the chain starting at `offset`. Offset 0 is an empty chain.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if any block is damaged.
    pub fn open(arena: &Arena, offset: u64, max_probe: usize) -> CoreResult<Self> {
        let mut blocks = Vec::new();
        let mut off = offset;
        while off != 0 {
            let block = PackedBlock::read(arena, off)?;
            off = block.prev();
            blocks.push(block);
        }
        Ok(Self { blocks, max_probe })
    }

    /// Block offsets, newest first.
    #[must_use]
    pub fn offsets(&self) -> Vec<u64> {
        self.blocks.iter().map(PackedBlock::offset).collect()
    }

    /// The blocks, newest first.
    #[must_use]
    pub fn blocks(&self) -> &[PackedBlock] {
        &self.blocks
    }

    /// Looks up `key`; the newest generation holding it wins.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if a block is malformed.
    pub fn get<T: PackedItem>(&self, key: &str, ctx: &T::Context) -> CoreResult<Option<T>> {
        for block in &self.blocks {
            if let Some(item) = block.get(key, ctx, self.max_probe)? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Rebuilds a live trie from every generation, newer items replacing
    /// older ones.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if a block is malformed.
    pub fn to_hamt<T: PackedItem>(&self, ctx: &T::Context) -> CoreResult<Hamt<T>> {
        let mut hamt = Hamt::new().mutable();
        for block in self.blocks.iter().rev() {
            for item in block.items::<T>(ctx)? {
                hamt.put(item);
            }
        }
        Ok(hamt.freeze())
    }
}

impl<T: PackedItem> Hamt<T> {
    /// Writes the items accepted by `filter` as a new block linked to
    /// `prev`, returning its offset.
    ///
    /// # Errors
    ///
    /// See [`write_block`].
    pub fn write<F>(&self, arena: &Arena, prev: u64, mut filter: F) -> CoreResult<u64>
    where
        F: FnMut(&T) -> bool,
    {
        let items: Vec<&T> = self.values().into_iter().filter(|t| filter(*t)).collect();
        write_block(arena, items, prev)
    }
}
