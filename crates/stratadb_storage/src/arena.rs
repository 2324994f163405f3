//! Append-only, offset-addressed byte arena.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::memory::InMemoryBackend;
use parking_lot::RwLock;
use std::fmt;

/// Magic bytes written at offset 0 of every arena.
pub const ARENA_MAGIC: [u8; 8] = *b"STRATA01";

/// Size of the arena header. No allocation ever starts below this offset,
/// which leaves offset 0 free to mean "nothing".
pub const ARENA_HEADER_SIZE: u64 = ARENA_MAGIC.len() as u64;

/// Largest arena size. Offsets are persisted in 5 bytes, so every byte must
/// sit below 1 TiB.
pub const ARENA_MAX_SIZE: u64 = 1 << 40;

/// Options for opening an [`Arena`].
#[derive(Debug, Clone, Default)]
pub struct ArenaOptions {
    /// Maximum size in bytes. `None` lets the arena grow up to
    /// [`ARENA_MAX_SIZE`].
    pub capacity: Option<u64>,
}

impl ArenaOptions {
    /// Creates options with no capacity limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the arena to `bytes` total bytes, header included.
    #[must_use]
    pub const fn capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }
}

/// An append-only byte arena on top of a [`StorageBackend`].
///
/// `alloc` reserves a fresh region, lets the caller fill it, and returns its
/// offset. Once an offset has been returned its bytes are never moved,
/// reused, or overwritten, so a reader holding an old offset can never
/// observe a partially written newer region.
///
/// Readers share the backend through a read lock; only allocation takes the
/// write lock.
///
/// # Example
///
/// ```rust
/// use stratadb_storage::Arena;
///
/// let arena = Arena::in_memory().unwrap();
/// let off = arena.alloc(4, |buf| buf.copy_from_slice(b"node")).unwrap();
/// assert_eq!(arena.read(off, 4).unwrap(), b"node");
/// ```
pub struct Arena {
    backend: RwLock<Box<dyn StorageBackend>>,
    capacity: Option<u64>,
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("size", &self.size().ok())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Arena {
    /// Opens an arena over `backend`.
    ///
    /// An empty backend is initialized with the arena header; a non-empty
    /// one must already start with it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidHeader`] if existing data does not start
    /// with the arena magic, or an I/O error from the backend.
    pub fn open(mut backend: Box<dyn StorageBackend>, options: ArenaOptions) -> StorageResult<Self> {
        let size = backend.size()?;
        if size == 0 {
            backend.append(&ARENA_MAGIC)?;
            tracing::debug!("initialized new arena");
        } else {
            if size < ARENA_HEADER_SIZE {
                return Err(StorageError::InvalidHeader(format!(
                    "arena is only {size} bytes"
                )));
            }
            let magic = backend.read_at(0, ARENA_MAGIC.len())?;
            if magic != ARENA_MAGIC {
                return Err(StorageError::InvalidHeader("bad magic".into()));
            }
            tracing::debug!(size, "opened existing arena");
        }
        Ok(Self {
            backend: RwLock::new(backend),
            capacity: options.capacity,
        })
    }

    /// Creates an unbounded arena held entirely in memory.
    ///
    /// # Errors
    ///
    /// Only fails if the in-memory backend does, which it does not in practice.
    pub fn in_memory() -> StorageResult<Self> {
        Self::open(Box::new(InMemoryBackend::new()), ArenaOptions::default())
    }

    /// Reserves `len` bytes, lets `fill` write them, and returns their offset.
    ///
    /// The region only becomes readable once `fill` has returned.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Exhausted`] if the allocation would exceed the
    /// configured capacity, or an I/O error from the backend.
    pub fn alloc<F>(&self, len: usize, fill: F) -> StorageResult<u64>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut buf = vec![0u8; len];
        fill(&mut buf);
        self.append(&buf)
    }

    /// Appends already encoded bytes and returns their offset.
    ///
    /// # Errors
    ///
    /// Same as [`Arena::alloc`].
    pub fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let mut backend = self.backend.write();
        let capacity = self.capacity.map_or(ARENA_MAX_SIZE, |c| c.min(ARENA_MAX_SIZE));
        let size = backend.size()?;
        if size.saturating_add(data.len() as u64) > capacity {
            return Err(StorageError::Exhausted {
                requested: data.len(),
                capacity,
            });
        }
        backend.append(data)
    }

    /// Reads `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not fully inside the written part of
    /// the arena or starts inside the header.
    pub fn read(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        Self::check_offset(offset)?;
        self.backend.read().read_at(offset, len)
    }

    /// Reads up to `max_len` bytes at `offset`, stopping at the end of the arena.
    ///
    /// # Errors
    ///
    /// Returns an error if `offset` itself is out of range.
    pub fn read_up_to(&self, offset: u64, max_len: usize) -> StorageResult<Vec<u8>> {
        Self::check_offset(offset)?;
        let backend = self.backend.read();
        let size = backend.size()?;
        if offset > size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len: max_len,
                size,
            });
        }
        let available = usize::try_from(size - offset).unwrap_or(usize::MAX);
        backend.read_at(offset, max_len.min(available))
    }

    fn check_offset(offset: u64) -> StorageResult<()> {
        if offset < ARENA_HEADER_SIZE {
            return Err(StorageError::Corrupted(format!(
                "offset {offset} points into the arena header"
            )));
        }
        Ok(())
    }

    /// Returns the number of bytes written so far, header included.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> StorageResult<u64> {
        self.backend.read().size()
    }

    /// Returns the configured capacity, if any.
    #[must_use]
    pub fn capacity(&self) -> Option<u64> {
        self.capacity
    }

    /// Flushes buffered writes to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend flush fails.
    pub fn flush(&self) -> StorageResult<()> {
        self.backend.write().flush()
    }

    /// Makes everything written so far durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend sync fails.
    pub fn sync(&self) -> StorageResult<()> {
        self.backend.write().sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileBackend;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn arena_never_hands_out_offset_zero() {
        let arena = Arena::in_memory().unwrap();
        let off = arena.append(b"x").unwrap();
        assert_eq!(off, ARENA_HEADER_SIZE);
        assert!(arena.read(0, 1).is_err());
    }

    #[test]
    fn alloc_fills_region() {
        let arena = Arena::in_memory().unwrap();
        let off = arena
            .alloc(6, |buf| {
                buf[..3].copy_from_slice(b"abc");
                buf[3..].copy_from_slice(b"def");
            })
            .unwrap();
        assert_eq!(arena.read(off, 6).unwrap(), b"abcdef");
    }

    #[test]
    fn capacity_reports_exhaustion() {
        let backend = Box::new(InMemoryBackend::new());
        let arena = Arena::open(backend, ArenaOptions::new().capacity(16)).unwrap();
        arena.append(&[1; 8]).unwrap();
        let err = arena.append(&[2; 1]).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Exhausted {
                requested: 1,
                capacity: 16
            }
        ));
        assert_eq!(arena.size().unwrap(), 16);
    }

    /// Reports a huge size without holding the bytes.
    #[derive(Debug)]
    struct SparseBackend {
        size: u64,
    }

    impl StorageBackend for SparseBackend {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            if offset == 0 {
                return Ok(ARENA_MAGIC[..len].to_vec());
            }
            Ok(vec![0; len])
        }

        fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
            let off = self.size;
            self.size += data.len() as u64;
            Ok(off)
        }

        fn flush(&mut self) -> StorageResult<()> {
            Ok(())
        }

        fn size(&self) -> StorageResult<u64> {
            Ok(self.size)
        }

        fn sync(&mut self) -> StorageResult<()> {
            Ok(())
        }
    }

    #[test]
    fn append_stops_at_max_size() {
        let backend = Box::new(SparseBackend {
            size: ARENA_MAX_SIZE - 4,
        });
        let arena = Arena::open(backend, ArenaOptions::new().capacity(u64::MAX)).unwrap();
        assert_eq!(arena.append(b"last").unwrap(), ARENA_MAX_SIZE - 4);
        let err = arena.append(b"x").unwrap_err();
        assert!(matches!(
            err,
            StorageError::Exhausted {
                requested: 1,
                capacity: ARENA_MAX_SIZE
            }
        ));
    }

    #[test]
    fn read_up_to_clamps_at_end() {
        let arena = Arena::in_memory().unwrap();
        let off = arena.append(b"tail").unwrap();
        assert_eq!(arena.read_up_to(off, 100).unwrap(), b"tail");
        assert!(arena.read_up_to(off + 100, 1).is_err());
    }

    #[test]
    fn open_rejects_foreign_data() {
        let backend = Box::new(InMemoryBackend::with_data(b"NOTANARENA".to_vec()));
        let err = Arena::open(backend, ArenaOptions::default()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidHeader(_)));

        let backend = Box::new(InMemoryBackend::with_data(b"STR".to_vec()));
        assert!(Arena::open(backend, ArenaOptions::default()).is_err());
    }

    #[test]
    fn file_arena_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arena.db");

        let off = {
            let arena =
                Arena::open(Box::new(FileBackend::open(&path).unwrap()), ArenaOptions::default())
                    .unwrap();
            let off = arena.append(b"durable").unwrap();
            arena.sync().unwrap();
            off
        };

        let arena = Arena::open(
            Box::new(FileBackend::open_existing(&path).unwrap()),
            ArenaOptions::default(),
        )
        .unwrap();
        assert_eq!(arena.read(off, 7).unwrap(), b"durable");
    }

    #[test]
    fn readers_see_stable_bytes_during_appends() {
        let arena = Arc::new(Arena::in_memory().unwrap());
        let off = arena.append(b"stable").unwrap();

        let writer = {
            let arena = Arc::clone(&arena);
            thread::spawn(move || {
                for i in 0..500u32 {
                    arena.append(&i.to_be_bytes()).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let arena = Arc::clone(&arena);
                thread::spawn(move || {
                    for _ in 0..500 {
                        assert_eq!(arena.read(off, 6).unwrap(), b"stable");
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(arena.size().unwrap(), ARENA_HEADER_SIZE + 6 + 2000);
    }

    proptest! {
        #[test]
        fn offsets_are_monotonic_and_contents_stable(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..32)
        ) {
            let arena = Arena::in_memory().unwrap();
            let mut written = Vec::new();
            let mut last = 0;
            for chunk in &chunks {
                let off = arena.append(chunk).unwrap();
                prop_assert!(off > last || last == 0);
                last = off;
                written.push((off, chunk.clone()));
            }
            for (off, chunk) in written {
                prop_assert_eq!(arena.read(off, chunk.len()).unwrap(), chunk);
            }
        }
    }
}
