//! # StrataDB Storage
//!
//! The lowest layer of StrataDB: opaque byte backends and the append-only
//! arena built on top of them.
//!
//! Backends do not interpret what they store. The [`Arena`] adds exactly two
//! things: a header that keeps offset 0 unused, and the guarantee that bytes
//! behind a returned offset are never moved or rewritten. Everything
//! persisted above this crate (B-tree nodes, records, metadata blocks) is
//! addressed by arena offsets.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and heap-only stores
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use stratadb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod arena;
mod backend;
mod error;
mod file;
mod memory;

pub use arena::{Arena, ArenaOptions, ARENA_HEADER_SIZE, ARENA_MAGIC, ARENA_MAX_SIZE};
pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
