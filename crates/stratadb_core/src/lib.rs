//! # StrataDB Core
//!
//! Immutable data structures for StrataDB, all stored in an append-only
//! [`Arena`](stratadb_storage::Arena).
//!
//! This crate provides:
//! - [`Btree`] - prefix-compressed, checksummed B-tree whose merges produce
//!   new versions sharing untouched subtrees
//! - [`DeltaBuffer`] and [`Overlay`] - buffered index changes layered over a
//!   base tree until they are merged
//! - [`Hamt`] - persistent hash trie with generation copy-on-write, and a
//!   packed, finger-indexed on-disk form ([`PackedHamt`])
//! - [`Meta`] - table schemas and statistics with clocked, incremental
//!   persistence
//!
//! Nothing that has been published is ever modified, so readers work on
//! snapshots without locks. Damage found while reading is reported as a
//! fatal [`CoreError`] (see [`CoreError::is_fatal`]) and never repaired in
//! place.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use stratadb_core::{Config, Env, Info, Meta, Record, RecordKeys, Schema, IndexSpec, TransactionId};
//! use stratadb_storage::Arena;
//!
//! let arena = Arc::new(Arena::in_memory().unwrap());
//! let env = Arc::new(Env::new(arena, Arc::new(RecordKeys), Config::new()));
//! let schema = Schema::new("users", vec!["id".into()], vec![IndexSpec::new("id", vec![0])]);
//! let info = Info::create(&env, &schema).unwrap();
//! let meta = Meta::new(env.clone()).put(schema, info).unwrap();
//!
//! let tran = TransactionId::new(1);
//! let mut tm = meta.mutable().unwrap();
//! let rec = Record::new(vec![b"alice".to_vec()]);
//! let off = rec.write(env.arena()).unwrap();
//! let ti = tm.get_rw_info("users", tran).unwrap().unwrap();
//! ti.indexes[0].insert(b"alice", off).unwrap();
//! ti.nrows += 1;
//!
//! let mut latest = tm.layered_onto(&meta).unwrap();
//! let updates = latest.merge(tran).unwrap();
//! latest.apply_merge(updates).unwrap();
//! let info = latest.get_ro_info("users").unwrap();
//! assert_eq!(info.indexes[0].lookup(b"alice").unwrap(), Some(off));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod btree;
pub mod checksum;
mod config;
mod delta;
pub mod encoding;
mod env;
mod error;
pub mod hamt;
mod ixkey;
pub mod meta;
mod overlay;
pub mod record;
mod types;

pub use btree::{Btree, CheckStats, LeafKeys, MAX_KEY_LEN};
pub use config::Config;
pub use delta::{DeltaBuffer, DeltaOp};
pub use env::Env;
pub use error::{CoreError, CoreResult};
pub use hamt::{Hamt, HamtItem, HamtMut, PackedHamt, PackedItem};
pub use ixkey::IndexSpec;
pub use meta::{
    ConsolidationPolicy, Info, MergeSize, MergeUpdate, Meta, PersistUpdate, Schema, TrailingOnes,
};
pub use overlay::{Layer, Overlay};
pub use record::{Record, RecordKeys};
pub use types::{MetaRoot, TransactionId};
