//! # StrataDB Testkit
//!
//! Test utilities for StrataDB.
//!
//! This crate provides:
//! - Test fixtures: in-memory and file-backed stores, sample schemas
//! - Property-based test generators using proptest
//! - A metadata harness that mirrors every commit in a reference model
//! - Stress testing with concurrent snapshot readers
//! - Corruption scenarios for integrity checking
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stratadb_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_harness() {
//!     let mut h = MetaHarness::new(TestStore::file());
//!     h.create_table(scenarios::customers_schema());
//!     h.commit("customers", &[RowChange::Upsert { id: 1, value: "paris".into() }]);
//!     h.persist(false);
//!     h.reopen();
//!     h.verify();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
