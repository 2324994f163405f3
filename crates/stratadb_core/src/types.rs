//! Core type definitions for StrataDB.

use std::fmt;

/// Transaction number assigned by the transaction manager.
///
/// Tags the mutable index layers a transaction creates so that `Merge`
/// can find them again after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tran:{}", self.0)
    }
}

/// Root descriptor for persisted metadata.
///
/// The two offsets point at the newest schema and info generation blocks.
/// Older generations are reached through each block's `prev` link. Offset 0
/// means the store is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MetaRoot {
    /// Newest schema block.
    pub schema: u64,
    /// Newest info block.
    pub info: u64,
}

impl fmt::Display for MetaRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "schema@{} info@{}", self.schema, self.info)
    }
}
