//! Sorted buffer of pending index operations.

use crate::btree::MAX_KEY_LEN;
use crate::error::{CoreError, CoreResult};
use std::collections::btree_map::{self, BTreeMap};

/// A pending change to one index key. The payload is a record offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
    /// Add a key that is not in the base tree.
    Insert(u64),
    /// Point an existing key at a new record.
    Update(u64),
    /// Remove an existing key.
    Delete(u64),
}

impl DeltaOp {
    /// Record offset carried by the operation.
    #[must_use]
    pub fn offset(self) -> u64 {
        match self {
            Self::Insert(off) | Self::Update(off) | Self::Delete(off) => off,
        }
    }
}

/// Key-ordered operations waiting to be merged into a [`Btree`].
///
/// At most one operation is kept per key. Recording a second operation
/// for a key combines the two into their net effect, so the buffer always
/// describes a valid change relative to the tree it was built against.
///
/// [`Btree`]: crate::btree::Btree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaBuffer {
    ops: BTreeMap<Vec<u8>, DeltaOp>,
}

impl DeltaBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a pending operation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Pending operation for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<DeltaOp> {
        self.ops.get(key).copied()
    }

    /// Records an insert.
    ///
    /// # Errors
    ///
    /// See [`DeltaBuffer::apply`].
    pub fn insert(&mut self, key: &[u8], offset: u64) -> CoreResult<()> {
        self.apply(key, DeltaOp::Insert(offset))
    }

    /// Records an update.
    ///
    /// # Errors
    ///
    /// See [`DeltaBuffer::apply`].
    pub fn update(&mut self, key: &[u8], offset: u64) -> CoreResult<()> {
        self.apply(key, DeltaOp::Update(offset))
    }

    /// Records a delete.
    ///
    /// # Errors
    ///
    /// See [`DeltaBuffer::apply`].
    pub fn delete(&mut self, key: &[u8], offset: u64) -> CoreResult<()> {
        self.apply(key, DeltaOp::Delete(offset))
    }

    /// Records `op` for `key`, combining it with any pending operation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyTooLong`] for keys over [`MAX_KEY_LEN`], and
    /// [`CoreError::InvariantViolation`] for sequences that cannot happen
    /// against a consistent tree, such as inserting a key twice.
    pub fn apply(&mut self, key: &[u8], op: DeltaOp) -> CoreResult<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(CoreError::KeyTooLong {
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        let mut slot = match self.ops.entry(key.to_vec()) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(op);
                return Ok(());
            }
            btree_map::Entry::Occupied(slot) => slot,
        };
        let combined = match (*slot.get(), op) {
            (DeltaOp::Insert(_), DeltaOp::Update(off)) => Some(DeltaOp::Insert(off)),
            (DeltaOp::Insert(_), DeltaOp::Delete(_)) => None,
            (DeltaOp::Update(_), DeltaOp::Update(off)) => Some(DeltaOp::Update(off)),
            (DeltaOp::Update(_), DeltaOp::Delete(off)) => Some(DeltaOp::Delete(off)),
            (DeltaOp::Delete(_), DeltaOp::Insert(off)) => Some(DeltaOp::Update(off)),
            (prev, op) => {
                return Err(CoreError::invariant(format!(
                    "{op:?} after {prev:?} for key {}",
                    String::from_utf8_lossy(key)
                )));
            }
        };
        match combined {
            Some(op) => {
                slot.insert(op);
            }
            None => {
                slot.remove();
            }
        }
        Ok(())
    }

    /// Iterates pending operations in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], DeltaOp)> + '_ {
        self.ops.iter().map(|(k, op)| (k.as_slice(), *op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_combine_to_net_effect() {
        let mut d = DeltaBuffer::new();
        d.insert(b"a", 1).unwrap();
        d.update(b"a", 2).unwrap();
        assert_eq!(d.get(b"a"), Some(DeltaOp::Insert(2)));
        d.delete(b"a", 2).unwrap();
        assert_eq!(d.get(b"a"), None);
        assert!(d.is_empty());

        d.update(b"b", 5).unwrap();
        d.delete(b"b", 5).unwrap();
        assert_eq!(d.get(b"b"), Some(DeltaOp::Delete(5)));
        d.insert(b"b", 6).unwrap();
        assert_eq!(d.get(b"b"), Some(DeltaOp::Update(6)));
    }

    #[test]
    fn impossible_sequences_are_rejected() {
        let mut d = DeltaBuffer::new();
        d.insert(b"k", 1).unwrap();
        assert!(d.insert(b"k", 2).unwrap_err().is_fatal());

        let mut d = DeltaBuffer::new();
        d.delete(b"k", 1).unwrap();
        assert!(d.update(b"k", 2).is_err());
        assert!(d.delete(b"k", 1).is_err());
    }

    #[test]
    fn iteration_is_key_ordered() {
        let mut d = DeltaBuffer::new();
        d.insert(b"m", 1).unwrap();
        d.insert(b"a", 2).unwrap();
        d.delete(b"z", 3).unwrap();
        let keys: Vec<&[u8]> = d.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&b"a"[..], &b"m"[..], &b"z"[..]]);
        assert_eq!(d.get(b"z").map(DeltaOp::offset), Some(3));
    }

    #[test]
    fn long_keys_rejected() {
        let mut d = DeltaBuffer::new();
        let err = d.insert(&[7; MAX_KEY_LEN + 1], 1).unwrap_err();
        assert!(matches!(err, CoreError::KeyTooLong { .. }));
        d.insert(&[7; MAX_KEY_LEN], 1).unwrap();
    }
}
