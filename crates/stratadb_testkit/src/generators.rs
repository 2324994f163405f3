//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use proptest::prelude::*;
use stratadb_core::MAX_KEY_LEN;

/// Strategy for generating index keys within the key length limit.
///
/// Keys share short prefixes often, which exercises prefix compression.
pub fn index_key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::string::string_regex("[a-c]{1,6}")
            .expect("Invalid regex")
            .prop_map(String::into_bytes),
        prop::collection::vec(any::<u8>(), 1..32),
    ]
    .prop_filter("Key must fit a node entry", |k| k.len() <= MAX_KEY_LEN)
}

/// Strategy for generating valid table names.
pub fn table_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating column values.
pub fn value_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{0,8}").expect("Invalid regex")
}

/// A change to one row, identified by its primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowChange {
    /// Insert the row, or replace it if it exists.
    Upsert {
        /// Primary key.
        id: u32,
        /// Value of every non-key column.
        value: String,
    },
    /// Delete the row if it exists.
    Delete {
        /// Primary key.
        id: u32,
    },
}

/// Strategy for generating a change to a row with id below `max_id`.
pub fn row_change_strategy(max_id: u32) -> impl Strategy<Value = RowChange> {
    prop_oneof![
        3 => (0..max_id, value_strategy()).prop_map(|(id, value)| RowChange::Upsert { id, value }),
        1 => (0..max_id).prop_map(|id| RowChange::Delete { id }),
    ]
}

/// Strategy for generating the changes of one transaction.
pub fn transaction_strategy(max_id: u32, max_len: usize) -> impl Strategy<Value = Vec<RowChange>> {
    prop::collection::vec(row_change_strategy(max_id), 0..max_len)
}

/// What to do with metadata between transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStep {
    /// Nothing.
    None,
    /// Incremental persist.
    Persist,
    /// Full consolidation.
    Flatten,
    /// Incremental persist, then read everything back from disk.
    PersistAndReopen,
}

/// Strategy for generating persist steps, mostly no-ops.
pub fn persist_step_strategy() -> impl Strategy<Value = PersistStep> {
    prop_oneof![
        4 => Just(PersistStep::None),
        3 => Just(PersistStep::Persist),
        1 => Just(PersistStep::Flatten),
        2 => Just(PersistStep::PersistAndReopen),
    ]
}

/// Strategy for generating a workload of transactions, each followed by a
/// persist step.
pub fn workload_strategy(
    max_id: u32,
    transactions: usize,
) -> impl Strategy<Value = Vec<(Vec<RowChange>, PersistStep)>> {
    prop::collection::vec(
        (transaction_strategy(max_id, 12), persist_step_strategy()),
        1..transactions,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn test_index_keys_fit() {
        let mut runner = TestRunner::default();
        for _ in 0..100 {
            let key = index_key_strategy().new_tree(&mut runner).unwrap().current();
            assert!(!key.is_empty());
            assert!(key.len() <= MAX_KEY_LEN);
        }
    }

    #[test]
    fn test_row_changes_in_range() {
        let mut runner = TestRunner::default();
        for _ in 0..100 {
            let change = row_change_strategy(10).new_tree(&mut runner).unwrap().current();
            let id = match change {
                RowChange::Upsert { id, .. } | RowChange::Delete { id } => id,
            };
            assert!(id < 10);
        }
    }

    proptest! {
        #[test]
        fn test_table_names_are_valid(name in table_name_strategy()) {
            prop_assert!(!name.is_empty());
            prop_assert!(name.len() <= 16);
        }
    }
}
