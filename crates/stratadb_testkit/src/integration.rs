//! Cross-crate integration test helpers.
//!
//! [`MetaHarness`] drives metadata the way a transaction manager would
//! (mutable copy, index changes, layering, merge, persist) and mirrors every
//! commit in a plain reference model, so any divergence can be checked.

use crate::fixtures::{scenarios, TestStore};
use crate::generators::{PersistStep, RowChange};
use std::collections::BTreeMap;
use std::sync::Arc;
use stratadb_core::{Info, Meta, MetaRoot, Record, Schema, TransactionId};

/// Expected contents of one table: rows keyed by primary key, with the
/// arena offset each was written at.
#[derive(Debug, Clone)]
pub struct TableModel {
    /// The table schema.
    pub schema: Schema,
    /// Rows by primary key.
    pub rows: BTreeMap<Vec<u8>, (Record, u64)>,
}

/// A test harness for metadata integration testing.
pub struct IntegrationHarness {
    store: TestStore,
    meta: Meta,
    next_tran: u64,
    tables: BTreeMap<String, TableModel>,
    /// Model as of the last applied persist.
    persisted: BTreeMap<String, TableModel>,
}

/// Shorter name used throughout the tests.
pub type MetaHarness = IntegrationHarness;

impl IntegrationHarness {
    /// Creates a new harness with empty metadata on `store`.
    pub fn new(store: TestStore) -> Self {
        let meta = store.new_meta();
        Self {
            store,
            meta,
            next_tran: 1,
            tables: BTreeMap::new(),
            persisted: BTreeMap::new(),
        }
    }

    /// The current metadata snapshot.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// The underlying store.
    pub fn store(&self) -> &TestStore {
        &self.store
    }

    /// The model of `table`, if it exists.
    pub fn table(&self, table: &str) -> Option<&TableModel> {
        self.tables.get(table)
    }

    /// Adds an empty table.
    pub fn create_table(&mut self, schema: Schema) {
        let info = Info::create(self.store.env(), &schema).expect("Failed to create table info");
        self.meta = self.meta.put(schema.clone(), info).expect("Failed to add table");
        self.tables.insert(
            schema.table.clone(),
            TableModel {
                schema,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Drops a table.
    pub fn drop_table(&mut self, table: &str) {
        self.meta = self
            .meta
            .drop_table(table)
            .expect("Failed to drop table")
            .expect("Table should exist");
        self.tables.remove(table);
    }

    /// Commits one transaction applying `changes` to `table` and merges it.
    pub fn commit(&mut self, table: &str, changes: &[RowChange]) -> TransactionId {
        let tran = TransactionId::new(self.next_tran);
        self.next_tran += 1;
        let model = self.tables.get_mut(table).expect("Unknown table");
        let mut tm = self.meta.mutable().expect("Failed to start transaction");
        let ti = tm
            .get_rw_info(table, tran)
            .expect("Failed to get writable info")
            .expect("Table missing from meta");
        let arena = self.store.arena();

        for change in changes {
            match change {
                RowChange::Upsert { id, value } => {
                    let rec = scenarios::row(&model.schema, *id, value);
                    let off = rec.write(arena).expect("Failed to write record");
                    let pk = model.schema.indexes[0].key(&rec);
                    let size = rec.encoded_len() as i64;
                    match model.rows.get(&pk).cloned() {
                        Some((old, old_off)) => {
                            for ov in &mut ti.indexes {
                                let spec = Arc::clone(ov.base().spec());
                                let (old_key, key) = (spec.key(&old), spec.key(&rec));
                                if old_key == key {
                                    ov.update(&key, off).expect("Failed to update index");
                                } else {
                                    ov.delete(&old_key, old_off).expect("Failed to delete index key");
                                    ov.insert(&key, off).expect("Failed to insert index key");
                                }
                            }
                            ti.size += size - old.encoded_len() as i64;
                        }
                        None => {
                            for ov in &mut ti.indexes {
                                let key = ov.base().spec().key(&rec);
                                ov.insert(&key, off).expect("Failed to insert index key");
                            }
                            ti.nrows += 1;
                            ti.size += size;
                        }
                    }
                    model.rows.insert(pk, (rec, off));
                }
                RowChange::Delete { id } => {
                    let pk = scenarios::row_id(*id).into_bytes();
                    if let Some((old, old_off)) = model.rows.remove(&pk) {
                        for ov in &mut ti.indexes {
                            let key = ov.base().spec().key(&old);
                            ov.delete(&key, old_off).expect("Failed to delete index key");
                        }
                        ti.nrows -= 1;
                        ti.size -= old.encoded_len() as i64;
                    }
                }
            }
        }

        let mut latest = tm.layered_onto(&self.meta).expect("Failed to layer transaction");
        let updates = latest.merge(tran).expect("Failed to merge transaction");
        latest.apply_merge(updates).expect("Failed to apply merge");
        self.meta = latest;
        tran
    }

    /// Persists and applies the result, returning the new root.
    pub fn persist(&mut self, flatten: bool) -> MetaRoot {
        let update = self.meta.persist(flatten).expect("Failed to persist meta");
        let root = update.root();
        self.meta.apply_persist(update);
        self.persisted = self.tables.clone();
        root
    }

    /// Reopens the store and reads the last persisted metadata back.
    /// Anything not persisted is lost, as after a restart.
    pub fn reopen(&mut self) {
        self.store = self.store.reopen();
        self.meta = Meta::read(Arc::clone(self.store.env()), self.meta.root()).expect("Failed to read meta");
        self.tables = self.persisted.clone();
    }

    /// Runs one persist step.
    pub fn step(&mut self, step: PersistStep) {
        match step {
            PersistStep::None => {}
            PersistStep::Persist => {
                self.persist(false);
            }
            PersistStep::Flatten => {
                self.persist(true);
            }
            PersistStep::PersistAndReopen => {
                self.persist(false);
                self.reopen();
            }
        }
    }

    /// Verifies the metadata against the model: table set, row counts,
    /// every index entry, and a full integrity check.
    pub fn verify(&self) {
        let mut tables = Vec::new();
        self.meta.for_each_schema(|ts| tables.push(ts.table.clone()));
        tables.sort();
        let expected: Vec<_> = self.tables.keys().cloned().collect();
        assert_eq!(tables, expected, "Table set mismatch");

        for (name, model) in &self.tables {
            let info = self.meta.get_ro_info(name).expect("Missing table info");
            assert_eq!(info.nrows, model.rows.len() as i64, "Row count mismatch for {}", name);
            let size: i64 = model.rows.values().map(|(rec, _)| rec.encoded_len() as i64).sum();
            assert_eq!(info.size, size, "Size mismatch for {}", name);
            for ov in &info.indexes {
                let spec = ov.base().spec();
                for (rec, off) in model.rows.values() {
                    assert_eq!(
                        ov.lookup(&spec.key(rec)).expect("Lookup failed"),
                        Some(*off),
                        "Index {} of {} lost a row",
                        spec.name,
                        name
                    );
                }
                let count = ov.base().iter().count();
                assert_eq!(count, model.rows.len(), "Index {} of {} has extra entries", spec.name, name);
            }
        }
        self.meta.check().expect("Meta check failed");
    }

    /// Returns the count of tracked rows across all tables.
    pub fn tracked_rows(&self) -> usize {
        self.tables.values().map(|t| t.rows.len()).sum()
    }
}
