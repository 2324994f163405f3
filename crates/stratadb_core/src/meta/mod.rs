//! Table metadata: schemas and per-table info, with clocked persistence.
//!
//! A [`Meta`] is an immutable snapshot of two tries, one of [`Schema`]s and
//! one of [`Info`]s. Every change produces a new snapshot, so readers holding
//! an older one are never disturbed. A transaction works on a mutable copy
//! ([`Meta::mutable`]) that collects per-table deltas; on commit the deltas
//! are layered onto the latest snapshot ([`Meta::layered_onto`]) and the
//! index layers are later folded into the base trees ([`Meta::merge`] and
//! [`Meta::apply_merge`]).
//!
//! Each trie is persisted as a chain of generation blocks, newest first.
//! A persist writes one block holding the entries modified within the time
//! span picked by the [`ConsolidationPolicy`] and replaces that many of the
//! newest generations. A full consolidation writes every live entry as a
//! single generation and omits dropped tables.

mod info;
mod policy;
mod schema;

pub use info::Info;
pub use policy::{ConsolidationPolicy, MergeSize, TrailingOnes};
pub use schema::Schema;

use crate::btree::Btree;
use crate::env::Env;
use crate::error::{CoreError, CoreResult};
use crate::hamt::{Hamt, HamtItem, HamtMut, PackedHamt, PackedItem};
use crate::types::{MetaRoot, TransactionId};
use policy::{clock_for, nth, replace};
use std::fmt;
use std::sync::Arc;

/// Modification clock bookkeeping shared by schema and info entries.
pub(crate) trait Stamped {
    fn lastmod(&self) -> u64;
    fn set_lastmod(&mut self, clock: u64);
    fn is_tombstone(&self) -> bool;
}

/// A merged index tree waiting to be published by [`Meta::apply_merge`].
#[derive(Debug, Clone)]
pub struct MergeUpdate {
    table: String,
    index: usize,
    tran: TransactionId,
    btree: Btree,
}

impl MergeUpdate {
    /// Table the tree belongs to.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Position of the index within the table.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The merged transaction.
    #[must_use]
    pub fn tran(&self) -> TransactionId {
        self.tran
    }

    /// The new base tree.
    #[must_use]
    pub fn btree(&self) -> &Btree {
        &self.btree
    }
}

/// Result of persisting one trie.
struct StoreUpdate<T> {
    offs: Vec<u64>,
    clock: u64,
    /// The trie as written, to detect entries changed before the update is
    /// applied.
    snapshot: Hamt<T>,
    full: bool,
    written: bool,
}

impl<T> fmt::Debug for StoreUpdate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreUpdate")
            .field("offs", &self.offs)
            .field("clock", &self.clock)
            .field("full", &self.full)
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

/// Generations written by [`Meta::persist`], waiting to be published by
/// [`Meta::apply_persist`].
#[derive(Debug)]
pub struct PersistUpdate {
    root: MetaRoot,
    schema: StoreUpdate<Schema>,
    info: StoreUpdate<Info>,
}

impl PersistUpdate {
    /// Root descriptor of the written state.
    #[must_use]
    pub fn root(&self) -> MetaRoot {
        self.root
    }
}

/// Schema and info metadata snapshot.
#[derive(Debug, Clone)]
pub struct Meta {
    env: Arc<Env>,
    policy: Arc<dyn ConsolidationPolicy>,
    schema: Hamt<Schema>,
    info: Hamt<Info>,
    /// Per-transaction deltas, present only on a mutable copy.
    dif_info: Option<HamtMut<Info>>,
    schema_offs: Vec<u64>,
    info_offs: Vec<u64>,
    schema_clock: u64,
    info_clock: u64,
}

impl Meta {
    /// Empty metadata with the default [`TrailingOnes`] schedule.
    #[must_use]
    pub fn new(env: Arc<Env>) -> Self {
        Self {
            env,
            policy: Arc::new(TrailingOnes),
            schema: Hamt::new(),
            info: Hamt::new(),
            dif_info: None,
            schema_offs: Vec::new(),
            info_offs: Vec::new(),
            schema_clock: 0,
            info_clock: 0,
        }
    }

    /// Replaces the consolidation policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn ConsolidationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// The environment this metadata lives in.
    #[must_use]
    pub fn env(&self) -> &Arc<Env> {
        &self.env
    }

    /// True if this is a transaction's mutable copy.
    #[must_use]
    pub fn is_mutable(&self) -> bool {
        self.dif_info.is_some()
    }

    /// Number of persisted schema and info generations.
    #[must_use]
    pub fn generations(&self) -> (usize, usize) {
        (self.schema_offs.len(), self.info_offs.len())
    }

    /// Root descriptor of the last applied persist.
    #[must_use]
    pub fn root(&self) -> MetaRoot {
        MetaRoot {
            schema: nth(&self.schema_offs, 0),
            info: nth(&self.info_offs, 0),
        }
    }

    fn ensure_no_overlay(&self, op: &str) -> CoreResult<()> {
        if self.dif_info.is_some() {
            tracing::warn!(op, "transaction overlay pending");
            return Err(CoreError::invariant(format!(
                "{op} with a transaction overlay pending"
            )));
        }
        Ok(())
    }

    /// Returns a mutable copy for one transaction.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if this is already a mutable copy.
    pub fn mutable(&self) -> CoreResult<Self> {
        self.ensure_no_overlay("mutable")?;
        let mut m = self.clone();
        m.dif_info = Some(Hamt::new().mutable());
        Ok(m)
    }

    /// Info for `table`, preferring the transaction's delta. Dropped tables
    /// read as absent.
    #[must_use]
    pub fn get_ro_info(&self, table: &str) -> Option<&Info> {
        let ti = self
            .dif_info
            .as_ref()
            .and_then(|dif| dif.get(table))
            .or_else(|| self.info.get(table))?;
        (!ti.is_tombstone()).then_some(ti)
    }

    /// Schema of `table`. Dropped tables read as absent.
    #[must_use]
    pub fn get_ro_schema(&self, table: &str) -> Option<&Schema> {
        self.schema.get(table).filter(|ts| !ts.is_tombstone())
    }

    /// The transaction's writable delta for `table`, created on first use
    /// with zeroed counters and a mutable layer on every index. Later calls
    /// return the same instance.
    ///
    /// Returns `None` if the table does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if this is not a mutable copy.
    pub fn get_rw_info(&mut self, table: &str, tran: TransactionId) -> CoreResult<Option<&mut Info>> {
        let Some(dif) = self.dif_info.as_mut() else {
            return Err(CoreError::invalid_operation(
                "writable info requested from an immutable meta",
            ));
        };
        if dif.get(table).is_none() {
            let Some(ti) = self.info.get(table).filter(|ti| !ti.is_tombstone()) else {
                return Ok(None);
            };
            dif.put(ti.transaction_delta(tran));
        }
        Ok(dif.get_mut(table))
    }

    /// Adds or replaces a table.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the schema and info
    /// describe different tables or index lists, or
    /// [`CoreError::InvalidFormat`] if the schema fails [`Schema::validate`].
    pub fn put(&self, mut schema: Schema, mut info: Info) -> CoreResult<Self> {
        schema.validate()?;
        if schema.table != info.table || schema.indexes.len() != info.indexes.len() {
            return Err(CoreError::invalid_operation(format!(
                "schema and info for {} do not match",
                schema.table
            )));
        }
        schema.lastmod = self.schema_clock;
        info.lastmod = self.info_clock;
        let mut m = self.clone();
        let mut ts = self.schema.mutable();
        ts.put(schema);
        m.schema = ts.freeze();
        let mut ti = self.info.mutable();
        ti.put(info);
        m.info = ti.freeze();
        Ok(m)
    }

    /// Replaces the schema and info of `table` with tombstones.
    ///
    /// Returns `None` if the table does not exist.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation on a mutable copy.
    pub fn drop_table(&self, table: &str) -> CoreResult<Option<Self>> {
        self.ensure_no_overlay("drop table")?;
        if self.get_ro_schema(table).is_none() {
            return Ok(None);
        }
        let mut m = self.clone();
        let mut ts = self.schema.mutable();
        ts.put(Schema::tombstone(table, self.schema_clock));
        m.schema = ts.freeze();
        let mut ti = self.info.mutable();
        ti.put(Info::tombstone(table, self.info_clock));
        m.info = ti.freeze();
        tracing::debug!(table, "dropped table");
        Ok(Some(m))
    }

    /// Applies this transaction's deltas to `latest`, which may have moved
    /// on since the transaction started: row and size deltas are added and
    /// each index layer is stacked onto the latest overlay. Tables dropped
    /// in the meantime are skipped.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if `latest` is itself a mutable copy
    /// or its index list no longer matches.
    pub fn layered_onto(&self, latest: &Meta) -> CoreResult<Self> {
        latest.ensure_no_overlay("layered onto")?;
        let mut info = latest.info.mutable();
        if let Some(dif) = &self.dif_info {
            for ti in dif.values() {
                let Some(lti) = info.get(&ti.table).filter(|lti| !lti.is_tombstone()) else {
                    continue;
                };
                if lti.indexes.len() != ti.indexes.len() {
                    return Err(CoreError::invariant(format!(
                        "{} changed index count during a transaction",
                        ti.table
                    )));
                }
                let layered = Info {
                    table: ti.table.clone(),
                    nrows: lti.nrows + ti.nrows,
                    size: lti.size + ti.size,
                    indexes: ti
                        .indexes
                        .iter()
                        .zip(&lti.indexes)
                        .map(|(ov, lov)| ov.update_with(lov))
                        .collect(),
                    tombstone: false,
                    lastmod: latest.info_clock,
                };
                info.put(layered);
            }
        }
        let mut result = latest.clone();
        result.info = info.freeze();
        Ok(result)
    }

    /// Merges the index layers committed by `tran` into new base trees.
    /// Nothing is visible until the updates are passed to
    /// [`Meta::apply_merge`].
    ///
    /// # Errors
    ///
    /// Returns any merge error; all are fatal.
    pub fn merge(&self, tran: TransactionId) -> CoreResult<Vec<MergeUpdate>> {
        let mut updates = Vec::new();
        for ti in self.info.values() {
            if ti.is_tombstone() {
                continue;
            }
            for (index, ov) in ti.indexes.iter().enumerate() {
                if let Some(btree) = ov.merge(tran)? {
                    updates.push(MergeUpdate {
                        table: ti.table.clone(),
                        index,
                        tran,
                        btree,
                    });
                }
            }
        }
        tracing::debug!(%tran, updates = updates.len(), "merged transaction");
        Ok(updates)
    }

    /// Publishes merged trees. Updates for tables dropped since
    /// [`Meta::merge`] are discarded.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if an overlay no longer holds the
    /// merged layer as its oldest.
    pub fn apply_merge(&mut self, updates: Vec<MergeUpdate>) -> CoreResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let clock = self.info_clock;
        let mut info = self.info.mutable();
        for up in updates {
            let Some(ti) = info.get_mut(&up.table).filter(|ti| !ti.is_tombstone()) else {
                tracing::debug!(table = %up.table, "discarding merge of dropped table");
                continue;
            };
            let Some(ov) = ti.indexes.get(up.index) else {
                return Err(CoreError::invariant(format!(
                    "{} has no index {}",
                    up.table, up.index
                )));
            };
            let merged = ov.with_merged(up.btree, up.tran)?;
            ti.indexes[up.index] = merged;
            ti.lastmod = clock;
        }
        self.info = info.freeze();
        Ok(())
    }

    /// Writes new schema and info generations and syncs the arena.
    ///
    /// The policy picks how many of the newest generations each trie
    /// replaces; `flatten` forces a full consolidation. The written state is
    /// not recorded in this snapshot until the update is passed to
    /// [`Meta::apply_persist`].
    ///
    /// # Errors
    ///
    /// Returns an invariant violation on a mutable copy, or a storage error.
    pub fn persist(&self, flatten: bool) -> CoreResult<PersistUpdate> {
        self.ensure_no_overlay("persist")?;
        let schema = self.persist_store("schema", &self.schema, &self.schema_offs, self.schema_clock, flatten)?;
        let info = self.persist_store("info", &self.info, &self.info_offs, self.info_clock, flatten)?;
        self.env.arena().sync()?;
        let root = MetaRoot {
            schema: nth(&schema.offs, 0),
            info: nth(&info.offs, 0),
        };
        tracing::info!(%root, flatten, "persisted meta");
        Ok(PersistUpdate { root, schema, info })
    }

    fn persist_store<T: PackedItem + Stamped>(
        &self,
        store: &'static str,
        hamt: &Hamt<T>,
        offs: &[u64],
        clock: u64,
        flatten: bool,
    ) -> CoreResult<StoreUpdate<T>> {
        let MergeSize { npersists, timespan } = self.policy.merge_size(clock, flatten);
        let full = npersists >= offs.len();
        let since = clock.saturating_sub(timespan);
        let keep = |t: &T| if full { !t.is_tombstone() } else { t.lastmod() >= since };
        let count = hamt.values().into_iter().filter(|t| keep(*t)).count();
        if count == 0 && npersists == 0 {
            tracing::debug!(store, clock, "nothing to persist");
            return Ok(StoreUpdate {
                offs: offs.to_vec(),
                clock,
                snapshot: hamt.clone(),
                full: false,
                written: false,
            });
        }
        let off = hamt.write(self.env.arena(), nth(offs, npersists), |t: &T| keep(t))?;
        let offs = replace(offs, npersists, off);
        let next = if offs.len() == 1 {
            self.env.config().consolidation_delay
        } else {
            clock.saturating_add(1)
        };
        tracing::debug!(
            store,
            clock,
            npersists,
            full,
            entries = count,
            generations = offs.len(),
            "wrote meta generation"
        );
        Ok(StoreUpdate {
            offs,
            clock: next,
            snapshot: hamt.clone(),
            full,
            written: true,
        })
    }

    /// Records a persist in this snapshot.
    ///
    /// Entries that changed after [`Meta::persist`] took its snapshot are
    /// stamped with the new clock so the next persist writes them. After a
    /// full consolidation, persisted tombstones are removed.
    pub fn apply_persist(&mut self, update: PersistUpdate) {
        let PersistUpdate { schema, info, .. } = update;
        if schema.written {
            self.schema = restamp("schema", &self.schema, &schema);
            self.schema_offs = schema.offs;
            self.schema_clock = schema.clock;
        }
        if info.written {
            self.info = restamp("info", &self.info, &info);
            self.info_offs = info.offs;
            self.info_clock = info.clock;
        }
    }

    /// Reads metadata persisted at `root`, attaching the index specs of
    /// each table's schema to its trees.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if a block is damaged or an info entry has no
    /// matching schema.
    pub fn read(env: Arc<Env>, root: MetaRoot) -> CoreResult<Self> {
        let max_probe = env.config().max_probe;
        let schema_chain = PackedHamt::open(env.arena(), root.schema, max_probe)?;
        let info_chain = PackedHamt::open(env.arena(), root.info, max_probe)?;
        let schema = schema_chain.to_hamt::<Schema>(&())?;
        let raw = info_chain.to_hamt::<Info>(&env)?;

        let mut info = raw.mutable();
        for ti in raw.values() {
            if ti.is_tombstone() {
                continue;
            }
            let ts = schema
                .get(&ti.table)
                .filter(|ts| !ts.is_tombstone() && ts.indexes.len() == ti.indexes.len())
                .ok_or_else(|| CoreError::corruption(format!("info for {} has no matching schema", ti.table)))?;
            let mut ti = ti.clone();
            for (ov, spec) in ti.indexes.iter_mut().zip(&ts.indexes) {
                *ov = ov.with_base(ov.base().clone().with_spec(Arc::clone(spec)));
            }
            info.put(ti);
        }

        let schema_offs = schema_chain.offsets();
        let info_offs = info_chain.offsets();
        let delay = env.config().consolidation_delay;
        tracing::info!(
            %root,
            schema_generations = schema_offs.len(),
            info_generations = info_offs.len(),
            "read meta"
        );
        Ok(Self {
            schema_clock: clock_for(schema_offs.len(), delay),
            info_clock: clock_for(info_offs.len(), delay),
            env,
            policy: Arc::new(TrailingOnes),
            schema,
            info: info.freeze(),
            dif_info: None,
            schema_offs,
            info_offs,
        })
    }

    /// Visits the schema of every live table.
    pub fn for_each_schema<F: FnMut(&Schema)>(&self, mut f: F) {
        self.schema.for_each(|ts| {
            if !ts.is_tombstone() {
                f(ts);
            }
        });
    }

    /// Visits the info of every live table.
    pub fn for_each_info<F: FnMut(&Info)>(&self, mut f: F) {
        self.info.for_each(|ti| {
            if !ti.is_tombstone() {
                f(ti);
            }
        });
    }

    /// Walks every index tree in full. When no unmerged layers remain, also
    /// verifies that every index of a table holds one entry per row.
    ///
    /// # Errors
    ///
    /// Returns the first integrity failure found.
    pub fn check(&self) -> CoreResult<()> {
        for ti in self.info.values() {
            if ti.is_tombstone() {
                continue;
            }
            let merged = ti.indexes.iter().all(|ov| ov.layers().is_empty());
            for ov in &ti.indexes {
                let stats = ov.base().check()?;
                if merged && i64::try_from(stats.count).ok() != Some(ti.nrows) {
                    tracing::warn!(table = %ti.table, index = %ov.base().spec().name, "index count mismatch");
                    return Err(CoreError::corruption(format!(
                        "{} index {} has {} entries for {} rows",
                        ti.table,
                        ov.base().spec().name,
                        stats.count,
                        ti.nrows
                    )));
                }
            }
        }
        Ok(())
    }

    /// Checks the recently written part of every index tree.
    ///
    /// # Errors
    ///
    /// Returns the first integrity failure found.
    pub fn quick_check(&self) -> CoreResult<()> {
        for ti in self.info.values() {
            if ti.is_tombstone() {
                continue;
            }
            for ov in &ti.indexes {
                ov.base().quick_check()?;
            }
        }
        Ok(())
    }
}

/// Applies a persist's clock to `current`: entries replaced since the
/// snapshot take the new clock, and a full consolidation resets the stamps
/// of what it wrote and removes the tombstones it dropped.
fn restamp<T: HamtItem + Stamped>(store: &str, current: &Hamt<T>, up: &StoreUpdate<T>) -> Hamt<T> {
    let mut changed = Vec::new();
    let mut settled = Vec::new();
    let mut dropped = Vec::new();
    current.for_each_arc(|e| {
        let unchanged = up
            .snapshot
            .get_arc(e.key())
            .is_some_and(|s| Arc::ptr_eq(s, e));
        if !unchanged {
            changed.push(e.key().to_string());
        } else if up.full && e.is_tombstone() {
            dropped.push(e.key().to_string());
        } else if up.full && e.lastmod() >= up.clock {
            settled.push(e.key().to_string());
        }
    });
    if changed.is_empty() && settled.is_empty() && dropped.is_empty() {
        return current.clone();
    }
    let mut m = current.mutable();
    for key in &changed {
        if let Some(e) = m.get_mut(key) {
            e.set_lastmod(up.clock);
        }
    }
    for key in &settled {
        if let Some(e) = m.get_mut(key) {
            e.set_lastmod(0);
        }
    }
    for key in &dropped {
        m.delete(key);
    }
    tracing::debug!(
        store,
        restamped = changed.len(),
        tombstones = dropped.len(),
        "applied persist"
    );
    m.freeze()
}
