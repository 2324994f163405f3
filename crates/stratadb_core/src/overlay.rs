//! Index overlays: a base B-tree plus unmerged transaction layers.
//!
//! A transaction records its index changes in a private mutable layer. On
//! commit the layer is stacked onto the latest overlay ([`Overlay::update_with`])
//! so later readers see it immediately. The layer is folded into a new base
//! tree afterwards by [`Overlay::merge`] and [`Overlay::with_merged`].

use crate::btree::Btree;
use crate::delta::{DeltaBuffer, DeltaOp};
use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;
use std::sync::Arc;

/// Index changes made by one transaction.
#[derive(Debug, Clone)]
pub struct Layer {
    tran: TransactionId,
    ops: DeltaBuffer,
}

impl Layer {
    /// Transaction that produced the layer.
    #[must_use]
    pub fn tran(&self) -> TransactionId {
        self.tran
    }

    /// The buffered operations.
    #[must_use]
    pub fn ops(&self) -> &DeltaBuffer {
        &self.ops
    }
}

/// A base tree with committed-but-unmerged layers and at most one
/// transaction-private mutable layer.
#[derive(Debug, Clone)]
pub struct Overlay {
    base: Btree,
    /// Oldest first.
    layers: Vec<Arc<Layer>>,
    mutable: Option<Layer>,
}

impl Overlay {
    /// An overlay with no layers.
    #[must_use]
    pub fn new(base: Btree) -> Self {
        Self {
            base,
            layers: Vec::new(),
            mutable: None,
        }
    }

    /// The merged base tree.
    #[must_use]
    pub fn base(&self) -> &Btree {
        &self.base
    }

    /// Committed layers not yet merged into the base, oldest first.
    #[must_use]
    pub fn layers(&self) -> &[Arc<Layer>] {
        &self.layers
    }

    /// True if this overlay accepts writes.
    #[must_use]
    pub fn is_mutable(&self) -> bool {
        self.mutable.is_some()
    }

    /// Returns a copy with an empty private layer for `tran`.
    #[must_use]
    pub fn mutable(&self, tran: TransactionId) -> Self {
        Self {
            base: self.base.clone(),
            layers: self.layers.clone(),
            mutable: Some(Layer {
                tran,
                ops: DeltaBuffer::new(),
            }),
        }
    }

    fn ops_mut(&mut self) -> CoreResult<&mut DeltaBuffer> {
        self.mutable
            .as_mut()
            .map(|layer| &mut layer.ops)
            .ok_or_else(|| CoreError::invalid_operation("write to a read-only index overlay"))
    }

    /// Records an insert in the private layer.
    ///
    /// # Errors
    ///
    /// Fails on a read-only overlay or an impossible operation sequence.
    pub fn insert(&mut self, key: &[u8], offset: u64) -> CoreResult<()> {
        self.ops_mut()?.insert(key, offset)
    }

    /// Records an update in the private layer.
    ///
    /// # Errors
    ///
    /// Fails on a read-only overlay or an impossible operation sequence.
    pub fn update(&mut self, key: &[u8], offset: u64) -> CoreResult<()> {
        self.ops_mut()?.update(key, offset)
    }

    /// Records a delete in the private layer.
    ///
    /// # Errors
    ///
    /// Fails on a read-only overlay or an impossible operation sequence.
    pub fn delete(&mut self, key: &[u8], offset: u64) -> CoreResult<()> {
        self.ops_mut()?.delete(key, offset)
    }

    /// Looks `key` up through the private layer, the committed layers
    /// newest first, and finally the base tree.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the base tree is damaged.
    pub fn lookup(&self, key: &[u8]) -> CoreResult<Option<u64>> {
        let newest_first = self
            .mutable
            .iter()
            .chain(self.layers.iter().rev().map(|l| &**l));
        for layer in newest_first {
            match layer.ops.get(key) {
                Some(DeltaOp::Insert(off) | DeltaOp::Update(off)) => return Ok(Some(off)),
                Some(DeltaOp::Delete(_)) => return Ok(None),
                None => {}
            }
        }
        self.base.lookup(key)
    }

    /// Stacks this overlay's private layer onto `latest`, which may have
    /// advanced since the transaction started. The result is read-only.
    #[must_use]
    pub fn update_with(&self, latest: &Overlay) -> Self {
        let mut layers = latest.layers.clone();
        if let Some(layer) = &self.mutable {
            layers.push(Arc::new(layer.clone()));
        }
        Self {
            base: latest.base.clone(),
            layers,
            mutable: None,
        }
    }

    /// Merges the layer committed by `tran` into the base tree.
    ///
    /// Returns `None` if the overlay holds no layer for `tran`. The result
    /// is not visible until passed to [`Overlay::with_merged`].
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if `tran`'s layer is not the oldest,
    /// since layers must be merged in commit order, or any merge error.
    pub fn merge(&self, tran: TransactionId) -> CoreResult<Option<Btree>> {
        let Some(pos) = self.layers.iter().position(|l| l.tran == tran) else {
            return Ok(None);
        };
        if pos != 0 {
            return Err(CoreError::invariant(format!(
                "{tran} merged ahead of {}",
                self.layers[0].tran
            )));
        }
        self.base.merge(&self.layers[0].ops).map(Some)
    }

    /// Replaces the base with `merged` and drops `tran`'s layer.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the oldest layer is not `tran`'s.
    pub fn with_merged(&self, merged: Btree, tran: TransactionId) -> CoreResult<Self> {
        match self.layers.first() {
            Some(first) if first.tran == tran => Ok(Self {
                base: merged,
                layers: self.layers[1..].to_vec(),
                mutable: self.mutable.clone(),
            }),
            _ => Err(CoreError::invariant(format!(
                "no oldest layer for {tran} to replace"
            ))),
        }
    }

    /// The same overlay over a different base, used when reading
    /// persisted state.
    #[must_use]
    pub fn with_base(&self, base: Btree) -> Self {
        Self {
            base,
            layers: self.layers.clone(),
            mutable: self.mutable.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::env::Env;
    use crate::ixkey::IndexSpec;
    use crate::record::{Record, RecordKeys};
    use stratadb_storage::Arena;

    fn setup() -> (Arc<Env>, Overlay) {
        let env = Arc::new(Env::new(
            Arc::new(Arena::in_memory().unwrap()),
            Arc::new(RecordKeys),
            Config::new(),
        ));
        let bt = Btree::create(Arc::clone(&env), Arc::new(IndexSpec::new("k", vec![0]))).unwrap();
        (env, Overlay::new(bt))
    }

    fn rec(env: &Env, key: &str) -> u64 {
        Record::new(vec![key.as_bytes().to_vec()])
            .write(env.arena())
            .unwrap()
    }

    #[test]
    fn read_only_overlay_rejects_writes() {
        let (_env, mut ov) = setup();
        let err = ov.insert(b"a", 9).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn layers_shadow_base() {
        let (env, base) = setup();
        let a = rec(&env, "a");
        let mut t1 = base.mutable(TransactionId(1));
        t1.insert(b"a", a).unwrap();
        assert_eq!(t1.lookup(b"a").unwrap(), Some(a));
        assert_eq!(base.lookup(b"a").unwrap(), None);

        let committed = t1.update_with(&base);
        assert!(!committed.is_mutable());
        assert_eq!(committed.lookup(b"a").unwrap(), Some(a));

        let mut t2 = committed.mutable(TransactionId(2));
        t2.delete(b"a", a).unwrap();
        assert_eq!(t2.lookup(b"a").unwrap(), None);
        assert_eq!(committed.lookup(b"a").unwrap(), Some(a));
    }

    #[test]
    fn merge_in_commit_order() {
        let (env, base) = setup();
        let (a, b) = (rec(&env, "a"), rec(&env, "b"));
        let mut t1 = base.mutable(TransactionId(1));
        t1.insert(b"a", a).unwrap();
        let mut t2 = base.mutable(TransactionId(2));
        t2.insert(b"b", b).unwrap();
        let latest = t2.update_with(&t1.update_with(&base));
        assert_eq!(latest.layers().len(), 2);

        assert!(latest.merge(TransactionId(2)).unwrap_err().is_fatal());
        assert!(latest.merge(TransactionId(7)).unwrap().is_none());

        let bt = latest.merge(TransactionId(1)).unwrap().unwrap();
        let latest = latest.with_merged(bt, TransactionId(1)).unwrap();
        assert_eq!(latest.layers().len(), 1);
        assert_eq!(latest.base().lookup(b"a").unwrap(), Some(a));
        assert_eq!(latest.lookup(b"b").unwrap(), Some(b));

        let bt = latest.merge(TransactionId(2)).unwrap().unwrap();
        let latest = latest.with_merged(bt, TransactionId(2)).unwrap();
        assert!(latest.layers().is_empty());
        assert_eq!(latest.base().check().unwrap().count, 2);
    }
}
