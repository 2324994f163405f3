//! Merge engine: applies a sorted batch of operations to a tree, producing a
//! new version that shares untouched subtrees.
//!
//! Operations are partitioned by child separator on the way down. Only leaves
//! that receive operations are rebuilt, and only nodes on their paths are
//! rewritten. A rebuilt node that is too large is split; the pieces are
//! returned to the parent as `(separator, offset)` pairs and the parent
//! splits in turn. The first piece always inherits the separator of the
//! node it replaces.

use super::node::{self, Entry};
use super::Btree;
use crate::delta::{DeltaBuffer, DeltaOp};
use crate::error::{CoreError, CoreResult};

type Op<'a> = (&'a [u8], DeltaOp);

/// `(separator, offset)` pairs replacing one child.
type Pieces = Vec<(Vec<u8>, u64)>;

impl Btree {
    /// Applies `delta` and returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvariantViolation`] for an insert of an existing
    /// key or an update or delete of a missing key, and any storage error.
    /// The original tree is unaffected either way.
    pub fn merge(&self, delta: &DeltaBuffer) -> CoreResult<Btree> {
        if delta.is_empty() {
            return Ok(self.clone());
        }
        let ops: Vec<Op<'_>> = delta.iter().collect();
        let mut pieces = self.merge_node(self.root, 0, &ops)?;
        let mut levels = self.tree_levels;
        let root = if pieces.is_empty() {
            levels = 0;
            node::write(self.arena(), &[])?
        } else {
            while pieces.len() > 1 {
                pieces = self.build_tree_nodes(pieces)?;
                levels += 1;
            }
            let mut root = pieces[0].1;
            // drop single-child roots left behind by deletes
            while levels > 0 {
                let top = node::read(self.arena(), root)?;
                if top.entries.len() != 1 {
                    break;
                }
                root = top.entries[0].offset;
                levels -= 1;
            }
            root
        };
        tracing::debug!(
            index = %self.spec.name,
            ops = ops.len(),
            root,
            levels,
            "merged index"
        );
        Ok(Btree {
            root,
            tree_levels: levels,
            spec: self.spec.clone(),
            env: self.env.clone(),
        })
    }

    fn merge_node(&self, off: u64, depth: u8, ops: &[Op<'_>]) -> CoreResult<Pieces> {
        if ops.is_empty() {
            return Ok(vec![(Vec::new(), off)]);
        }
        if depth == self.tree_levels {
            return self.merge_leaf(off, ops);
        }
        let node = node::read(self.arena(), off)?;
        if node.entries.is_empty() {
            return Err(CoreError::corruption(format!("empty tree node at {off}")));
        }
        let mut children: Pieces = Vec::with_capacity(node.entries.len() + 1);
        let mut rest = ops;
        for (i, e) in node.entries.iter().enumerate() {
            let n = match node.entries.get(i + 1) {
                Some(next) => rest.partition_point(|(k, _)| *k < next.key.as_slice()),
                None => rest.len(),
            };
            let (mine, tail) = rest.split_at(n);
            rest = tail;
            if mine.is_empty() {
                children.push((e.key.clone(), e.offset));
                continue;
            }
            let mut pieces = self.merge_node(e.offset, depth + 1, mine)?.into_iter();
            if let Some((_, first)) = pieces.next() {
                children.push((e.key.clone(), first));
                children.extend(pieces);
            }
        }
        if children.is_empty() {
            return Ok(Vec::new());
        }
        self.build_tree_nodes(children)
    }

    fn merge_leaf(&self, off: u64, ops: &[Op<'_>]) -> CoreResult<Pieces> {
        let leaf = node::read(self.arena(), off)?;
        let keys = self.env.keys();
        let mut existing = Vec::with_capacity(leaf.entries.len());
        for e in &leaf.entries {
            let key = keys.leaf_key(self.arena(), &self.spec, e.offset)?;
            existing.push((key, e.offset));
        }

        let mut existing = existing.into_iter().peekable();
        let mut items: Pieces = Vec::with_capacity(existing.len() + ops.len());
        for &(key, op) in ops {
            while let Some(item) = existing.next_if(|(k, _)| k.as_slice() < key) {
                items.push(item);
            }
            let found = existing.next_if(|(k, _)| k.as_slice() == key).is_some();
            match (op, found) {
                (DeltaOp::Insert(off), false) | (DeltaOp::Update(off), true) => {
                    items.push((key.to_vec(), off));
                }
                (DeltaOp::Delete(_), true) => {}
                (DeltaOp::Insert(_), true) => {
                    return Err(merge_error("insert of existing key", key));
                }
                (DeltaOp::Update(_) | DeltaOp::Delete(_), false) => {
                    return Err(merge_error("update or delete of missing key", key));
                }
            }
        }
        items.extend(existing);
        if items.is_empty() {
            return Ok(Vec::new());
        }
        self.build_leaves(&items)
    }

    /// Writes sorted `(true key, record offset)` items as one or more leaves.
    fn build_leaves(&self, items: &[(Vec<u8>, u64)]) -> CoreResult<Pieces> {
        let mut known = Vec::with_capacity(items.len());
        let mut prev: &[u8] = &[];
        for (i, (key, _)) in items.iter().enumerate() {
            known.push(if i == 0 { Vec::new() } else { node::separator(prev, key) });
            prev = key.as_slice();
        }
        let sizes = entry_sizes(&known);
        let mut pieces = Vec::new();
        for chunk in node::plan_chunks(&sizes, self.env.config().max_node_size, 1) {
            let entries: Vec<Entry> = chunk
                .clone()
                .map(|i| Entry {
                    key: if i == chunk.start { Vec::new() } else { known[i].clone() },
                    offset: items[i].1,
                })
                .collect();
            let off = node::write(self.arena(), &entries)?;
            pieces.push((known[chunk.start].clone(), off));
        }
        Ok(pieces)
    }

    /// Writes `(separator, child)` pairs as one or more tree nodes.
    fn build_tree_nodes(&self, children: Pieces) -> CoreResult<Pieces> {
        let keys: Vec<Vec<u8>> = children
            .iter()
            .enumerate()
            .map(|(i, (sep, _))| if i == 0 { Vec::new() } else { sep.clone() })
            .collect();
        let sizes = entry_sizes(&keys);
        let mut pieces = Vec::new();
        for chunk in node::plan_chunks(&sizes, self.env.config().max_node_size, 2) {
            let entries: Vec<Entry> = chunk
                .clone()
                .map(|i| Entry {
                    key: if i == chunk.start { Vec::new() } else { keys[i].clone() },
                    offset: children[i].1,
                })
                .collect();
            let off = node::write(self.arena(), &entries)?;
            pieces.push((children[chunk.start].0.clone(), off));
        }
        Ok(pieces)
    }
}

fn entry_sizes(keys: &[Vec<u8>]) -> Vec<usize> {
    let mut prev: &[u8] = &[];
    keys.iter()
        .map(|k| {
            let size = node::entry_size(prev, k);
            prev = k.as_slice();
            size
        })
        .collect()
}

fn merge_error(what: &str, key: &[u8]) -> CoreError {
    tracing::warn!(key = %String::from_utf8_lossy(key), "{what}");
    CoreError::invariant(format!("{what}: {}", String::from_utf8_lossy(key)))
}
