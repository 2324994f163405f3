//! Immutable, append-only B-tree.
//!
//! A [`Btree`] is a root offset plus a height. Nodes are never modified once
//! written; [`Btree::merge`] produces a new version that shares every
//! untouched subtree with the old one, so readers holding an old version are
//! never disturbed.
//!
//! Leaves and tree nodes share one format. Whether a node is a leaf is
//! decided by its depth compared to the tree height, not by a flag.

mod merge;
pub(crate) mod node;

pub use node::MAX_KEY_LEN;

use crate::encoding::{Reader, Writer};
use crate::env::Env;
use crate::error::{CoreError, CoreResult};
use crate::ixkey::IndexSpec;
use node::{Entry, Node};
use std::fmt;
use std::sync::Arc;
use stratadb_storage::Arena;

/// Resolves the true key of a leaf entry from the record it points at.
///
/// Leaves only hold key prefixes; the full key lives in the record. The
/// accessor is injected through [`Env`] so the tree does not depend on a
/// record format.
pub trait LeafKeys: Send + Sync {
    /// Returns the index key of the record at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    fn leaf_key(&self, arena: &Arena, spec: &IndexSpec, offset: u64) -> CoreResult<Vec<u8>>;

    /// Verifies the integrity of the record at `offset`.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the record is damaged.
    fn verify_record(&self, _arena: &Arena, _offset: u64) -> CoreResult<()> {
        Ok(())
    }
}

/// Totals gathered by an integrity walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckStats {
    /// Number of leaf entries.
    pub count: u64,
    /// Total persisted bytes of the visited nodes.
    pub size: u64,
    /// Number of visited nodes.
    pub nodes: u64,
}

/// One immutable version of an index.
#[derive(Clone)]
pub struct Btree {
    root: u64,
    tree_levels: u8,
    spec: Arc<IndexSpec>,
    env: Arc<Env>,
}

impl fmt::Debug for Btree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Btree")
            .field("root", &self.root)
            .field("tree_levels", &self.tree_levels)
            .field("index", &self.spec.name)
            .finish()
    }
}

impl Btree {
    /// Writes an empty leaf and returns a tree rooted at it.
    ///
    /// # Errors
    ///
    /// Returns an error if the arena cannot allocate.
    pub fn create(env: Arc<Env>, spec: Arc<IndexSpec>) -> CoreResult<Self> {
        let root = node::write(env.arena(), &[])?;
        Ok(Self {
            root,
            tree_levels: 0,
            spec,
            env,
        })
    }

    /// Opens an existing tree.
    #[must_use]
    pub fn open(env: Arc<Env>, spec: Arc<IndexSpec>, root: u64, tree_levels: u8) -> Self {
        Self {
            root,
            tree_levels,
            spec,
            env,
        }
    }

    /// Offset of the root node.
    #[must_use]
    pub fn root(&self) -> u64 {
        self.root
    }

    /// Number of tree levels above the leaves. Zero means the root is a leaf.
    #[must_use]
    pub fn tree_levels(&self) -> u8 {
        self.tree_levels
    }

    /// The index this tree belongs to.
    #[must_use]
    pub fn spec(&self) -> &Arc<IndexSpec> {
        &self.spec
    }

    /// Returns this tree with a different index spec attached.
    #[must_use]
    pub fn with_spec(mut self, spec: Arc<IndexSpec>) -> Self {
        self.spec = spec;
        self
    }

    pub(crate) fn env(&self) -> &Arc<Env> {
        &self.env
    }

    fn arena(&self) -> &Arena {
        self.env.arena()
    }

    /// Returns the record offset stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if a node or record on the path is damaged.
    pub fn lookup(&self, key: &[u8]) -> CoreResult<Option<u64>> {
        let mut off = self.root;
        for _ in 0..self.tree_levels {
            let node = node::read(self.arena(), off)?;
            if node.entries.is_empty() {
                return Err(CoreError::corruption(format!("empty tree node at {off}")));
            }
            off = node.entries[node.find(key)].offset;
        }
        let leaf = node::read(self.arena(), off)?;
        if leaf.entries.is_empty() {
            return Ok(None);
        }
        let candidate = leaf.entries[leaf.find(key)].offset;
        let actual = self
            .env
            .keys()
            .leaf_key(self.arena(), &self.spec, candidate)?;
        Ok((actual == key).then_some(candidate))
    }

    /// Iterates leaf record offsets in key order.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            tree: self,
            stack: Vec::new(),
            started: false,
            failed: false,
        }
    }

    /// Calls `f` with each leaf record offset in key order.
    ///
    /// # Errors
    ///
    /// Returns the first error from reading a node or from `f`.
    pub fn for_each_leaf<F>(&self, mut f: F) -> CoreResult<()>
    where
        F: FnMut(u64) -> CoreResult<()>,
    {
        for off in self.iter() {
            f(off?)?;
        }
        Ok(())
    }

    /// Full integrity walk; see [`Btree::check_with`].
    ///
    /// # Errors
    ///
    /// Returns a fatal error on the first violation.
    pub fn check(&self) -> CoreResult<CheckStats> {
        self.check_with(|_| Ok(()))
    }

    /// Verifies every node checksum, key ordering across the whole tree,
    /// that tree separators bound their subtrees, and that every leaf's
    /// stored prefix matches its record's true key. `f` is called with each
    /// leaf record offset.
    ///
    /// Keys must be strictly increasing: a tree maps each key to a single
    /// record, and merge rejects a second insert of a key. Indexes that
    /// allow repeated values append fields that make their keys distinct.
    ///
    /// # Errors
    ///
    /// Returns a fatal error on the first violation.
    pub fn check_with<F>(&self, mut f: F) -> CoreResult<CheckStats>
    where
        F: FnMut(u64) -> CoreResult<()>,
    {
        let mut walk = CheckWalk {
            tree: self,
            stats: CheckStats::default(),
            last: None,
            visit: &mut f,
        };
        walk.node(self.root, 0, &[], None)?;
        tracing::debug!(
            index = %self.spec.name,
            count = walk.stats.count,
            nodes = walk.stats.nodes,
            "index check passed"
        );
        Ok(walk.stats)
    }

    /// Verifies only nodes and records inside the trailing
    /// `quick_check_window` bytes of the arena.
    ///
    /// Children are always written before their parents, so a subtree whose
    /// root lies before the window is skipped entirely.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if a checked node or record is damaged.
    pub fn quick_check(&self) -> CoreResult<CheckStats> {
        let window = self.env.config().quick_check_window;
        let threshold = self.arena().size()?.saturating_sub(window);
        let mut stats = CheckStats::default();
        self.quick_node(self.root, 0, threshold, &mut stats)?;
        Ok(stats)
    }

    fn quick_node(&self, off: u64, depth: u8, threshold: u64, stats: &mut CheckStats) -> CoreResult<()> {
        if off < threshold {
            return Ok(());
        }
        let node = node::read(self.arena(), off)?;
        stats.nodes += 1;
        stats.size += node.size as u64;
        for e in &node.entries {
            if depth < self.tree_levels {
                self.quick_node(e.offset, depth + 1, threshold, stats)?;
            } else if e.offset >= threshold {
                self.env.keys().verify_record(self.arena(), e.offset)?;
                stats.count += 1;
            }
        }
        Ok(())
    }

    pub(crate) fn write(&self, w: &mut Writer) {
        w.put5(self.root).put1(self.tree_levels);
    }

    /// Reads a descriptor. The spec is attached later from the schema.
    pub(crate) fn read(r: &mut Reader<'_>, env: &Arc<Env>) -> CoreResult<Self> {
        let root = r.get5()?;
        let tree_levels = r.get1()?;
        Ok(Self::open(
            Arc::clone(env),
            Arc::new(IndexSpec::default()),
            root,
            tree_levels,
        ))
    }
}

struct CheckWalk<'a, F> {
    tree: &'a Btree,
    stats: CheckStats,
    last: Option<Vec<u8>>,
    visit: &'a mut F,
}

impl<F> CheckWalk<'_, F>
where
    F: FnMut(u64) -> CoreResult<()>,
{
    fn node(&mut self, off: u64, depth: u8, lower: &[u8], upper: Option<&[u8]>) -> CoreResult<()> {
        let node = node::read(self.tree.arena(), off)?;
        self.stats.nodes += 1;
        self.stats.size += node.size as u64;
        if depth < self.tree.tree_levels {
            self.tree_node(&node, depth, lower, upper)
        } else {
            self.leaf(&node, lower, upper)
        }
    }

    fn tree_node(&mut self, node: &Node, depth: u8, lower: &[u8], upper: Option<&[u8]>) -> CoreResult<()> {
        if node.entries.is_empty() {
            return Err(CoreError::invariant("empty tree node"));
        }
        for (i, e) in node.entries.iter().enumerate() {
            if i > 0 && e.key <= node.entries[i - 1].key {
                return Err(fatal("tree keys out of order"));
            }
            let lo = if i == 0 { lower } else { e.key.as_slice() };
            let hi = node.entries.get(i + 1).map(|n| n.key.as_slice()).or(upper);
            self.node(e.offset, depth + 1, lo, hi)?;
        }
        Ok(())
    }

    fn leaf(&mut self, node: &Node, lower: &[u8], upper: Option<&[u8]>) -> CoreResult<()> {
        let env = self.tree.env();
        for Entry { key: known, offset } in &node.entries {
            env.keys().verify_record(env.arena(), *offset)?;
            let key = env.keys().leaf_key(env.arena(), &self.tree.spec, *offset)?;
            if !key.starts_with(known) {
                return Err(fatal("index key does not match data"));
            }
            if self.last.as_ref().is_some_and(|last| key <= *last) {
                return Err(fatal("keys out of order"));
            }
            if key.as_slice() < lower || upper.is_some_and(|hi| key.as_slice() >= hi) {
                return Err(fatal("key outside its separator range"));
            }
            (self.visit)(*offset)?;
            self.stats.count += 1;
            self.last = Some(key);
        }
        Ok(())
    }
}

fn fatal(message: &str) -> CoreError {
    tracing::warn!(message, "index check failed");
    CoreError::invariant(message)
}

/// Iterator over leaf record offsets in key order, from [`Btree::iter`].
///
/// Stops after yielding the first error.
pub struct Iter<'a> {
    tree: &'a Btree,
    stack: Vec<(Vec<Entry>, usize)>,
    started: bool,
    failed: bool,
}

impl Iter<'_> {
    fn push(&mut self, off: u64) -> CoreResult<()> {
        let node = node::read(self.tree.arena(), off)?;
        self.stack.push((node.entries, 0));
        Ok(())
    }
}

impl Iterator for Iter<'_> {
    type Item = CoreResult<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.started {
            self.started = true;
            if let Err(e) = self.push(self.tree.root) {
                self.failed = true;
                return Some(Err(e));
            }
        }
        loop {
            let depth = self.stack.len();
            let (entries, pos) = self.stack.last_mut()?;
            let Some(entry) = entries.get(*pos) else {
                self.stack.pop();
                continue;
            };
            *pos += 1;
            let off = entry.offset;
            if depth > usize::from(self.tree.tree_levels) {
                return Some(Ok(off));
            }
            if let Err(e) = self.push(off) {
                self.failed = true;
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::delta::DeltaBuffer;
    use crate::record::{Record, RecordKeys};

    fn env(max_node_size: usize) -> Arc<Env> {
        Arc::new(Env::new(
            Arc::new(Arena::in_memory().unwrap()),
            Arc::new(RecordKeys),
            Config::new().max_node_size(max_node_size),
        ))
    }

    fn spec() -> Arc<IndexSpec> {
        Arc::new(IndexSpec::new("key", vec![0]))
    }

    fn put(env: &Env, key: &str) -> u64 {
        Record::new(vec![key.as_bytes().to_vec()])
            .write(env.arena())
            .unwrap()
    }

    fn build(env: &Arc<Env>, keys: &[&str]) -> (Btree, Vec<u64>) {
        let mut delta = DeltaBuffer::new();
        let offs: Vec<u64> = keys.iter().map(|k| put(env, k)).collect();
        for (k, &off) in keys.iter().zip(&offs) {
            delta.insert(k.as_bytes(), off).unwrap();
        }
        let bt = Btree::create(Arc::clone(env), spec()).unwrap();
        (bt.merge(&delta).unwrap(), offs)
    }

    #[test]
    fn empty_tree() {
        let env = env(256);
        let bt = Btree::create(env, spec()).unwrap();
        assert_eq!(bt.lookup(b"anything").unwrap(), None);
        assert_eq!(bt.check().unwrap().count, 0);
        assert_eq!(bt.iter().count(), 0);
    }

    #[test]
    fn lookup_confirms_true_key() {
        let env = env(256);
        let (bt, offs) = build(&env, &["apple", "apricot", "banana"]);
        assert_eq!(bt.lookup(b"apricot").unwrap(), Some(offs[1]));
        assert_eq!(bt.lookup(b"banana").unwrap(), Some(offs[2]));
        // shares the stored prefix "apr" but is not a key
        assert_eq!(bt.lookup(b"apron").unwrap(), None);
        assert_eq!(bt.lookup(b"").unwrap(), None);
        assert_eq!(bt.lookup(b"zebra").unwrap(), None);
    }

    #[test]
    fn small_nodes_grow_height() {
        let env = env(64);
        let keys: Vec<String> = (0..1000).map(|i| format!("key{i:05}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let (bt, offs) = build(&env, &refs);

        let stats = bt.check().unwrap();
        assert_eq!(stats.count, 1000);
        assert!(bt.tree_levels() > 0);
        assert!(stats.nodes > 1);
        for (k, off) in refs.iter().zip(&offs).step_by(37) {
            assert_eq!(bt.lookup(k.as_bytes()).unwrap(), Some(*off));
        }
        let in_order: Vec<u64> = bt.iter().collect::<CoreResult<_>>().unwrap();
        assert_eq!(in_order, offs);
    }

    #[test]
    fn check_invokes_visitor() {
        let env = env(64);
        let (bt, offs) = build(&env, &["c", "a", "b"]);
        let mut seen = Vec::new();
        bt.check_with(|off| {
            seen.push(off);
            Ok(())
        })
        .unwrap();
        // key order, not insertion order
        assert_eq!(seen, vec![offs[1], offs[2], offs[0]]);
    }

    #[test]
    fn check_detects_mismatched_record() {
        let env = env(256);
        let (bt, _) = build(&env, &["alpha", "beta"]);
        // point a leaf at a record whose key disagrees with the stored prefix
        let stray = put(&env, "zulu");
        let leaf = node::write(
            env.arena(),
            &[
                Entry {
                    key: Vec::new(),
                    offset: bt.lookup(b"alpha").unwrap().unwrap(),
                },
                Entry {
                    key: b"b".to_vec(),
                    offset: stray,
                },
            ],
        )
        .unwrap();
        let broken = Btree::open(Arc::clone(&env), spec(), leaf, 0);
        let err = broken.check().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn quick_check_skips_old_regions() {
        let env = env(64);
        let keys: Vec<String> = (0..200).map(|i| format!("k{i:04}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let (bt, _) = build(&env, &refs);

        let full = bt.quick_check().unwrap();
        assert_eq!(full.count, 200);

        let narrow = Env::new(
            env.arena_handle(),
            Arc::new(RecordKeys),
            Config::new().max_node_size(64).quick_check_window(256),
        );
        let bt = Btree::open(Arc::new(narrow), spec(), bt.root(), bt.tree_levels());
        let partial = bt.quick_check().unwrap();
        assert!(partial.nodes >= 1);
        assert!(partial.nodes < full.nodes);
        assert_eq!(partial.count, 0);
    }

    /// Copies the arena of `env` with one byte flipped at `at`.
    fn damaged_copy(env: &Env, at: u64, window: u64) -> Arc<Env> {
        let mut image = stratadb_storage::ARENA_MAGIC.to_vec();
        image.extend(
            env.arena()
                .read_up_to(stratadb_storage::ARENA_HEADER_SIZE, 1 << 24)
                .unwrap(),
        );
        image[at as usize] ^= 0x40;
        let arena = Arena::open(
            Box::new(stratadb_storage::InMemoryBackend::with_data(image)),
            stratadb_storage::ArenaOptions::default(),
        )
        .unwrap();
        Arc::new(Env::new(
            Arc::new(arena),
            Arc::new(RecordKeys),
            Config::new().max_node_size(64).quick_check_window(window),
        ))
    }

    #[test]
    fn quick_check_reports_recent_damage() {
        let env = env(64);
        let keys: Vec<String> = (0..200).map(|i| format!("k{i:04}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let (bt, offs) = build(&env, &refs);
        let window = Config::default().quick_check_window;

        // inside the first field of the newest record
        let copy = damaged_copy(&env, offs[199] + 8, window);
        let bt2 = Btree::open(copy, spec(), bt.root(), bt.tree_levels());
        let err = bt2.quick_check().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, CoreError::ChecksumMismatch { .. }));

        // the root node is the last thing written
        let copy = damaged_copy(&env, bt.root() + 3, window);
        let bt3 = Btree::open(copy, spec(), bt.root(), bt.tree_levels());
        assert!(bt3.quick_check().unwrap_err().is_fatal());
    }

    #[test]
    fn quick_check_ignores_damage_before_window() {
        let env = env(64);
        let keys: Vec<String> = (0..200).map(|i| format!("k{i:04}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let (bt, offs) = build(&env, &refs);

        // records are written before every node, so the oldest lies
        // outside a 256 byte window
        let copy = damaged_copy(&env, offs[0] + 8, 256);
        let bt2 = Btree::open(copy, spec(), bt.root(), bt.tree_levels());
        let partial = bt2.quick_check().unwrap();
        assert_eq!(partial.count, 0);
        assert!(bt2.check().unwrap_err().is_fatal());
    }

    #[test]
    fn check_rejects_equal_adjacent_keys() {
        let env = env(256);
        let first = put(&env, "alpha");
        let second = put(&env, "alpha");
        let leaf = node::write(
            env.arena(),
            &[
                Entry {
                    key: Vec::new(),
                    offset: first,
                },
                Entry {
                    key: b"a".to_vec(),
                    offset: second,
                },
            ],
        )
        .unwrap();
        let broken = Btree::open(Arc::clone(&env), spec(), leaf, 0);
        let err = broken.check().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("out of order"));
    }

    #[test]
    fn truncated_arena_is_fatal() {
        let env = env(64);
        let keys: Vec<String> = (0..50).map(|i| format!("k{i:04}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let (bt, _) = build(&env, &refs);

        let mut image = stratadb_storage::ARENA_MAGIC.to_vec();
        image.extend(
            env.arena()
                .read_up_to(stratadb_storage::ARENA_HEADER_SIZE, 1 << 24)
                .unwrap(),
        );
        image.truncate(bt.root() as usize + 3);
        let arena = Arena::open(
            Box::new(stratadb_storage::InMemoryBackend::with_data(image)),
            stratadb_storage::ArenaOptions::default(),
        )
        .unwrap();
        let cut = Arc::new(Env::new(Arc::new(arena), Arc::new(RecordKeys), Config::new()));
        let bt = Btree::open(cut, spec(), bt.root(), bt.tree_levels());
        let err = bt.lookup(b"k0001").unwrap_err();
        assert!(matches!(err, CoreError::Corruption { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn descriptor_write_read() {
        let env = env(256);
        let (bt, _) = build(&env, &["x"]);
        let mut w = Writer::new();
        bt.write(&mut w);
        // root (5) and height (1)
        assert_eq!(w.len(), 6);
        let buf = w.into_inner();
        let back = Btree::read(&mut Reader::new(&buf), &env).unwrap();
        assert_eq!(back.root(), bt.root());
        assert_eq!(back.tree_levels(), bt.tree_levels());
    }
}
