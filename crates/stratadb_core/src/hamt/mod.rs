//! Persistent hash array mapped trie keyed by strings.
//!
//! [`Hamt`] is an immutable snapshot that can be shared freely between
//! threads. [`Hamt::mutable`] starts a new generation: a [`HamtMut`] shares
//! every node with the snapshot and copies a node only the first time it is
//! written in that generation. [`HamtMut::freeze`] turns it back into a
//! snapshot. Values are reference counted, so unchanged values are shared by
//! every version that contains them.
//!
//! Each level consumes 5 bits of the key hash. Once the 32 hash bits are
//! used up, colliding keys live in a flat overflow node searched linearly.

pub mod packed;

use std::fmt;
use std::sync::Arc;

pub use packed::{PackedBlock, PackedHamt, PackedItem, FINGER_SPACING};

const BITS_PER_LEVEL: u32 = 5;
const HASH_BITS: u32 = 32;
const MASK: u32 = (1 << BITS_PER_LEVEL) - 1;

/// A value stored in a [`Hamt`], identified by a string key.
pub trait HamtItem: Clone + Send + Sync {
    /// The key this item is stored under.
    fn key(&self) -> &str;

    /// Hash used to place `key` in the trie.
    fn hash_key(key: &str) -> u32 {
        xxhash_rust::xxh64::xxh64(key.as_bytes(), 0) as u32
    }
}

struct Node<T> {
    generation: u32,
    bm_val: u32,
    bm_ptr: u32,
    vals: Vec<Arc<T>>,
    ptrs: Vec<Arc<Node<T>>>,
}

// shallow: values and children stay shared
impl<T> Clone for Node<T> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            bm_val: self.bm_val,
            bm_ptr: self.bm_ptr,
            vals: self.vals.clone(),
            ptrs: self.ptrs.clone(),
        }
    }
}

fn bit(hash: u32, shift: u32) -> u32 {
    1 << ((hash >> shift) & MASK)
}

/// Position of `bit` among the set bits of `bitmap`.
fn ith(bitmap: u32, bit: u32) -> usize {
    (bitmap & (bit - 1)).count_ones() as usize
}

impl<T: HamtItem> Node<T> {
    fn empty(generation: u32) -> Self {
        Self {
            generation,
            bm_val: 0,
            bm_ptr: 0,
            vals: Vec::new(),
            ptrs: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.vals.is_empty() && self.ptrs.is_empty()
    }

    fn get(&self, key: &str, hash: u32) -> Option<&Arc<T>> {
        let mut nd = self;
        let mut shift = 0;
        while shift < HASH_BITS {
            let bit = bit(hash, shift);
            if nd.bm_val & bit != 0 {
                let val = &nd.vals[ith(nd.bm_val, bit)];
                if val.key() == key {
                    return Some(val);
                }
            }
            if nd.bm_ptr & bit == 0 {
                return None;
            }
            nd = &nd.ptrs[ith(nd.bm_ptr, bit)];
            shift += BITS_PER_LEVEL;
        }
        nd.vals.iter().find(|v| v.key() == key)
    }

    fn put(&mut self, generation: u32, item: Arc<T>, hash: u32, shift: u32) {
        if shift >= HASH_BITS {
            match self.vals.iter_mut().find(|v| v.key() == item.key()) {
                Some(slot) => *slot = item,
                None => self.vals.push(item),
            }
            return;
        }
        let bit = bit(hash, shift);
        let iv = ith(self.bm_val, bit);
        if self.bm_val & bit == 0 {
            if self.bm_ptr & bit == 0 {
                self.vals.insert(iv, item);
                self.bm_val |= bit;
                return;
            }
        } else if self.vals[iv].key() == item.key() {
            self.vals[iv] = item;
            return;
        } else if self.bm_ptr & bit == 0 {
            // collision: push both values one level down
            let old = self.vals.remove(iv);
            self.bm_val &= !bit;
            let mut child = Node::empty(generation);
            let old_hash = T::hash_key(old.key());
            child.put(generation, old, old_hash, shift + BITS_PER_LEVEL);
            child.put(generation, item, hash, shift + BITS_PER_LEVEL);
            self.ptrs.insert(ith(self.bm_ptr, bit), Arc::new(child));
            self.bm_ptr |= bit;
            return;
        }
        let ip = ith(self.bm_ptr, bit);
        node_mut(&mut self.ptrs[ip], generation).put(generation, item, hash, shift + BITS_PER_LEVEL);
    }

    fn delete(&mut self, generation: u32, key: &str, hash: u32, shift: u32) -> bool {
        if shift >= HASH_BITS {
            let before = self.vals.len();
            self.vals.retain(|v| v.key() != key);
            return self.vals.len() != before;
        }
        let bit = bit(hash, shift);
        if self.bm_val & bit != 0 {
            let iv = ith(self.bm_val, bit);
            if self.vals[iv].key() == key {
                self.vals.remove(iv);
                self.bm_val &= !bit;
                return true;
            }
        }
        if self.bm_ptr & bit == 0 {
            return false;
        }
        let ip = ith(self.bm_ptr, bit);
        if self.ptrs[ip].get(key, hash).is_none() {
            return false;
        }
        let child = node_mut(&mut self.ptrs[ip], generation);
        child.delete(generation, key, hash, shift + BITS_PER_LEVEL);
        if child.is_empty() {
            self.ptrs.remove(ip);
            self.bm_ptr &= !bit;
        }
        true
    }

    fn get_mut(&mut self, generation: u32, key: &str, hash: u32, shift: u32) -> Option<&mut T> {
        if shift >= HASH_BITS {
            return self
                .vals
                .iter_mut()
                .find(|v| v.key() == key)
                .map(Arc::make_mut);
        }
        let bit = bit(hash, shift);
        if self.bm_val & bit != 0 {
            let iv = ith(self.bm_val, bit);
            if self.vals[iv].key() == key {
                return Some(Arc::make_mut(&mut self.vals[iv]));
            }
        }
        if self.bm_ptr & bit == 0 {
            return None;
        }
        let ip = ith(self.bm_ptr, bit);
        node_mut(&mut self.ptrs[ip], generation).get_mut(generation, key, hash, shift + BITS_PER_LEVEL)
    }

    fn for_each<'a, F: FnMut(&'a Arc<T>)>(&'a self, f: &mut F) {
        for v in &self.vals {
            f(v);
        }
        for p in &self.ptrs {
            p.for_each(f);
        }
    }
}

/// Returns a writable node for `generation`, copying it first if it belongs
/// to an older generation.
fn node_mut<T: HamtItem>(node: &mut Arc<Node<T>>, generation: u32) -> &mut Node<T> {
    if node.generation != generation {
        let mut copy = (**node).clone();
        copy.generation = generation;
        *node = Arc::new(copy);
    }
    Arc::make_mut(node)
}

/// An immutable trie snapshot.
pub struct Hamt<T> {
    root: Arc<Node<T>>,
    generation: u32,
}

impl<T> Clone for Hamt<T> {
    fn clone(&self) -> Self {
        Self {
            root: Arc::clone(&self.root),
            generation: self.generation,
        }
    }
}

impl<T: HamtItem> Default for Hamt<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: HamtItem> fmt::Debug for Hamt<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hamt")
            .field("generation", &self.generation)
            .field("len", &self.len())
            .finish()
    }
}

impl<T: HamtItem> Hamt<T> {
    /// An empty trie.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Arc::new(Node::empty(0)),
            generation: 0,
        }
    }

    /// Returns the item stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&T> {
        self.get_arc(key).map(|v| &**v)
    }

    /// Returns the shared handle of the item stored under `key`.
    #[must_use]
    pub fn get_arc(&self, key: &str) -> Option<&Arc<T>> {
        self.root.get(key, T::hash_key(key))
    }

    /// True if the trie holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Number of items. Walks the whole trie.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut n = 0;
        self.root.for_each(&mut |_| n += 1);
        n
    }

    /// Visits every item in pre-order: a node's values, then its children.
    pub fn for_each<F: FnMut(&T)>(&self, mut f: F) {
        self.root.for_each(&mut |v| f(&**v));
    }

    /// Like [`Hamt::for_each`] but hands out the shared handles.
    pub fn for_each_arc<F: FnMut(&Arc<T>)>(&self, mut f: F) {
        self.root.for_each(&mut f);
    }

    pub(crate) fn values(&self) -> Vec<&T> {
        let mut values = Vec::new();
        self.root.for_each(&mut |v| values.push(&**v));
        values
    }

    /// Starts a new generation that can be modified without affecting this
    /// snapshot.
    #[must_use]
    pub fn mutable(&self) -> HamtMut<T> {
        HamtMut {
            root: Arc::clone(&self.root),
            generation: self.generation.wrapping_add(1),
        }
    }
}

/// A trie being modified within one generation.
pub struct HamtMut<T> {
    root: Arc<Node<T>>,
    generation: u32,
}

// both copies share the generation; make_mut keeps their writes apart
impl<T> Clone for HamtMut<T> {
    fn clone(&self) -> Self {
        Self {
            root: Arc::clone(&self.root),
            generation: self.generation,
        }
    }
}

impl<T: HamtItem> fmt::Debug for HamtMut<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HamtMut")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl<T: HamtItem> HamtMut<T> {
    /// Returns the item stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&T> {
        self.root.get(key, T::hash_key(key)).map(|v| &**v)
    }

    /// Adds or replaces the item under its key.
    pub fn put(&mut self, item: T) {
        self.put_arc(Arc::new(item));
    }

    /// Adds or replaces an already shared item.
    pub fn put_arc(&mut self, item: Arc<T>) {
        let hash = T::hash_key(item.key());
        let generation = self.generation;
        node_mut(&mut self.root, generation).put(generation, item, hash, 0);
    }

    /// Removes the item under `key`, returning whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        let hash = T::hash_key(key);
        if self.root.get(key, hash).is_none() {
            return false;
        }
        let generation = self.generation;
        node_mut(&mut self.root, generation).delete(generation, key, hash, 0)
    }

    /// Returns a writable reference to the item under `key`.
    ///
    /// The item and the path to it are copied on first access in this
    /// generation, so snapshots sharing them are unaffected.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        let hash = T::hash_key(key);
        self.root.get(key, hash)?;
        let generation = self.generation;
        node_mut(&mut self.root, generation).get_mut(generation, key, hash, 0)
    }

    /// Visits every item in pre-order.
    pub fn for_each<F: FnMut(&T)>(&self, mut f: F) {
        self.root.for_each(&mut |v| f(&**v));
    }

    pub(crate) fn values(&self) -> Vec<&T> {
        let mut values = Vec::new();
        self.root.for_each(&mut |v| values.push(&**v));
        values
    }

    /// Ends the generation, returning an immutable snapshot.
    #[must_use]
    pub fn freeze(self) -> Hamt<T> {
        Hamt {
            root: self.root,
            generation: self.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        key: String,
        val: u32,
    }

    impl HamtItem for Item {
        fn key(&self) -> &str {
            &self.key
        }
    }

    fn item(key: &str, val: u32) -> Item {
        Item {
            key: key.to_string(),
            val,
        }
    }

    /// Hashes to a handful of values so most keys collide.
    #[derive(Debug, Clone, PartialEq)]
    struct Clashing(String);

    impl HamtItem for Clashing {
        fn key(&self) -> &str {
            &self.0
        }

        fn hash_key(key: &str) -> u32 {
            key.len() as u32 % 3
        }
    }

    #[test]
    fn put_get() {
        let mut m = Hamt::new().mutable();
        for i in 0..1000 {
            m.put(item(&format!("k{i}"), i));
        }
        let h = m.freeze();
        assert_eq!(h.len(), 1000);
        assert_eq!(h.get("k0").map(|x| x.val), Some(0));
        assert_eq!(h.get("k999").map(|x| x.val), Some(999));
        assert!(h.get("k1000").is_none());
    }

    #[test]
    fn frozen_snapshot_is_isolated() {
        let mut m = Hamt::new().mutable();
        for i in 0..100 {
            m.put(item(&format!("t{i}"), i));
        }
        let v1 = m.freeze();

        let mut m = v1.mutable();
        m.put(item("t5", 500));
        m.put(item("new", 1));
        m.delete("t7");
        m.get_mut("t9").unwrap().val = 900;
        let v2 = m.freeze();

        assert_eq!(v1.get("t5").unwrap().val, 5);
        assert!(v1.get("new").is_none());
        assert_eq!(v1.get("t7").unwrap().val, 7);
        assert_eq!(v1.get("t9").unwrap().val, 9);

        assert_eq!(v2.get("t5").unwrap().val, 500);
        assert!(v2.get("t7").is_none());
        assert_eq!(v2.get("t9").unwrap().val, 900);
        assert_eq!(v2.len(), 100);
    }

    #[test]
    fn unchanged_values_are_shared() {
        let mut m = Hamt::new().mutable();
        m.put(item("a", 1));
        m.put(item("b", 2));
        let v1 = m.freeze();
        let mut m = v1.mutable();
        m.get_mut("b").unwrap().val = 3;
        let v2 = m.freeze();
        assert!(Arc::ptr_eq(v1.get_arc("a").unwrap(), v2.get_arc("a").unwrap()));
        assert!(!Arc::ptr_eq(v1.get_arc("b").unwrap(), v2.get_arc("b").unwrap()));
    }

    #[test]
    fn full_collisions_use_overflow_node() {
        let mut m = Hamt::new().mutable();
        for i in 0..50 {
            m.put(Clashing(format!("{i:02}")));
        }
        m.put(Clashing("x".into()));
        let h = m.freeze();
        assert_eq!(h.len(), 51);
        assert!(h.get("07").is_some());
        assert!(h.get("x").is_some());
        assert!(h.get("99").is_none());

        let mut m = h.mutable();
        assert!(m.delete("07"));
        assert!(!m.delete("07"));
        let h2 = m.freeze();
        assert!(h2.get("07").is_none());
        assert!(h.get("07").is_some());
    }

    #[test]
    fn for_each_visits_everything_once() {
        let mut m = Hamt::new().mutable();
        for i in 0..300 {
            m.put(item(&i.to_string(), i));
        }
        let h = m.freeze();
        let mut seen = Vec::new();
        h.for_each(|x| seen.push(x.val));
        seen.sort_unstable();
        assert_eq!(seen, (0..300).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn matches_hashmap(ops in prop::collection::vec(("[a-f]{1,3}", any::<u32>(), any::<bool>()), 1..200)) {
            let mut model = HashMap::new();
            let mut m = Hamt::new().mutable();
            let mut snapshots = Vec::new();
            for (i, (key, val, del)) in ops.iter().enumerate() {
                if *del {
                    prop_assert_eq!(m.delete(key), model.remove(key).is_some());
                } else {
                    m.put(item(key, *val));
                    model.insert(key.clone(), *val);
                }
                if i % 25 == 0 {
                    let frozen = m.freeze();
                    snapshots.push((frozen.clone(), model.clone()));
                    m = frozen.mutable();
                }
            }
            let h = m.freeze();
            prop_assert_eq!(h.len(), model.len());
            for (k, v) in &model {
                prop_assert_eq!(h.get(k).map(|x| x.val), Some(*v));
            }
            for (snap, expected) in &snapshots {
                prop_assert_eq!(snap.len(), expected.len());
                for (k, v) in expected {
                    prop_assert_eq!(snap.get(k).map(|x| x.val), Some(*v));
                }
            }
        }
    }
}
