//! Benchmark utilities.
//!
//! Everything is seeded so repeated runs measure the same work.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use stratadb_core::{Btree, Config, DeltaBuffer, Env, IndexSpec, Record, RecordKeys};
use stratadb_storage::Arena;

/// Seed used by every generator here.
pub const SEED: u64 = 0x5747_a7a0;

/// Generate random bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(SEED);
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` distinct primary keys in random order.
pub fn shuffled_ids(count: u32) -> Vec<u32> {
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut ids: Vec<u32> = (0..count).collect();
    for i in (1..ids.len()).rev() {
        ids.swap(i, rng.gen_range(0..=i));
    }
    ids
}

/// An in-memory environment with default settings.
pub fn memory_env() -> Arc<Env> {
    let arena = Arena::in_memory().expect("Failed to create arena");
    Arc::new(Env::new(Arc::new(arena), Arc::new(RecordKeys), Config::default()))
}

/// The index used by the tree benchmarks: one key field.
pub fn id_spec() -> Arc<IndexSpec> {
    Arc::new(IndexSpec::new("id", vec![0]).unique())
}

/// Writes one record per id and returns the insert delta for them.
pub fn insert_delta(env: &Env, spec: &IndexSpec, ids: &[u32]) -> DeltaBuffer {
    let mut delta = DeltaBuffer::new();
    for id in ids {
        let rec = Record::new(vec![format!("{id:08}").into_bytes(), b"payload".to_vec()]);
        let off = rec.write(env.arena()).expect("Failed to write record");
        delta.insert(&spec.key(&rec), off).expect("Failed to stage insert");
    }
    delta
}

/// A tree holding `count` rows with ids `0..count`.
pub fn populated_tree(env: &Arc<Env>, count: u32) -> Btree {
    let spec = id_spec();
    let tree = Btree::create(Arc::clone(env), Arc::clone(&spec)).expect("Failed to create tree");
    let delta = insert_delta(env, &spec, &shuffled_ids(count));
    tree.merge(&delta).expect("Failed to merge")
}
