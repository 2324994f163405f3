//! Index tree benchmarks: merging deltas and point lookups.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use stratadb_bench::utils::{id_spec, insert_delta, memory_env, populated_tree, shuffled_ids};
use stratadb_core::{Btree, DeltaBuffer};

/// Benchmark building a tree from empty with one delta.
fn bench_merge_into_empty(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_into_empty");
    group.sample_size(20);

    for count in [100u32, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(u64::from(*count)));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let env = memory_env();
            let spec = id_spec();
            let tree = Btree::create(Arc::clone(&env), Arc::clone(&spec)).unwrap();
            let delta = insert_delta(&env, &spec, &shuffled_ids(count));

            b.iter(|| {
                let merged = tree.merge(black_box(&delta)).unwrap();
                black_box(merged.root());
            });
        });
    }

    group.finish();
}

/// Benchmark merging small deltas into a large tree, the common case after
/// each commit.
fn bench_merge_small_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_small_delta");

    let env = memory_env();
    let spec = id_spec();
    let tree = populated_tree(&env, 20_000);

    for size in [1u32, 10, 100].iter() {
        group.throughput(Throughput::Elements(u64::from(*size)));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let ids: Vec<u32> = (0..size).map(|i| 20_000 + i * 97).collect();
            let delta = insert_delta(&env, &spec, &ids);

            b.iter(|| {
                let merged = tree.merge(black_box(&delta)).unwrap();
                black_box(merged.root());
            });
        });
    }

    group.finish();
}

/// Benchmark point lookups.
fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for count in [1_000u32, 100_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let env = memory_env();
            let tree = populated_tree(&env, count);
            let keys: Vec<Vec<u8>> = shuffled_ids(count)
                .into_iter()
                .map(|id| format!("{id:08}").into_bytes())
                .collect();

            let mut idx = 0;
            b.iter(|| {
                let found = tree.lookup(black_box(&keys[idx])).unwrap();
                idx = (idx + 1) % keys.len();
                black_box(found);
            });
        });
    }

    group.finish();
}

/// Benchmark a full integrity walk.
fn bench_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("check");
    group.sample_size(20);

    let env = memory_env();
    let tree = populated_tree(&env, 10_000);
    group.bench_function("full_10000", |b| {
        b.iter(|| black_box(tree.check().unwrap()));
    });
    group.bench_function("quick_10000", |b| {
        b.iter(|| black_box(tree.quick_check().unwrap()));
    });

    // an empty delta hands back the same tree
    group.bench_function("merge_empty_delta", |b| {
        let empty = DeltaBuffer::new();
        b.iter(|| black_box(tree.merge(&empty).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_merge_into_empty,
    bench_merge_small_delta,
    bench_lookup,
    bench_check,
);

criterion_main!(benches);
