//! Metadata benchmarks: the in-memory trie, the packed on-disk view and
//! persisting.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use stratadb_bench::utils::memory_env;
use stratadb_core::{Hamt, IndexSpec, Info, Meta, PackedHamt, Schema};

fn schema(n: usize) -> Schema {
    Schema::new(
        format!("table{n:05}"),
        vec!["id".into(), "name".into()],
        vec![IndexSpec::new("id", vec![0]).unique()],
    )
}

fn schemas(count: usize) -> Hamt<Schema> {
    let mut hamt = Hamt::new().mutable();
    for n in 0..count {
        hamt.put(schema(n));
    }
    hamt.freeze()
}

/// Benchmark trie lookups.
fn bench_hamt_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("hamt_get");

    for count in [100usize, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let hamt = schemas(count);
            let keys: Vec<String> = (0..count).map(|n| format!("table{n:05}")).collect();

            let mut idx = 0;
            b.iter(|| {
                let found = hamt.get(black_box(&keys[(idx * 7) % count]));
                idx += 1;
                black_box(found);
            });
        });
    }

    group.finish();
}

/// Benchmark replacing one entry on a fresh mutable copy, as a transaction
/// touching one table does.
fn bench_hamt_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("hamt_put");

    for count in [100usize, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let hamt = schemas(count);
            let mut n = 0;
            b.iter(|| {
                let mut m = hamt.mutable();
                m.put(schema(n % count));
                n += 1;
                black_box(m.freeze());
            });
        });
    }

    group.finish();
}

/// Benchmark lookups in a packed block without building a trie.
fn bench_packed_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("packed_get");

    for count in [100usize, 5_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let env = memory_env();
            let off = schemas(count).write(env.arena(), 0, |_| true).unwrap();
            let packed = PackedHamt::open(env.arena(), off, env.config().max_probe).unwrap();
            let keys: Vec<String> = (0..count).map(|n| format!("table{n:05}")).collect();

            let mut idx = 0;
            b.iter(|| {
                let found = packed.get::<Schema>(black_box(&keys[(idx * 7) % count]), &()).unwrap();
                idx += 1;
                black_box(found);
            });
        });
    }

    group.finish();
}

/// Benchmark an incremental persist after a one-table change.
fn bench_persist(c: &mut Criterion) {
    let mut group = c.benchmark_group("persist");
    group.sample_size(30);

    for tables in [10usize, 1_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(tables), tables, |b, &tables| {
            let env = memory_env();
            let mut meta = Meta::new(Arc::clone(&env));
            for n in 0..tables {
                let ts = schema(n);
                let ti = Info::create(&env, &ts).unwrap();
                meta = meta.put(ts, ti).unwrap();
            }
            let update = meta.persist(true).unwrap();
            meta.apply_persist(update);

            let mut n = 0;
            b.iter(|| {
                let ts = schema(n % tables);
                let ti = Info::create(&env, &ts).unwrap();
                n += 1;
                let changed = meta.put(ts, ti).unwrap();
                black_box(changed.persist(false).unwrap().root());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_hamt_get, bench_hamt_put, bench_packed_get, bench_persist);

criterion_main!(benches);
