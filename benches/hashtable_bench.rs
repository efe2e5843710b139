// Hash table performance benchmarks: set/get/del throughput and the cost
// of the full-scan bucket stats pass at a realistic table size.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nfs_core_alloc::{HashTable, HashTableParams, SetMode};
use std::sync::Arc;

fn u64_table() -> HashTable<u64, u64> {
    let params = HashTableParams {
        index_size: 4099,
        hash_func_key: Arc::new(|k: &u64| *k as usize),
        hash_func_rbt: Arc::new(|k: &u64| *k),
        compare_key: Arc::new(|a: &u64, b: &u64| a.cmp(b)),
        key_to_str: None,
        val_to_str: None,
        hash_func_both: None,
    };
    HashTable::new(params)
}

fn filled_table(n: u64) -> HashTable<u64, u64> {
    let table = u64_table();
    for i in 0..n {
        table.set(i, i).unwrap();
    }
    table
}

fn bench_set(c: &mut Criterion) {
    c.bench_function("hash_set", |b| {
        let table = u64_table();
        let mut next = 0u64;
        b.iter(|| {
            table.set(black_box(next), next).unwrap();
            next += 1;
        });
    });
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_get");

    for n in [100u64, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let table = filled_table(n);
            let mut probe = 0u64;
            b.iter(|| {
                let _ = table.get(black_box(&(probe % n)));
                probe += 1;
            });
        });
    }

    group.finish();
}

fn bench_set_and_del(c: &mut Criterion) {
    c.bench_function("hash_set_then_del", |b| {
        let table = u64_table();
        let mut next = 0u64;
        b.iter(|| {
            table.set(next, next).unwrap();
            table.del(&next).unwrap();
            next += 1;
        });
    });
}

fn bench_test_and_set_no_overwrite(c: &mut Criterion) {
    c.bench_function("hash_test_and_set_no_overwrite", |b| {
        let table = filled_table(10_000);
        b.iter(|| {
            // Always collides with an existing key; exercises the failure path.
            let _ = table.test_and_set(black_box(5_000), 0, SetMode::NoOverwrite);
        });
    });
}

fn bench_get_stats(c: &mut Criterion) {
    let table = filled_table(10_000);
    c.bench_function("hash_get_stats_10k", |b| {
        b.iter(|| {
            black_box(table.get_stats());
        });
    });
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_set_and_del,
    bench_test_and_set_no_overwrite,
    bench_get_stats
);
criterion_main!(benches);
