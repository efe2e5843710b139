// Buddy allocator performance benchmarks.
// Covers alloc/free at a few size classes, split-then-merge churn, and
// cross-thread free hand-off since that path takes a lock the local
// fast path doesn't.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nfs_core_alloc::{Allocator, BuddyParameter};
use std::sync::mpsc;
use std::thread;

fn bench_config() -> BuddyParameter {
    BuddyParameter {
        page_size: 1 << 20,
        on_demand_alloc: true,
        extra_alloc: true,
        free_areas: true,
        keep_factor: 3,
        keep_minimum: 5,
    }
}

fn bench_alloc_free_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");

    for size in [16usize, 64, 256, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            thread::spawn(move || {
                Allocator::init(Some(bench_config())).unwrap();
                b.iter(|| {
                    let p = Allocator::alloc(black_box(size)).unwrap();
                    Allocator::free(p);
                });
            })
            .join()
            .unwrap();
        });
    }

    group.finish();
}

fn bench_split_merge_churn(c: &mut Criterion) {
    c.bench_function("split_merge_churn", |b| {
        thread::spawn(|| {
            Allocator::init(Some(bench_config())).unwrap();
            b.iter(|| {
                let mut live = Vec::with_capacity(64);
                for i in 0..64 {
                    let size = 16usize << (i % 6);
                    live.push(Allocator::alloc(black_box(size)).unwrap());
                }
                for p in live.drain(..) {
                    Allocator::free(p);
                }
            });
        })
        .join()
        .unwrap();
    });
}

fn bench_cross_thread_free(c: &mut Criterion) {
    c.bench_function("cross_thread_free", |b| {
        let (ptr_tx, ptr_rx) = mpsc::channel::<usize>();
        let (freed_tx, freed_rx) = mpsc::channel::<()>();
        let (request_tx, request_rx) = mpsc::channel::<bool>();

        let owner = thread::spawn(move || {
            Allocator::init(Some(bench_config())).unwrap();
            while let Ok(keep_going) = request_rx.recv() {
                if !keep_going {
                    break;
                }
                let p = Allocator::alloc(64).unwrap().unwrap();
                ptr_tx.send(p.as_ptr() as usize).unwrap();
                // The foreign free below lands on the to_be_freed list; drain
                // it with a zero-sized probe so the next iteration's alloc
                // doesn't silently inherit a growing backlog.
                let probe = Allocator::alloc(1).unwrap();
                Allocator::free(probe);
            }
        });

        let freer = thread::spawn(move || {
            while let Ok(raw) = ptr_rx.recv() {
                let ptr = std::ptr::NonNull::new(raw as *mut u8).unwrap();
                Allocator::free(Some(ptr));
                freed_tx.send(()).unwrap();
            }
        });

        b.iter(|| {
            request_tx.send(true).unwrap();
            freed_rx.recv().unwrap();
        });

        request_tx.send(false).unwrap();
        owner.join().unwrap();
        freer.join().unwrap();
    });
}

criterion_group!(benches, bench_alloc_free_sizes, bench_split_merge_churn, bench_cross_thread_free);
criterion_main!(benches);
