//! End-to-end scenarios exercising the allocator and hash table as a whole,
//! across real OS threads where concurrency is part of the contract.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::unbounded;

use nfs_core_alloc::rbtree::RbTree;
use nfs_core_alloc::{Allocator, BuddyParameter, HashTableParams, HashTable, SetMode};

fn small_page_config() -> BuddyParameter {
    BuddyParameter {
        page_size: 1024,
        on_demand_alloc: true,
        extra_alloc: false,
        free_areas: true,
        keep_factor: 3,
        keep_minimum: 5,
    }
}

#[test]
fn buddy_splitting_then_full_merge() {
    thread::spawn(|| {
        Allocator::init(Some(small_page_config())).unwrap();
        let before = Allocator::stats().unwrap();
        assert_eq!(before.std_page_count, 1);

        let a = Allocator::alloc(64).unwrap();
        assert!(a.is_some());
        let mid = Allocator::stats().unwrap();
        assert_eq!(mid.std_page_count, 1);
        assert!(mid.std_used_space > 0);

        Allocator::free(a);
        let after = Allocator::stats().unwrap();
        assert_eq!(after.std_used_space, 0);
        assert_eq!(after.client_visible_space, 0);
    })
    .join()
    .unwrap();
}

#[test]
fn cross_thread_free_is_drained_on_next_alloc() {
    let (tx, rx) = unbounded::<usize>();
    let (done_tx, done_rx) = unbounded::<()>();

    let t1 = thread::spawn(move || {
        Allocator::init(Some(small_page_config())).unwrap();
        let baseline = Allocator::stats().unwrap().std_used_space;
        let p = Allocator::alloc(32).unwrap().unwrap();
        tx.send(p.as_ptr() as usize).unwrap();

        done_rx.recv().unwrap();
        // Draining happens inside alloc(); a 1-byte probe forces it.
        let _probe = Allocator::alloc(1).unwrap();
        Allocator::free(_probe);

        let final_used = Allocator::stats().unwrap().std_used_space;
        assert_eq!(final_used, baseline);
    });

    let t2 = thread::spawn(move || {
        let raw = rx.recv().unwrap();
        let ptr = std::ptr::NonNull::new(raw as *mut u8).unwrap();
        Allocator::free(Some(ptr));
        done_tx.send(()).unwrap();
    });

    t1.join().unwrap();
    t2.join().unwrap();
}

#[test]
fn gc_policy_keeps_floor_pages() {
    thread::spawn(|| {
        let config = BuddyParameter {
            page_size: 1024,
            on_demand_alloc: true,
            extra_alloc: false,
            free_areas: true,
            keep_factor: 1,
            keep_minimum: 3,
        };
        Allocator::init(Some(config)).unwrap();

        // Each alloc(900) fills an entire 1024-byte page as one root block,
        // so holding 10 live ones forces 10 distinct pages to exist at once.
        let mut live = Vec::with_capacity(10);
        for _ in 0..10 {
            live.push(Allocator::alloc(900).unwrap());
        }
        let peak = Allocator::stats().unwrap();
        assert_eq!(peak.std_page_count, 10);
        assert_eq!(peak.std_page_in_use, 10);

        // GC only reconsiders the single just-freed page per call, gated by
        // max(keep_minimum, keep_factor * in_use) *at that moment* — not a
        // full re-scan down to the final floor. Freeing 9 of the 10 pages
        // one at a time, with in_use counting down from 9 to 1, releases a
        // page whenever std_page_count > floor and keeps it otherwise; that
        // sequence converges to exactly 3 pages left for this config.
        let last = live.pop().unwrap();
        for p in live.drain(..) {
            Allocator::free(p);
        }
        let floored = Allocator::stats().unwrap();
        assert_eq!(floored.std_page_in_use, 1);
        assert_eq!(floored.std_page_count, 3);

        Allocator::free(last);
    })
    .join()
    .unwrap();
}

#[test]
fn cross_thread_extra_free_updates_owner_stats() {
    let (tx, rx) = unbounded::<usize>();
    let (done_tx, done_rx) = unbounded::<()>();

    let owner = thread::spawn(move || {
        let config = BuddyParameter {
            page_size: 1024,
            on_demand_alloc: true,
            extra_alloc: true,
            free_areas: true,
            keep_factor: 3,
            keep_minimum: 5,
        };
        Allocator::init(Some(config)).unwrap();

        // Larger than page_size, so this is served by the extra-block path.
        let p = Allocator::alloc(4096).unwrap().unwrap();
        let before = Allocator::stats().unwrap();
        assert_eq!(before.extra_page_count, 1);
        tx.send(p.as_ptr() as usize).unwrap();

        done_rx.recv().unwrap();
        // The foreign free below only deferred the stats update; a probe
        // alloc forces the owner to drain it.
        let probe = Allocator::alloc(1).unwrap();
        Allocator::free(probe);

        let after = Allocator::stats().unwrap();
        assert_eq!(after.extra_page_count, 0);
        assert_eq!(after.extra_used_space, 0);
    });

    let freer = thread::spawn(move || {
        let raw = rx.recv().unwrap();
        let ptr = std::ptr::NonNull::new(raw as *mut u8).unwrap();
        Allocator::free(Some(ptr));
        done_tx.send(()).unwrap();
    });

    owner.join().unwrap();
    freer.join().unwrap();
}

#[test]
fn hash_set_get_del_matches_seed_scenario() {
    let params = HashTableParams {
        index_size: 257,
        hash_func_key: Arc::new(|k: &u64| *k as usize),
        hash_func_rbt: Arc::new(|k: &u64| *k),
        compare_key: Arc::new(|a: &u64, b: &u64| a.cmp(b)),
        key_to_str: None,
        val_to_str: None,
        hash_func_both: None,
    };
    let table: HashTable<u64, u64> = HashTable::new(params);

    for i in 1..=10_000u64 {
        table.set(i, i).unwrap();
    }
    for i in 1..=30u64 {
        let _ = table.get(&i);
    }
    for i in 1..=50u64 {
        table.del(&i).unwrap();
    }
    for i in 1..=50u64 {
        assert!(table.get(&i).is_err());
    }
    assert!(matches!(
        table.test_and_set(14, 14, SetMode::NoOverwrite),
        Ok(_) | Err(nfs_core_alloc::HashTableError::KeyAlreadyExists)
    ));
    let result = table.test_and_set(60, 60, SetMode::NoOverwrite);
    assert!(result.is_err());
    assert_eq!(table.get_stats().current_entries, 10_000 - 50);
}

#[test]
fn rb_iteration_matches_seed_scenario() {
    let mut tree: RbTree<i64> = RbTree::new(|a, b| a.cmp(b));
    for v in [4738i64, 6483, 8393, 9661, 2990] {
        tree.insert(v);
    }
    let collected: Vec<i64> = tree.iter().copied().collect();
    assert_eq!(collected, vec![2990, 4738, 6483, 8393, 9661]);
    assert_eq!(*tree.leftmost().unwrap(), 2990);
    assert_eq!(*tree.rightmost().unwrap(), 9661);
    tree.check_invariants().unwrap();
}

#[test]
fn destroy_pending_completes_on_foreign_free() {
    let (tx, rx) = unbounded::<usize>();
    let (destroyed_tx, destroyed_rx) = unbounded::<()>();

    let t1 = thread::spawn(move || {
        Allocator::init(Some(small_page_config())).unwrap();
        let p = Allocator::alloc(32).unwrap().unwrap();
        tx.send(p.as_ptr() as usize).unwrap();

        let result = Allocator::destroy();
        assert!(matches!(result, Err(nfs_core_alloc::AllocError::InUse)));

        destroyed_rx.recv().unwrap();

        // T1's stale context handle is now torn down; a fresh init succeeds.
        Allocator::init(Some(small_page_config())).unwrap();
        let fresh = Allocator::stats().unwrap();
        assert_eq!(fresh.std_page_count, 1);
    });

    let t2 = thread::spawn(move || {
        let raw = rx.recv().unwrap();
        let ptr = std::ptr::NonNull::new(raw as *mut u8).unwrap();
        Allocator::free(Some(ptr));
        destroyed_tx.send(()).unwrap();
    });

    t1.join().unwrap();
    t2.join().unwrap();
}
