//! Bucket array of red-black trees (spec §4.G): `set`/`test_and_set`/`get`/
//! `del` with stable in-bucket ordering and per-table statistics.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{HashTableError, HtResult};
use crate::rbtree::RbTree;

/// Entry stored in a bucket's tree; ordered by `hash_func_rbt` with
/// `compare_key` breaking ties (spec §4.G).
struct Entry<K, V> {
    key: K,
    value: V,
}

/// Construction-time parameters (spec §4.G, §1.1).
#[derive(Clone)]
pub struct HashTableParams<K, V> {
    /// Bucket count. `0` picks [`default_index_size`] instead of a fixed
    /// size, scaling the table for the host's parallelism.
    pub index_size: usize,
    pub hash_func_key: Arc<dyn Fn(&K) -> usize + Send + Sync>,
    pub hash_func_rbt: Arc<dyn Fn(&K) -> u64 + Send + Sync>,
    pub compare_key: Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>,
    /// Pretty-printers for diagnostic dumps; neither is consulted on the hot path.
    pub key_to_str: Option<Arc<dyn Fn(&K) -> String + Send + Sync>>,
    pub val_to_str: Option<Arc<dyn Fn(&V) -> String + Send + Sync>>,
    /// Optional fused `(bucket_index, rbt_value)` computation for callers
    /// whose key hashing shares work between the two — skips the second
    /// call to `hash_func_key`/`hash_func_rbt` when set.
    pub hash_func_both: Option<Arc<dyn Fn(&K) -> (usize, u64) + Send + Sync>>,
}

/// Default bucket count when a caller doesn't pin one: a prime comfortably
/// above `16 * cpu_count`, so per-bucket lock contention stays low even
/// under a worker-per-core load pattern (the same sizing idea the teacher
/// applies to its per-core frame pools in `buffer/manager.rs`).
pub fn default_index_size() -> usize {
    const PRIMES: &[usize] = &[
        1_031, 2_053, 4_099, 8_209, 16_411, 32_771, 65_537, 131_101,
    ];
    let target = num_cpus::get().max(1) * 16;
    PRIMES
        .iter()
        .copied()
        .find(|&p| p >= target)
        .unwrap_or(*PRIMES.last().unwrap())
}

/// `test_and_set` mode (spec §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Overwrite,
    NoOverwrite,
    TestOnly,
}

#[derive(Default)]
struct Counters {
    set_ok: AtomicU64,
    set_fail: AtomicU64,
    get_ok: AtomicU64,
    get_notfound: AtomicU64,
    del_ok: AtomicU64,
    del_notfound: AtomicU64,
    test_ok: AtomicU64,
    test_notfound: AtomicU64,
}

/// Aggregated statistics (spec §4.G).
#[derive(Debug, Clone)]
pub struct HashTableStats {
    pub current_entries: usize,
    pub set_ok: u64,
    pub set_fail: u64,
    pub get_ok: u64,
    pub get_notfound: u64,
    pub del_ok: u64,
    pub del_notfound: u64,
    pub test_ok: u64,
    pub test_notfound: u64,
    pub min_bucket: usize,
    pub max_bucket: usize,
    pub avg_bucket: f64,
}

pub struct HashTable<K, V> {
    buckets: Vec<Mutex<RbTree<Entry<K, V>>>>,
    params: HashTableParams<K, V>,
    current_entries: AtomicUsize,
    counters: Counters,
}

impl<K: 'static, V: 'static> HashTable<K, V> {
    pub fn new(params: HashTableParams<K, V>) -> Self {
        let index_size = if params.index_size == 0 {
            default_index_size()
        } else {
            params.index_size
        };
        let mut buckets = Vec::with_capacity(index_size);
        for _ in 0..index_size {
            let hash_func_rbt = params.hash_func_rbt.clone();
            let compare_key = params.compare_key.clone();
            buckets.push(Mutex::new(RbTree::new(move |a: &Entry<K, V>, b: &Entry<K, V>| {
                match hash_func_rbt(&a.key).cmp(&hash_func_rbt(&b.key)) {
                    Ordering::Equal => compare_key(&a.key, &b.key),
                    other => other,
                }
            })));
        }
        Self {
            buckets,
            params,
            current_entries: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    /// `(bucket_index, rbt_value)` for `key`, preferring the caller's fused
    /// `hash_func_both` over two separate calls when one is supplied.
    fn hash_key(&self, key: &K) -> (usize, u64) {
        match &self.params.hash_func_both {
            Some(both) => {
                let (idx, rbt) = both(key);
                (idx % self.buckets.len(), rbt)
            }
            None => (
                (self.params.hash_func_key)(key) % self.buckets.len(),
                (self.params.hash_func_rbt)(key),
            ),
        }
    }

    fn find_in_bucket(&self, tree: &RbTree<Entry<K, V>>, key: &K, rbt_val: u64) -> Option<crate::rbtree::NodeHandle<Entry<K, V>>> {
        let compare_key = &self.params.compare_key;
        tree.find_by(|entry| match rbt_val.cmp(&(self.params.hash_func_rbt)(&entry.key)) {
            Ordering::Equal => compare_key(key, &entry.key),
            other => other,
        })
    }

    /// `set`: overwriting set.
    pub fn set(&self, key: K, value: V) -> HtResult<()> {
        let (idx, rbt_val) = self.hash_key(&key);
        let mut tree = self.buckets[idx].lock();
        match self.find_in_bucket(&tree, &key, rbt_val) {
            Some(handle) => {
                tree.value_mut(handle).value = value;
            }
            None => {
                tree.insert(Entry { key, value });
                self.current_entries.fetch_add(1, AtomicOrdering::Relaxed);
            }
        }
        self.counters.set_ok.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// `test_and_set` (spec §4.G).
    pub fn test_and_set(&self, key: K, value: V, mode: SetMode) -> HtResult<bool> {
        let (idx, rbt_val) = self.hash_key(&key);
        let mut tree = self.buckets[idx].lock();
        let existing = self.find_in_bucket(&tree, &key, rbt_val);

        match mode {
            SetMode::Overwrite => {
                match existing {
                    Some(handle) => tree.value_mut(handle).value = value,
                    None => {
                        tree.insert(Entry { key, value });
                        self.current_entries.fetch_add(1, AtomicOrdering::Relaxed);
                    }
                }
                self.counters.set_ok.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(true)
            }
            SetMode::NoOverwrite => {
                if existing.is_some() {
                    self.counters.set_fail.fetch_add(1, AtomicOrdering::Relaxed);
                    trace!("test_and_set(NO_OVERWRITE): key already exists");
                    return Err(HashTableError::KeyAlreadyExists);
                }
                tree.insert(Entry { key, value });
                self.current_entries.fetch_add(1, AtomicOrdering::Relaxed);
                self.counters.set_ok.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(true)
            }
            SetMode::TestOnly => {
                if existing.is_some() {
                    self.counters.test_ok.fetch_add(1, AtomicOrdering::Relaxed);
                    Ok(true)
                } else {
                    self.counters.test_notfound.fetch_add(1, AtomicOrdering::Relaxed);
                    Ok(false)
                }
            }
        }
    }

    /// `get`.
    pub fn get(&self, key: &K) -> HtResult<V>
    where
        V: Clone,
    {
        let (idx, rbt_val) = self.hash_key(key);
        let tree = self.buckets[idx].lock();
        match self.find_in_bucket(&tree, key, rbt_val) {
            Some(handle) => {
                self.counters.get_ok.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(tree.value(handle).value.clone())
            }
            None => {
                self.counters.get_notfound.fetch_add(1, AtomicOrdering::Relaxed);
                trace!("get: no such key");
                Err(HashTableError::NoSuchKey)
            }
        }
    }

    /// `del`: returns the removed key/value so the caller can free them.
    pub fn del(&self, key: &K) -> HtResult<(K, V)> {
        let (idx, rbt_val) = self.hash_key(key);
        let mut tree = self.buckets[idx].lock();
        match self.find_in_bucket(&tree, key, rbt_val) {
            Some(handle) => {
                let entry = tree.unlink(handle);
                self.current_entries.fetch_sub(1, AtomicOrdering::Relaxed);
                self.counters.del_ok.fetch_add(1, AtomicOrdering::Relaxed);
                Ok((entry.key, entry.value))
            }
            None => {
                self.counters.del_notfound.fetch_add(1, AtomicOrdering::Relaxed);
                debug!("del: no such key");
                Err(HashTableError::NoSuchKey)
            }
        }
    }

    /// `get_stats`: aggregated counters plus a full bucket-population scan.
    pub fn get_stats(&self) -> HashTableStats {
        let mut min_bucket = usize::MAX;
        let mut max_bucket = 0;
        let mut total = 0usize;
        for bucket in &self.buckets {
            let len = bucket.lock().len();
            min_bucket = min_bucket.min(len);
            max_bucket = max_bucket.max(len);
            total += len;
        }
        if self.buckets.is_empty() {
            min_bucket = 0;
        }
        HashTableStats {
            current_entries: self.current_entries.load(AtomicOrdering::Relaxed),
            set_ok: self.counters.set_ok.load(AtomicOrdering::Relaxed),
            set_fail: self.counters.set_fail.load(AtomicOrdering::Relaxed),
            get_ok: self.counters.get_ok.load(AtomicOrdering::Relaxed),
            get_notfound: self.counters.get_notfound.load(AtomicOrdering::Relaxed),
            del_ok: self.counters.del_ok.load(AtomicOrdering::Relaxed),
            del_notfound: self.counters.del_notfound.load(AtomicOrdering::Relaxed),
            test_ok: self.counters.test_ok.load(AtomicOrdering::Relaxed),
            test_notfound: self.counters.test_notfound.load(AtomicOrdering::Relaxed),
            min_bucket,
            max_bucket,
            avg_bucket: total as f64 / self.buckets.len().max(1) as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_table() -> HashTable<String, String> {
        let params = HashTableParams {
            index_size: 64,
            hash_func_key: Arc::new(|k: &String| {
                k.bytes().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize))
            }),
            hash_func_rbt: Arc::new(|k: &String| {
                k.bytes().fold(0u64, |acc, b| acc.wrapping_mul(1099511628211).wrapping_add(b as u64))
            }),
            compare_key: Arc::new(|a: &String, b: &String| a.cmp(b)),
            key_to_str: None,
            val_to_str: None,
            hash_func_both: None,
        };
        HashTable::new(params)
    }

    #[test]
    fn set_get_overwrite_del_round_trip() {
        let table = string_table();
        table.set("1".to_string(), "1".to_string()).unwrap();
        assert_eq!(table.get(&"1".to_string()).unwrap(), "1");
        table.set("1".to_string(), "one".to_string()).unwrap();
        assert_eq!(table.get(&"1".to_string()).unwrap(), "one");
        table.del(&"1".to_string()).unwrap();
        assert!(matches!(table.get(&"1".to_string()), Err(HashTableError::NoSuchKey)));
    }

    #[test]
    fn no_overwrite_mode_fails_on_existing_key() {
        let table = string_table();
        assert!(table.test_and_set("14".to_string(), "14".to_string(), SetMode::NoOverwrite).unwrap());
        let result = table.test_and_set("14".to_string(), "x".to_string(), SetMode::NoOverwrite);
        assert!(matches!(result, Err(HashTableError::KeyAlreadyExists)));
    }

    #[test]
    fn bulk_insert_and_delete_tracks_current_entries() {
        let table = string_table();
        for i in 1..=10_000 {
            table.set(i.to_string(), i.to_string()).unwrap();
        }
        for i in 1..=50 {
            table.del(&i.to_string()).unwrap();
        }
        assert_eq!(table.get_stats().current_entries, 9_950);
    }

    #[test]
    fn zero_index_size_picks_default_bucket_count() {
        let params = HashTableParams {
            index_size: 0,
            hash_func_key: Arc::new(|k: &u64| *k as usize),
            hash_func_rbt: Arc::new(|k: &u64| *k),
            compare_key: Arc::new(|a: &u64, b: &u64| a.cmp(b)),
            key_to_str: None,
            val_to_str: None,
            hash_func_both: None,
        };
        let table: HashTable<u64, u64> = HashTable::new(params);
        assert_eq!(table.buckets.len(), default_index_size());
        assert!(table.buckets.len() > 0);
        table.set(1, 1).unwrap();
        assert_eq!(table.get(&1).unwrap(), 1);
    }

    #[test]
    fn hash_func_both_is_used_in_place_of_the_separate_functions() {
        let params = HashTableParams {
            index_size: 16,
            hash_func_key: Arc::new(|_: &u64| panic!("hash_func_key should not be called when hash_func_both is set")),
            hash_func_rbt: Arc::new(|k: &u64| *k),
            compare_key: Arc::new(|a: &u64, b: &u64| a.cmp(b)),
            key_to_str: None,
            val_to_str: None,
            hash_func_both: Some(Arc::new(|k: &u64| (*k as usize, *k))),
        };
        let table: HashTable<u64, u64> = HashTable::new(params);
        table.set(42, 100).unwrap();
        assert_eq!(table.get(&42).unwrap(), 100);
        table.del(&42).unwrap();
    }
}
