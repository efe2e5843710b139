//! Object pool: fixed-size slab allocator built on the buddy allocator
//! (spec §4.E).
//!
//! Pool handoff across threads is not supported (spec §5): a pool's slabs
//! are carved from its creating thread's owner context, and `get`/`put` must
//! be called from that same thread. The free list and slab chain still live
//! behind a `Mutex`, matching the teacher's `MemoryPool` (`pools.rs`), rather
//! than the allocator's bare `UnsafeCell` discipline — pools are not a
//! hot-enough path to justify the extra unsafety.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::alloc::block::HEADER_SIZE;
use crate::alloc::{raw_alloc, raw_free};
use crate::error::Result;

/// Prefixes every slot in a slab. Per-slot only — the slab chain link lives
/// on the slab itself, not duplicated into every slot.
#[repr(C)]
struct SlotHeader {
    next_free: *mut SlotHeader,
    in_use: bool,
}

/// Prefixes a whole slab (one buddy allocation carved into `num_per_slab`
/// slots), chaining slabs of the same pool together.
#[repr(C)]
struct SlabHeader {
    next_slab: *mut SlabHeader,
}

fn slot_size<T>() -> usize {
    std::mem::size_of::<SlotHeader>() + std::mem::size_of::<T>()
}

/// `BuddyPreferedPoolCount`: pick the slot count per slab so the slab fills
/// a buddy block with minimal waste (spec §1.1, §4.E).
pub fn prefered_pool_count(min_count: usize, type_size: usize) -> usize {
    let slot = std::mem::size_of::<SlotHeader>() + type_size;
    let fixed = HEADER_SIZE + std::mem::size_of::<SlabHeader>();
    let want = min_count.max(1) * slot + fixed;
    let target = want.next_power_of_two();
    ((target.saturating_sub(fixed)) / slot).max(1)
}

struct PoolState {
    free_list: *mut SlotHeader,
    slabs: *mut SlabHeader,
    slab_count: usize,
}

unsafe impl Send for PoolState {}

/// Diagnostic summary for a registered pool (spec §6 pretty-printer).
#[derive(Debug, Clone)]
pub struct PoolSummary {
    pub pool_name: String,
    pub slabs: usize,
    pub slots_per_slab: usize,
    pub entry_size: usize,
    pub total_allocated: usize,
    pub in_use: usize,
    pub high_water: usize,
}

pub(crate) trait PoolReport: Send + Sync {
    fn summary(&self) -> PoolSummary;
}

/// A pool of fixed-size `T` slots carved from buddy-allocated slabs.
pub struct ObjectPool<T> {
    name: String,
    elem_size: usize,
    num_per_slab: usize,
    ctor: Option<Box<dyn Fn(&mut T) + Send + Sync>>,
    dtor: Option<Box<dyn Fn(&mut T) + Send + Sync>>,
    state: Mutex<PoolState>,
    in_use: AtomicUsize,
    high_water: AtomicUsize,
    _marker: PhantomData<T>,
}

unsafe impl<T> Send for ObjectPool<T> {}
unsafe impl<T> Sync for ObjectPool<T> {}

impl<T> ObjectPool<T> {
    /// `init_pool`: compute the per-slab slot count.
    pub fn new(name: impl Into<String>, min_count: usize) -> Self {
        Self::with_ctor_dtor(name, min_count, None, None)
    }

    pub fn with_ctor_dtor(
        name: impl Into<String>,
        min_count: usize,
        ctor: Option<Box<dyn Fn(&mut T) + Send + Sync>>,
        dtor: Option<Box<dyn Fn(&mut T) + Send + Sync>>,
    ) -> Self {
        let elem_size = std::mem::size_of::<T>();
        let num_per_slab = prefered_pool_count(min_count, elem_size);
        Self {
            name: name.into(),
            elem_size,
            num_per_slab,
            ctor,
            dtor,
            state: Mutex::new(PoolState {
                free_list: std::ptr::null_mut(),
                slabs: std::ptr::null_mut(),
                slab_count: 0,
            }),
            in_use: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// Carve a new slab via the owner context's allocator and thread its
    /// slots onto the free list.
    fn grow(&self, state: &mut PoolState) -> Result<()> {
        let slab_bytes = std::mem::size_of::<SlabHeader>() + self.num_per_slab * slot_size::<T>();
        let base = raw_alloc(slab_bytes)?;
        unsafe {
            let slab = base.as_ptr() as *mut SlabHeader;
            std::ptr::write(slab, SlabHeader { next_slab: state.slabs });
            state.slabs = slab;
            state.slab_count += 1;

            let mut cursor = (slab as *mut u8).add(std::mem::size_of::<SlabHeader>());
            for _ in 0..self.num_per_slab {
                let slot = cursor as *mut SlotHeader;
                std::ptr::write(
                    slot,
                    SlotHeader {
                        next_free: state.free_list,
                        in_use: false,
                    },
                );
                state.free_list = slot;
                cursor = cursor.add(slot_size::<T>());
            }
        }
        Ok(())
    }

    /// `get`: pop a free slot, running the constructor once per lifetime.
    pub fn get(&self) -> Result<NonNull<T>> {
        let mut state = self.state.lock();
        if state.free_list.is_null() {
            self.grow(&mut state)?;
        }
        unsafe {
            let slot = state.free_list;
            state.free_list = (*slot).next_free;
            (*slot).in_use = true;
            let payload = (slot as *mut u8).add(std::mem::size_of::<SlotHeader>()) as *mut T;
            if let Some(ctor) = &self.ctor {
                ctor(&mut *payload);
            }
            self.in_use.fetch_add(1, Ordering::Relaxed);
            let cur = self.in_use.load(Ordering::Relaxed);
            self.high_water.fetch_max(cur, Ordering::Relaxed);
            Ok(NonNull::new_unchecked(payload))
        }
    }

    /// `put`: run the destructor, mark the slot free, push it back. The slab
    /// itself is never reclaimed until the pool (or its owning context) is
    /// dropped.
    pub fn put(&self, ptr: NonNull<T>) {
        unsafe {
            let slot = (ptr.as_ptr() as *mut u8).sub(std::mem::size_of::<SlotHeader>()) as *mut SlotHeader;
            if let Some(dtor) = &self.dtor {
                dtor(&mut *ptr.as_ptr());
            }
            (*slot).in_use = false;
            let mut state = self.state.lock();
            (*slot).next_free = state.free_list;
            state.free_list = slot;
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<T: Send + Sync> PoolReport for ObjectPool<T> {
    fn summary(&self) -> PoolSummary {
        let state = self.state.lock();
        PoolSummary {
            pool_name: self.name.clone(),
            slabs: state.slab_count,
            slots_per_slab: self.num_per_slab,
            entry_size: self.elem_size,
            total_allocated: state.slab_count * self.num_per_slab,
            in_use: self.in_use.load(Ordering::Relaxed),
            high_water: self.high_water.load(Ordering::Relaxed),
        }
    }
}

impl<T: Send + Sync + 'static> ObjectPool<T> {
    /// Register this pool in the process-wide list consulted by
    /// [`dump_pools`], the way the source links every pool into a global
    /// list at `init_pool` time. Held weakly: a dropped pool simply stops
    /// showing up in the dump.
    pub fn register(self: &Arc<Self>) {
        let weak: Weak<dyn PoolReport> = Arc::downgrade(self) as Weak<dyn PoolReport>;
        POOL_REGISTRY.lock().push(weak);
    }
}

impl<T> Drop for ObjectPool<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let mut slab = state.slabs;
        unsafe {
            while !slab.is_null() {
                let next = (*slab).next_slab;
                let _ = raw_free(NonNull::new_unchecked(slab as *mut u8));
                slab = next;
            }
        }
    }
}

static POOL_REGISTRY: Lazy<Mutex<Vec<Weak<dyn PoolReport>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Render every pool currently registered for reporting (spec §6 "pool
/// summaries"). Dead entries (pool already dropped) are pruned.
pub fn dump_pools(w: &mut dyn std::io::Write) -> std::io::Result<()> {
    let mut registry = POOL_REGISTRY.lock();
    registry.retain(|weak| weak.strong_count() > 0);
    for weak in registry.iter() {
        if let Some(pool) = weak.upgrade() {
            let s = pool.summary();
            writeln!(
                w,
                "pool {}: slabs={} slots_per_slab={} entry_size={} total={} in_use={} high_water={}",
                s.pool_name, s.slabs, s.slots_per_slab, s.entry_size, s.total_allocated, s.in_use, s.high_water
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefered_pool_count_fills_without_waste() {
        let n = prefered_pool_count(10, 32);
        assert!(n >= 10);
    }
}
