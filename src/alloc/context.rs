//! Owner context: per-thread allocator state, lazily created and registered
//! in a process-wide runtime (spec §4.C, §5).
//!
//! The free-index and stats fields are touched only by the owning thread —
//! the contract the whole allocator is built on — so they live behind a
//! plain [`UnsafeCell`] rather than a lock. The one field genuinely mutated
//! by foreign threads, `to_be_freed` (bundled with `destroy_pending`, since
//! the spec requires both guarded by the same mutex), is a real
//! `parking_lot::Mutex`.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::alloc::block::{class_size, BlockHeader, BlockInfo};
use crate::alloc::config::BuddyParameter;
use crate::alloc::free_index::FreeIndex;
use crate::alloc::page::{self, garbage_std_pages, merge_on_free};
use crate::alloc::stats::BuddyStats;
use crate::error::{AllocError, Result};

/// Callsite stashed by an `*_autolabel` call, consumed by the very next
/// allocator operation on this thread.
#[derive(Clone)]
pub(crate) struct PendingLabel {
    pub file: &'static str,
    pub func: &'static str,
    pub line: u32,
    pub label: Option<String>,
}

/// Fields touched only by the owning thread.
pub(crate) struct OwnerContextInner {
    pub config: BuddyParameter,
    pub std_size_k: u32,
    pub stats: BuddyStats,
    pub free_index: FreeIndex,
    pub last_error: Option<AllocError>,
    pub allocated_list: *mut BlockHeader,
    pub pending_label: Option<PendingLabel>,
}

/// Fields mutated by foreign threads, guarded together per spec §5.
pub(crate) struct ForeignState {
    pub to_be_freed: *mut BlockHeader,
    pub destroy_pending: bool,
    /// Stat deltas (`total_size`, `user_size`) from extra blocks freed by a
    /// thread other than the owner. Extra blocks are released to the system
    /// allocator immediately on free rather than deferred like standard
    /// blocks, but the owner-thread-only `stats` field still can't be
    /// touched from here, so the delta waits here until the owner drains it.
    pub extra_to_be_freed: Vec<(usize, usize)>,
}

unsafe impl Send for ForeignState {}

pub struct OwnerContext {
    pub(crate) owner_thread: ThreadId,
    inner: UnsafeCell<OwnerContextInner>,
    pub(crate) foreign: Mutex<ForeignState>,
    /// Set once `try_cleanup` completes a teardown, possibly from a foreign
    /// thread. `owner_thread`'s own thread-local slot can only be cleared by
    /// `owner_thread` itself, so this flag is how it notices on next use
    /// that its cached handle is dead and a fresh context is needed.
    torn_down: std::sync::atomic::AtomicBool,
}

// Only ever dereferenced on `owner_thread`, or by `try_cleanup`/registry dump
// paths that only read stats for reporting. `foreign` carries the genuinely
// cross-thread-mutated state behind its own lock.
unsafe impl Sync for OwnerContext {}

impl OwnerContext {
    fn new(config: BuddyParameter, std_size_k: u32, owner_thread: ThreadId) -> Self {
        Self {
            owner_thread,
            inner: UnsafeCell::new(OwnerContextInner {
                config,
                std_size_k,
                stats: BuddyStats::default(),
                free_index: FreeIndex::new(),
                last_error: None,
                allocated_list: std::ptr::null_mut(),
                pending_label: None,
            }),
            foreign: Mutex::new(ForeignState {
                to_be_freed: std::ptr::null_mut(),
                destroy_pending: false,
                extra_to_be_freed: Vec::new(),
            }),
            torn_down: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down.load(std::sync::atomic::Ordering::Acquire)
    }

    /// # Safety
    /// Caller must be running on `self.owner_thread`.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn inner_mut(&self) -> &mut OwnerContextInner {
        &mut *self.inner.get()
    }

    pub fn last_error(&self) -> Option<AllocError> {
        unsafe { (*self.inner.get()).last_error.clone() }
    }

    pub(crate) fn set_last_error(&self, err: AllocError) {
        unsafe { (*self.inner.get()).last_error = Some(err.clone()) };
        warn!(error = %err, "allocator error recorded on owner context");
    }

    /// Count live blocks per label on this context, for [`AllocatorRuntime::labels_summary`].
    pub(crate) fn label_counts(&self) -> std::collections::HashMap<String, usize> {
        let mut counts = std::collections::HashMap::new();
        unsafe {
            let inner = &*self.inner.get();
            let mut cursor = inner.allocated_list;
            while !cursor.is_null() {
                if let Some(d) = &(*cursor).debug {
                    if let Some(label) = &d.label {
                        *counts.entry(label.clone()).or_insert(0) += 1;
                    }
                    cursor = d.next_allocated;
                } else {
                    break;
                }
            }
        }
        counts
    }

    /// Snapshot of stats for diagnostics/dump output; not synchronized with
    /// the owner thread beyond whatever the OS gives for free (spec's
    /// pretty-printers are explicitly "diagnostic and not consumed
    /// programmatically").
    pub fn stats_snapshot(&self) -> BuddyStats {
        unsafe { (*self.inner.get()).stats }
    }

    /// Push a block owned by this context onto its foreign free list. Called
    /// by threads other than `owner_thread`.
    ///
    /// # Safety
    /// `header` must be a USED standard block owned by `self`, not currently
    /// linked into anything.
    pub(crate) unsafe fn push_foreign_free(self: &Arc<Self>, header: *mut BlockHeader) {
        let pending = {
            let mut guard = self.foreign.lock();
            let body = BlockHeader::free_body(header);
            (*body).next = guard.to_be_freed;
            guard.to_be_freed = header;
            guard.destroy_pending
        };
        if pending {
            let _ = try_cleanup(self);
        }
    }

    /// Record an extra block's stat delta from a free that already ran on a
    /// foreign thread (the allocation itself was released synchronously;
    /// only the owner-thread-only `stats` bookkeeping is deferred here).
    pub(crate) fn push_foreign_extra_free(self: &Arc<Self>, total_size: usize, user_size: usize) {
        let pending = {
            let mut guard = self.foreign.lock();
            guard.extra_to_be_freed.push((total_size, user_size));
            guard.destroy_pending
        };
        if pending {
            let _ = try_cleanup(self);
        }
    }

    /// Drain pending extra-block stat deltas left by foreign frees into this
    /// context's stats.
    ///
    /// # Safety contract
    /// Same as [`OwnerContext::inner_mut`]: callable from `owner_thread`, or
    /// from `try_cleanup` running on a foreign thread during a deferred
    /// teardown.
    pub(crate) fn drain_foreign_extra_frees(&self) {
        let pending = std::mem::take(&mut self.foreign.lock().extra_to_be_freed);
        if pending.is_empty() {
            return;
        }
        let inner = unsafe { self.inner_mut() };
        for (total_size, user_size) in pending {
            inner.stats.on_extra_free(total_size, user_size);
        }
    }
}

/// Process-wide registry of live contexts (spec §4.C, §5 "global context list").
pub struct AllocatorRuntime {
    contexts: Mutex<Vec<Arc<OwnerContext>>>,
}

impl AllocatorRuntime {
    fn new() -> Self {
        Self {
            contexts: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, ctx: &Arc<OwnerContext>) {
        self.contexts.lock().push(Arc::clone(ctx));
    }

    fn unregister(&self, ctx: &Arc<OwnerContext>) {
        self.contexts.lock().retain(|c| !Arc::ptr_eq(c, ctx));
    }

    /// `ShowAllContext` equivalent: log every registered context's headline
    /// stats at debug severity.
    pub fn log_all_contexts(&self) {
        for ctx in self.contexts.lock().iter() {
            let stats = ctx.stats_snapshot();
            debug!(
                owner = ?ctx.owner_thread,
                total = stats.total_mem_space,
                std_pages = stats.std_page_count,
                in_use = stats.std_page_in_use,
                extra_pages = stats.extra_page_count,
                "context summary"
            );
        }
    }

    /// Free-form dump of every context's summary, for callers that want text
    /// rather than log lines.
    pub fn dump_all(&self, w: &mut dyn std::io::Write) -> std::io::Result<()> {
        for ctx in self.contexts.lock().iter() {
            let stats = ctx.stats_snapshot();
            writeln!(
                w,
                "context {:?}: total={} std_pages={} in_use={} extra_pages={}",
                ctx.owner_thread,
                stats.total_mem_space,
                stats.std_page_count,
                stats.std_page_in_use,
                stats.extra_page_count
            )?;
        }
        Ok(())
    }

    pub(crate) fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    /// `BuddyLabelsSummary`: label -> live-count aggregated across every
    /// registered context.
    pub fn labels_summary(&self) -> Vec<(String, usize)> {
        let mut totals: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for ctx in self.contexts.lock().iter() {
            for (label, count) in ctx.label_counts() {
                *totals.entry(label).or_insert(0) += count;
            }
        }
        totals.into_iter().collect()
    }
}

pub(crate) static RUNTIME: Lazy<AllocatorRuntime> = Lazy::new(AllocatorRuntime::new);

thread_local! {
    static CURRENT: UnsafeCell<Option<Arc<OwnerContext>>> = const { UnsafeCell::new(None) };
}

/// Lazily create (on first use, or explicitly via `init`) the calling
/// thread's context. Mirrors the source's `pthread_once`-guarded TLS key:
/// `thread_local!` already gives each thread its own slot, initialized
/// exactly once.
pub(crate) fn get_current_context(config: Option<BuddyParameter>) -> Result<Arc<OwnerContext>> {
    CURRENT.with(|cell| {
        let slot = unsafe { &mut *cell.get() };
        if matches!(slot.as_ref(), Some(ctx) if ctx.is_torn_down()) {
            *slot = None;
        }
        match (slot.as_ref(), config) {
            (Some(_), Some(_)) => Err(AllocError::AlreadyInit),
            (Some(ctx), None) => Ok(Arc::clone(ctx)),
            (None, cfg) => {
                let config = cfg.unwrap_or_default();
                validate_config(&config)?;
                let std_size_k = crate::alloc::block::log2_ceil(config.page_size);
                let ctx = Arc::new(OwnerContext::new(config, std_size_k, thread::current().id()));
                RUNTIME.register(&ctx);
                unsafe {
                    let new_ctx = ctx.clone();
                    let inner = new_ctx.inner_mut();
                    let page = page::new_std_page(config.page_size, std_size_k, ctx.owner_thread)?;
                    inner.free_index.insert(page);
                    inner.stats.on_new_std_page(config.page_size);
                }
                *slot = Some(Arc::clone(&ctx));
                trace!("created new owner context");
                Ok(ctx)
            }
        }
    })
}

fn validate_config(config: &BuddyParameter) -> Result<()> {
    let min_page = crate::alloc::block::HEADER_SIZE + crate::alloc::config::MIN_FREE_PAYLOAD;
    if !config.page_size.is_power_of_two() || config.page_size <= min_page {
        return Err(AllocError::InvalidArgument(format!(
            "page_size {} must be a power of two greater than {}",
            config.page_size, min_page
        )));
    }
    Ok(())
}

pub(crate) fn current_context() -> Result<Arc<OwnerContext>> {
    CURRENT.with(|cell| {
        let slot = unsafe { &mut *cell.get() };
        if matches!(slot.as_ref(), Some(ctx) if ctx.is_torn_down()) {
            *slot = None;
        }
        slot.clone().ok_or(AllocError::NotInit)
    })
}

/// Drain `to_be_freed`, free each block via the normal local path, then
/// release every standard page back to the system allocator.
///
/// Returns `Ok(())` on a completed teardown, `Err(InUse)` if non-top-level
/// free blocks remain (some standard pages are still partially in use).
///
/// # Safety
/// May only observe/modify `ctx`'s owner-thread fields when called from
/// `ctx.owner_thread`, OR from a foreign thread draining `to_be_freed` while
/// already holding `ctx.foreign`'s lock (the only other legal caller).
pub(crate) fn try_cleanup(ctx: &Arc<OwnerContext>) -> Result<()> {
    {
        let mut guard = ctx.foreign.lock();
        let mut node = guard.to_be_freed;
        guard.to_be_freed = std::ptr::null_mut();
        while !node.is_null() {
            let next = unsafe { read_to_be_freed_next(node) };
            unsafe { free_local(ctx, node) };
            node = next;
        }
    }
    ctx.drain_foreign_extra_frees();

    let inner = unsafe { ctx.inner_mut() };
    let std_size_k = inner.std_size_k;
    let page_size = class_size(std_size_k);

    let mut pages_to_release = Vec::new();
    let mut cursor = inner.free_index.head(std_size_k);
    while !cursor.is_null() {
        let next = unsafe {
            let body = BlockHeader::free_body(cursor);
            (*body).next
        };
        let ok = unsafe {
            let h = &*cursor;
            match h.info {
                BlockInfo::Std { base_k, k } => {
                    (cursor as *const u8) == h.base_ptr && base_k == k && base_k == std_size_k
                }
                BlockInfo::Extra { .. } => false,
            }
        };
        if !ok {
            return Err(AllocError::Fault);
        }
        pages_to_release.push(cursor);
        cursor = next;
    }

    if inner.stats.std_page_in_use > 0 || pages_to_release.len() != inner.stats.std_page_count {
        let mut guard = ctx.foreign.lock();
        guard.destroy_pending = true;
        warn!("context destroy deferred: foreign or in-use blocks remain");
        return Err(AllocError::InUse);
    }

    for page in pages_to_release {
        unsafe {
            inner.free_index.remove(page);
            page::release_std_page(page, page_size);
        }
        inner.stats.on_release_std_page(page_size);
    }

    RUNTIME.unregister(ctx);
    ctx.torn_down.store(true, std::sync::atomic::Ordering::Release);
    if ctx.owner_thread == thread::current().id() {
        CURRENT.with(|cell| unsafe { *cell.get() = None });
    }
    debug!("owner context destroyed");
    Ok(())
}

unsafe fn read_to_be_freed_next(header: *mut BlockHeader) -> *mut BlockHeader {
    let body = BlockHeader::free_body(header);
    (*body).next
}

/// The "local free" path shared by a thread freeing its own block and by
/// `try_cleanup` draining foreign frees: mark FREE, merge, maybe GC.
///
/// # Safety
/// `header` must be a USED standard block owned by `ctx`.
pub(crate) unsafe fn free_local(ctx: &Arc<OwnerContext>, header: *mut BlockHeader) {
    let inner = ctx.inner_mut();
    let (block_size, user_size) = {
        let h = &*header;
        let k = h.k();
        let user_size = h.debug.as_ref().map(|d| d.user_size).unwrap_or(class_size(k) - crate::alloc::block::HEADER_SIZE);
        (class_size(k), user_size)
    };
    crate::alloc::block::set_free(header);
    let std_size_k = inner.std_size_k;
    let outcome = merge_on_free(&mut inner.free_index, header);
    let page_became_free = outcome.became_full_page;
    inner.stats.on_std_free(block_size, user_size, page_became_free);

    if page_became_free {
        garbage_std_pages(&mut inner.free_index, &mut inner.stats, &inner.config, outcome.block, std_size_k);
    } else {
        inner.free_index.insert(outcome.block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_then_destroy_allows_new_context() {
        let ctx1 = get_current_context(Some(BuddyParameter {
            page_size: 4096,
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(RUNTIME.context_count(), 1);
        unsafe {
            let inner = ctx1.inner_mut();
            assert_eq!(inner.stats.std_page_count, 1);
        }
        try_cleanup(&ctx1).unwrap();
        assert_eq!(RUNTIME.context_count(), 0);

        let ctx2 = get_current_context(Some(BuddyParameter {
            page_size: 4096,
            ..Default::default()
        }))
        .unwrap();
        assert!(!Arc::ptr_eq(&ctx1, &ctx2));
        try_cleanup(&ctx2).unwrap();
    }
}
