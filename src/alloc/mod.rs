//! Public allocator facade (spec §4.D): `init`/`alloc`/`free`/`realloc`/
//! `calloc`/`strdup`/`check`/`destroy`, their `*_exit` and `*_autolabel`
//! variants, and the diagnostic dump/label-query APIs (spec §1.1).
//!
//! Every operation implicitly addresses the calling thread's owner context
//! (mirroring the source's `GetThreadContext()` call at the top of every
//! `Buddy*` function) rather than taking an explicit handle — this is a
//! per-thread allocator, not a general-purpose instantiable one.

pub mod block;
pub mod config;
pub mod context;
pub mod free_index;
pub mod page;
pub mod pool;
pub mod stats;

use std::ptr::NonNull;

use tracing::{debug, error, trace, warn};

use crate::alloc::block::{class_size, BlockHeader, BlockInfo, DebugInfo, MAGIC_FREE, MAGIC_USED};
use crate::alloc::context::{current_context, free_local, get_current_context, try_cleanup, PendingLabel, RUNTIME};
use crate::alloc::page::target_class;
use crate::error::{AllocError, Result};
use config::BuddyParameter;
pub use pool::{prefered_pool_count, ObjectPool};
pub use stats::BuddyStats;

/// Zero-sized facade: every method addresses the calling thread's implicit
/// owner context.
pub struct Allocator;

impl Allocator {
    /// `init(config?)` — spec §4.D.
    pub fn init(config: Option<BuddyParameter>) -> Result<()> {
        get_current_context(Some(config.unwrap_or_default())).map(|_| ())
    }

    /// Convenience: `init(None)` with defaults.
    pub fn init_default() -> Result<()> {
        Self::init(None)
    }

    pub fn alloc(size: usize) -> Result<Option<NonNull<u8>>> {
        if size == 0 {
            return Ok(None);
        }
        let ptr = do_alloc(size, None)?;
        Ok(Some(ptr))
    }

    /// Aborts the process instead of propagating `OutOfMemory`/`Malloc`.
    pub fn alloc_exit(size: usize) -> Option<NonNull<u8>> {
        match Self::alloc(size) {
            Ok(p) => p,
            Err(e @ (AllocError::OutOfMemory | AllocError::Malloc(_))) => {
                error!(error = %e, "alloc_exit: aborting process on allocation failure");
                std::process::abort();
            }
            Err(e) => {
                error!(error = %e, "alloc_exit: unexpected error");
                std::process::abort();
            }
        }
    }

    /// Stash a leak-tracking callsite for the *next* allocator call on this
    /// thread, then perform the call. Mirrors `BuddyMallocAutolabel` and kin.
    pub fn alloc_autolabel(size: usize, file: &'static str, func: &'static str, line: u32, label: Option<String>) -> Result<Option<NonNull<u8>>> {
        stash_label(file, func, line, label)?;
        Self::alloc(size)
    }

    pub fn free(ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };
        if let Err(e) = do_free(ptr) {
            error!(error = %e, "free failed");
        }
    }

    pub fn realloc(ptr: Option<NonNull<u8>>, size: usize) -> Result<Option<NonNull<u8>>> {
        let Some(ptr) = ptr else {
            return Self::alloc(size);
        };
        if size == 0 {
            Self::free(Some(ptr));
            return Ok(None);
        }
        unsafe {
            let header = BlockHeader::from_user_ptr(ptr);
            if (*header).magic != MAGIC_USED {
                return Err(AllocError::InvalidArgument("realloc of non-USED block".into()));
            }
            let old_user_size = user_payload_size(header);
            let new_ptr = do_alloc(size, None)?;
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_user_size.min(size));
            do_free(ptr)?;
            Ok(Some(new_ptr))
        }
    }

    pub fn calloc(n: usize, elem: usize) -> Result<Option<NonNull<u8>>> {
        let total = n.checked_mul(elem).ok_or_else(|| AllocError::InvalidArgument("calloc size overflow".into()))?;
        let ptr = Self::alloc(total)?;
        if let Some(p) = ptr {
            unsafe { std::ptr::write_bytes(p.as_ptr(), 0, total) };
        }
        Ok(ptr)
    }

    pub fn strdup(s: &str) -> Result<Option<NonNull<u8>>> {
        let bytes = s.as_bytes();
        let ptr = Self::alloc(bytes.len() + 1)?;
        if let Some(p) = ptr {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), p.as_ptr(), bytes.len());
                *p.as_ptr().add(bytes.len()) = 0;
            }
        }
        Ok(ptr)
    }

    /// `check(p, allow_other_thread)` — spec §4.D.
    pub fn check(ptr: NonNull<u8>, allow_other_thread: bool) -> bool {
        unsafe {
            let header = BlockHeader::from_user_ptr(ptr);
            let h = &*header;
            if h.magic != MAGIC_USED {
                return false;
            }
            let sane = match h.info {
                BlockInfo::Std { base_k, .. } => {
                    let start = h.base_ptr as usize;
                    let end = start + class_size(base_k);
                    let addr = header as usize;
                    addr >= start && addr < end
                }
                BlockInfo::Extra { .. } => true,
            };
            if !sane {
                return false;
            }
            allow_other_thread || h.owner_thread == std::thread::current().id()
        }
    }

    /// `destroy()` — spec §4.D.
    pub fn destroy() -> Result<()> {
        let ctx = current_context()?;
        try_cleanup(&ctx)
    }

    pub fn prefered_pool_count(min_count: usize, type_size: usize) -> usize {
        pool::prefered_pool_count(min_count, type_size)
    }

    /// `BuddyCountDebugLabel` — count live blocks on this thread tagged with `label`.
    pub fn count_label(label: &str) -> Result<usize> {
        let ctx = current_context()?;
        unsafe {
            let inner = ctx.inner_mut();
            let mut count = 0;
            let mut cursor = inner.allocated_list;
            while !cursor.is_null() {
                if let Some(d) = &(*cursor).debug {
                    if d.label.as_deref() == Some(label) {
                        count += 1;
                    }
                }
                cursor = (*cursor).debug.as_ref().map(|d| d.next_allocated).unwrap_or(std::ptr::null_mut());
            }
            Ok(count)
        }
    }

    /// `BuddyGetDebugLabel` — the label attached to a live block, if any.
    pub fn debug_label(ptr: NonNull<u8>) -> Option<String> {
        unsafe {
            let header = BlockHeader::from_user_ptr(ptr);
            (*header).debug.as_ref().and_then(|d| d.label.clone())
        }
    }

    /// `BuddyDumpMem` — pretty-print this thread's context summary.
    pub fn dump_memory_map(w: &mut dyn std::io::Write) -> std::io::Result<()> {
        let ctx = match current_context() {
            Ok(c) => c,
            Err(_) => return writeln!(w, "<no context on this thread>"),
        };
        let s = ctx.stats_snapshot();
        writeln!(
            w,
            "total={} std_pages={} in_use={} extra_pages={} client_visible={}",
            s.total_mem_space, s.std_page_count, s.std_page_in_use, s.extra_page_count, s.client_visible_space
        )
    }

    /// Current thread's stats snapshot.
    pub fn stats() -> Result<BuddyStats> {
        Ok(current_context()?.stats_snapshot())
    }
}

/// `BuddyLabelsSummary` — label -> live-count across every registered context.
pub fn labels_summary() -> Vec<(String, usize)> {
    RUNTIME.labels_summary()
}

/// `DisplayMemoryMap`/`BuddyDumpAll` over every registered context.
pub fn dump_all(w: &mut dyn std::io::Write) -> std::io::Result<()> {
    RUNTIME.dump_all(w)
}

pub fn log_all_contexts() {
    RUNTIME.log_all_contexts();
}

fn stash_label(file: &'static str, func: &'static str, line: u32, label: Option<String>) -> Result<()> {
    let ctx = get_current_context(None).or_else(|_| get_current_context(Some(BuddyParameter::default())))?;
    unsafe {
        ctx.inner_mut().pending_label = Some(PendingLabel { file, func, line, label });
    }
    Ok(())
}

unsafe fn user_payload_size(header: *mut BlockHeader) -> usize {
    let h = &*header;
    match h.debug {
        Some(ref d) => d.user_size,
        None => match h.info {
            BlockInfo::Std { k, .. } => class_size(k) - crate::alloc::block::HEADER_SIZE,
            BlockInfo::Extra { size } => size - crate::alloc::block::HEADER_SIZE,
        },
    }
}

/// Shared core of `alloc`: drain foreign frees, pick a standard block or go
/// to the extra path, split, mark USED, stamp owner/label, update stats.
fn do_alloc(size: usize, _hint: Option<()>) -> Result<NonNull<u8>> {
    let ctx = get_current_context(None).or_else(|_| get_current_context(Some(BuddyParameter::default())))?;
    drain_foreign_frees(&ctx)?;

    let inner = unsafe { ctx.inner_mut() };
    let target = target_class(size);
    let std_size_k = inner.std_size_k;
    let pending_label = inner.pending_label.take();

    if target > std_size_k {
        if !inner.config.extra_alloc {
            ctx.set_last_error(AllocError::OutOfMemory);
            return Err(AllocError::OutOfMemory);
        }
        return alloc_extra(&ctx, size, pending_label);
    }

    let found_k = inner.free_index.smallest_available(target, std_size_k);
    let free_block = match found_k {
        Some(k) => unsafe { inner.free_index.pop(k) },
        None => {
            if !inner.config.on_demand_alloc {
                ctx.set_last_error(AllocError::OutOfMemory);
                return Err(AllocError::OutOfMemory);
            }
            let page = unsafe { page::new_std_page(inner.config.page_size, std_size_k, ctx.owner_thread)? };
            inner.stats.on_new_std_page(inner.config.page_size);
            page
        }
    };

    let used = unsafe { page::split(&mut inner.free_index, free_block, target) };
    unsafe {
        block::set_used(used);
        let became_in_use_page = block::is_root_block(used);
        (*used).owner_context = Some(ctx.clone());
        (*used).owner_thread = ctx.owner_thread;
        (*used).debug = pending_label.map(|p| {
            Box::new(DebugInfo {
                file: p.file,
                func: p.func,
                line: p.line,
                label: p.label,
                next_allocated: inner.allocated_list,
                pool_slab: None,
                user_size: size,
            })
        });
        if (*used).debug.is_some() {
            inner.allocated_list = used;
        }
        inner.stats.on_std_alloc(class_size(target), size, became_in_use_page);
        trace!(size, target_class = target, "standard allocation");
        Ok(BlockHeader::user_ptr(used))
    }
}

fn alloc_extra(ctx: &std::sync::Arc<context::OwnerContext>, size: usize, label: Option<PendingLabel>) -> Result<NonNull<u8>> {
    use std::alloc::{alloc as sys_alloc, Layout};
    let total = size + crate::alloc::block::HEADER_SIZE;
    let layout = Layout::from_size_align(total, 16).map_err(|e| AllocError::Malloc(e.to_string()))?;
    let base = unsafe { sys_alloc(layout) };
    if base.is_null() {
        ctx.set_last_error(AllocError::Malloc("system allocator returned null".into()));
        return Err(AllocError::Malloc("system allocator returned null".into()));
    }
    let header = base as *mut BlockHeader;
    let inner = unsafe { ctx.inner_mut() };
    unsafe {
        std::ptr::write(
            header,
            BlockHeader {
                base_ptr: std::ptr::null_mut(),
                magic: MAGIC_USED,
                owner_thread: ctx.owner_thread,
                owner_context: Some(ctx.clone()),
                info: BlockInfo::Extra { size: total },
                debug: label.map(|p| {
                    Box::new(DebugInfo {
                        file: p.file,
                        func: p.func,
                        line: p.line,
                        label: p.label,
                        next_allocated: inner.allocated_list,
                        pool_slab: None,
                        user_size: size,
                    })
                }),
            },
        );
        if (*header).debug.is_some() {
            inner.allocated_list = header;
        }
    }
    inner.stats.on_extra_alloc(total, size);
    debug!(size, "extra allocation");
    Ok(unsafe { BlockHeader::user_ptr(header) })
}

fn do_free(ptr: NonNull<u8>) -> Result<()> {
    unsafe {
        let header = BlockHeader::from_user_ptr(ptr);
        let h = &*header;
        match h.magic {
            MAGIC_FREE => {
                warn!("double free detected; ignoring");
                return Ok(());
            }
            MAGIC_USED => {}
            other => {
                error!(magic = other, "free of corrupted or unknown block");
                return Err(AllocError::Fault);
            }
        }

        if let BlockInfo::Extra { size: total } = h.info {
            let owner = h.owner_context.clone();
            let user_size = h.debug.as_ref().map(|d| d.user_size).unwrap_or(total - crate::alloc::block::HEADER_SIZE);
            if let Some(ref owner_ctx) = owner {
                if owner_ctx.owner_thread == std::thread::current().id() {
                    let inner = owner_ctx.inner_mut();
                    inner.stats.on_extra_free(total, user_size);
                } else {
                    // The block itself is released below regardless of which
                    // thread frees it; only the owner-thread-only stats
                    // bookkeeping needs to wait for the owner to drain it.
                    owner_ctx.push_foreign_extra_free(total, user_size);
                }
            }
            block::set_free(header);
            std::ptr::drop_in_place(header);
            let layout = std::alloc::Layout::from_size_align(total, 16).expect("extra layout");
            std::alloc::dealloc(ptr.as_ptr().sub(crate::alloc::block::HEADER_SIZE), layout);
            return Ok(());
        }

        let owner = h.owner_context.clone().ok_or(AllocError::Fault)?;
        if h.owner_thread != std::thread::current().id() {
            trace!("cross-thread free, deferring to owner's to_be_freed list");
            owner.push_foreign_free(header);
            return Ok(());
        }

        free_local(&owner, header);
        Ok(())
    }
}

fn drain_foreign_frees(ctx: &std::sync::Arc<context::OwnerContext>) -> Result<()> {
    let mut node = {
        let mut guard = ctx.foreign.lock();
        std::mem::replace(&mut guard.to_be_freed, std::ptr::null_mut())
    };
    while !node.is_null() {
        let next = unsafe {
            let body = BlockHeader::free_body(node);
            (*body).next
        };
        unsafe { free_local(ctx, node) };
        node = next;
    }
    ctx.drain_foreign_extra_frees();
    Ok(())
}

/// Used by [`pool`] to carve slabs through the normal allocation path.
pub(crate) fn raw_alloc(size: usize) -> Result<NonNull<u8>> {
    do_alloc(size, None)
}

/// Used by [`pool`] to release slabs through the normal free path.
pub(crate) fn raw_free(ptr: NonNull<u8>) -> Result<()> {
    do_free(ptr)
}
