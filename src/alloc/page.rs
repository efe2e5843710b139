//! Standard-page lifecycle: creation, splitting, merging, GC (spec §4.B, §4.D).

use std::alloc::{alloc as sys_alloc, dealloc as sys_dealloc, Layout};
use std::thread::ThreadId;
use tracing::{debug, trace};

use crate::alloc::block::{
    buddy_addr, class_size, log2_ceil, set_free, BlockHeader, BlockInfo, HEADER_SIZE, MAGIC_FREE,
};
use crate::alloc::config::{BuddyParameter, MIN_FREE_PAYLOAD};
use crate::alloc::free_index::FreeIndex;
use crate::alloc::stats::BuddyStats;
use crate::error::{AllocError, Result};

/// Smallest size class that can hold `size` bytes of payload plus a header,
/// and still leaves room for a free-body if the block ever becomes free.
pub(crate) fn target_class(size: usize) -> u32 {
    let need = (size + HEADER_SIZE).max(HEADER_SIZE + MIN_FREE_PAYLOAD);
    log2_ceil(need)
}

/// Allocate a fresh standard page from the system allocator and install it
/// as a single root free block at size class `std_size_k`.
///
/// # Safety
/// The returned header has not been linked into any [`FreeIndex`] yet.
pub(crate) unsafe fn new_std_page(
    page_size: usize,
    std_size_k: u32,
    owner_thread: ThreadId,
) -> Result<*mut BlockHeader> {
    let layout = Layout::from_size_align(page_size, 16)
        .map_err(|e| AllocError::Malloc(e.to_string()))?;
    let base = sys_alloc(layout);
    if base.is_null() {
        return Err(AllocError::Malloc("system allocator returned null".into()));
    }
    let header = base as *mut BlockHeader;
    std::ptr::write(
        header,
        BlockHeader {
            base_ptr: base,
            magic: MAGIC_FREE,
            owner_thread,
            owner_context: None,
            info: BlockInfo::Std {
                base_k: std_size_k,
                k: std_size_k,
            },
            debug: None,
        },
    );
    trace!(page_size, std_size_k, "allocated new standard page");
    Ok(header)
}

/// Release a standard page (must be a root, fully-free block) back to the
/// system allocator.
///
/// # Safety
/// `header` must be a root block (`k == base_k`, `addr == base_ptr`) already
/// unlinked from the free index.
pub(crate) unsafe fn release_std_page(header: *mut BlockHeader, page_size: usize) {
    let base = (*header).base_ptr;
    std::ptr::drop_in_place(header);
    let layout = Layout::from_size_align(page_size, 16).expect("page layout");
    sys_dealloc(base, layout);
}

/// Split a free block of size class `k` down to `target`, inserting the
/// buddy siblings created along the way into `index`. Returns the (now
/// unlinked) block at size class `target`, still marked FREE — the caller
/// marks it USED.
///
/// # Safety
/// `block` must be a currently-unlinked FREE standard block with size class
/// `>= target`.
pub(crate) unsafe fn split(
    index: &mut FreeIndex,
    mut block: *mut BlockHeader,
    target: u32,
) -> *mut BlockHeader {
    loop {
        let (base_k, k) = match (*block).info {
            BlockInfo::Std { base_k, k } => (base_k, k),
            BlockInfo::Extra { .. } => unreachable!("split called on extra block"),
        };
        if k == target {
            return block;
        }
        let new_k = k - 1;
        let buddy_ptr = buddy_addr((*block).base_ptr, block as *mut u8, new_k);
        let buddy = buddy_ptr as *mut BlockHeader;

        (*block).info = BlockInfo::Std { base_k, k: new_k };
        std::ptr::write(
            buddy,
            BlockHeader {
                base_ptr: (*block).base_ptr,
                magic: MAGIC_FREE,
                owner_thread: (*block).owner_thread,
                owner_context: None,
                info: BlockInfo::Std { base_k, k: new_k },
                debug: None,
            },
        );
        index.insert(buddy);
        trace!(new_k, "split block, inserted buddy into free index");
    }
}

/// Outcome of the greedy merge-on-free loop.
pub(crate) struct MergeOutcome {
    /// The final merged (still-unlinked) block, ready to be inserted.
    pub block: *mut BlockHeader,
    /// True iff the merge produced a full, root-sized free page.
    pub became_full_page: bool,
}

/// Greedily merge `block` (just marked FREE) with its buddy, climbing size
/// classes until the buddy can't merge or the page root is reached.
///
/// # Safety
/// `block` must be marked FREE and not currently linked into `index`.
pub(crate) unsafe fn merge_on_free(index: &mut FreeIndex, mut block: *mut BlockHeader) -> MergeOutcome {
    loop {
        let (base_k, k) = match (*block).info {
            BlockInfo::Std { base_k, k } => (base_k, k),
            BlockInfo::Extra { .. } => unreachable!("merge called on extra block"),
        };
        if k == base_k {
            return MergeOutcome {
                block,
                became_full_page: true,
            };
        }
        let base_ptr = (*block).base_ptr;
        let buddy_ptr = buddy_addr(base_ptr, block as *mut u8, k) as *mut BlockHeader;

        let buddy_mergeable = {
            let b = &*buddy_ptr;
            b.magic == MAGIC_FREE
                && matches!(b.info, BlockInfo::Std { k: bk, .. } if bk == k)
        };
        if !buddy_mergeable {
            return MergeOutcome {
                block,
                became_full_page: false,
            };
        }

        index.remove(buddy_ptr);
        let lower = if (block as usize) < (buddy_ptr as usize) {
            block
        } else {
            buddy_ptr
        };
        set_free(lower);
        (*lower).info = BlockInfo::Std { base_k, k: k + 1 };
        block = lower;
    }
}

/// GC policy (spec §4.D): never reduce the page count below
/// `max(keep_minimum, keep_factor * pages_in_use)`. Releases `candidate`
/// (a just-merged, full free page) if above that floor.
///
/// # Safety
/// `candidate` must be a root block, currently linked at `mem_desc[std_size_k]`.
pub(crate) unsafe fn garbage_std_pages(
    index: &mut FreeIndex,
    stats: &mut BuddyStats,
    config: &BuddyParameter,
    candidate: *mut BlockHeader,
    std_size_k: u32,
) {
    if !config.free_areas {
        index.insert(candidate);
        return;
    }
    let floor = (config.keep_minimum as usize).max(config.keep_factor as usize * stats.std_page_in_use);
    if stats.std_page_count > floor {
        debug!(
            std_page_count = stats.std_page_count,
            floor, "releasing fully-free standard page to system allocator"
        );
        stats.on_release_std_page(class_size(std_size_k));
        release_std_page(candidate, class_size(std_size_k));
    } else {
        index.insert(candidate);
    }
}
