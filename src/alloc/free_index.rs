//! Per-owner free-block index (spec §4.A).
//!
//! `mem_desc[k]` is the head of a doubly-linked list of FREE blocks of size
//! class `k`. All operations assume the caller already holds whatever
//! exclusivity the owning context provides (in practice: "runs on the owner
//! thread"), so no locking happens here.

use tracing::warn;

use crate::alloc::block::{BlockHeader, FreeBody, MAGIC_FREE, MAX_LOG2};

pub(crate) const NUM_CLASSES: usize = (MAX_LOG2 + 1) as usize;

pub(crate) struct FreeIndex {
    mem_desc: [*mut BlockHeader; NUM_CLASSES],
}

impl FreeIndex {
    pub(crate) fn new() -> Self {
        Self {
            mem_desc: [std::ptr::null_mut(); NUM_CLASSES],
        }
    }

    pub(crate) fn head(&self, k: u32) -> *mut BlockHeader {
        self.mem_desc[k as usize]
    }

    /// Prepend `block` (already marked FREE) to the list for its size class.
    ///
    /// # Safety
    /// `block` must point to a valid, FREE `BlockHeader` with the correct `k`.
    pub(crate) unsafe fn insert(&mut self, block: *mut BlockHeader) {
        let k = (*block).k();
        let old_head = self.mem_desc[k as usize];
        let body = BlockHeader::free_body(block);
        (*body).prev = std::ptr::null_mut();
        (*body).next = old_head;
        if !old_head.is_null() {
            if (*old_head).magic != MAGIC_FREE {
                warn!(size_class = k, "free-index neighbor has bad magic on insert");
            }
            let old_body = BlockHeader::free_body(old_head);
            (*old_body).prev = block;
        }
        self.mem_desc[k as usize] = block;
    }

    /// Unlink `block` from its size class's list.
    ///
    /// # Safety
    /// `block` must currently be linked into `mem_desc[block.k()]`.
    pub(crate) unsafe fn remove(&mut self, block: *mut BlockHeader) {
        let k = (*block).k();
        if (*block).magic != MAGIC_FREE {
            warn!(size_class = k, "removing block with bad magic from free index");
        }
        let body = BlockHeader::free_body(block);
        let (prev, next) = ((*body).prev, (*body).next);

        if !prev.is_null() {
            if (*prev).magic != MAGIC_FREE {
                warn!(size_class = k, "free-index prev neighbor has bad magic on remove");
            }
            (*BlockHeader::free_body(prev)).next = next;
        } else {
            self.mem_desc[k as usize] = next;
        }
        if !next.is_null() {
            if (*next).magic != MAGIC_FREE {
                warn!(size_class = k, "free-index next neighbor has bad magic on remove");
            }
            (*BlockHeader::free_body(next)).prev = prev;
        }
    }

    /// Pop the first block at exactly size class `k`, or null.
    ///
    /// # Safety
    /// Caller must treat the popped pointer as unlinked and still FREE.
    pub(crate) unsafe fn pop(&mut self, k: u32) -> *mut BlockHeader {
        let head = self.mem_desc[k as usize];
        if head.is_null() {
            return head;
        }
        self.remove(head);
        head
    }

    /// Smallest size class `>= k` with a non-empty list, searching up to and
    /// including `max_k` (the standard page size class).
    pub(crate) fn smallest_available(&self, k: u32, max_k: u32) -> Option<u32> {
        (k..=max_k).find(|&c| !self.mem_desc[c as usize].is_null())
    }
}

unsafe impl Send for FreeIndex {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::block::BlockInfo;
    use std::alloc::{alloc, Layout};

    unsafe fn raw_std_block(k: u32, base_k: u32) -> *mut BlockHeader {
        let size = 1usize << base_k;
        let layout = Layout::from_size_align(size, 16).unwrap();
        let base = alloc(layout);
        let header = base as *mut BlockHeader;
        std::ptr::write(
            header,
            BlockHeader {
                base_ptr: base,
                magic: MAGIC_FREE,
                owner_thread: std::thread::current().id(),
                owner_context: None,
                info: BlockInfo::Std { base_k, k },
                debug: None,
            },
        );
        header
    }

    #[test]
    fn insert_then_pop_same_block() {
        let mut idx = FreeIndex::new();
        unsafe {
            let b = raw_std_block(10, 10);
            idx.insert(b);
            assert_eq!(idx.head(10), b);
            let popped = idx.pop(10);
            assert_eq!(popped, b);
            assert!(idx.head(10).is_null());
        }
    }

    #[test]
    fn smallest_available_skips_empty_classes() {
        let mut idx = FreeIndex::new();
        unsafe {
            let b = raw_std_block(12, 12);
            idx.insert(b);
        }
        assert_eq!(idx.smallest_available(5, 12), Some(12));
        assert_eq!(idx.smallest_available(13, 20), None);
    }
}
