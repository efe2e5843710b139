//! Per-context memory statistics (spec §3).

/// Mirrors the original `buddy_stats_t`: current and high-water totals, plus
/// the standard/extra page breakdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuddyStats {
    pub total_mem_space: usize,
    pub total_mem_space_hw: usize,
    pub std_used_space: usize,
    pub extra_used_space: usize,
    pub client_visible_space: usize,
    pub std_page_count: usize,
    pub std_page_in_use: usize,
    pub extra_page_count: usize,
    pub extra_page_min: usize,
    pub extra_page_max: usize,
}

impl BuddyStats {
    fn bump_hw(&mut self) {
        if self.total_mem_space > self.total_mem_space_hw {
            self.total_mem_space_hw = self.total_mem_space;
        }
    }

    pub(crate) fn on_new_std_page(&mut self, page_size: usize) {
        self.total_mem_space += page_size;
        self.std_page_count += 1;
        self.bump_hw();
    }

    pub(crate) fn on_release_std_page(&mut self, page_size: usize) {
        self.total_mem_space -= page_size;
        self.std_page_count -= 1;
    }

    pub(crate) fn on_std_alloc(&mut self, block_size: usize, user_size: usize, became_in_use_page: bool) {
        self.std_used_space += block_size;
        self.client_visible_space += user_size;
        if became_in_use_page {
            self.std_page_in_use += 1;
        }
        self.bump_hw();
    }

    pub(crate) fn on_std_free(&mut self, block_size: usize, user_size: usize, became_free_page: bool) {
        self.std_used_space -= block_size;
        self.client_visible_space -= user_size;
        if became_free_page {
            self.std_page_in_use -= 1;
        }
    }

    pub(crate) fn on_extra_alloc(&mut self, total_size: usize, user_size: usize) {
        self.total_mem_space += total_size;
        self.extra_used_space += total_size;
        self.client_visible_space += user_size;
        self.extra_page_count += 1;
        if self.extra_page_min == 0 || total_size < self.extra_page_min {
            self.extra_page_min = total_size;
        }
        if total_size > self.extra_page_max {
            self.extra_page_max = total_size;
        }
        self.bump_hw();
    }

    pub(crate) fn on_extra_free(&mut self, total_size: usize, user_size: usize) {
        self.total_mem_space -= total_size;
        self.extra_used_space -= total_size;
        self.client_visible_space -= user_size;
        self.extra_page_count -= 1;
    }

    /// Bytes currently handed to callers, regardless of pool/extra classification.
    pub fn in_use(&self) -> usize {
        self.client_visible_space
    }
}
