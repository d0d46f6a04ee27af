//! Per-handle operation counters. The original engine kept these as global
//! mutable counters (`count1`, `count2`, `max_key_len`, `block_count_*` in
//! `btree_handler`); here they are plain fields on the handle struct instead,
//! updated as the b-tree and cache do their work and logged (never printed)
//! at close.

use log::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub puts: u64,
    pub updates: u64,
    pub gets: u64,
    pub splits_leaf: u64,
    pub splits_interior: u64,
    pub root_growths: u64,
    pub overflow_pages_allocated: u64,
    pub max_key_len: usize,
}

impl Stats {
    pub fn note_key_len(&mut self, len: usize) {
        if len > self.max_key_len {
            self.max_key_len = len;
        }
    }

    /// Emits a summary line at `debug` level; called from `Handle::close`
    /// alongside the cache's own request/miss counters.
    pub fn log_summary(&self, cache_requests: u64, cache_misses: u64) {
        debug!(
            "handle stats: puts={} updates={} gets={} splits(leaf={} interior={}) \
             root_growths={} overflow_pages={} max_key_len={} cache(requests={} misses={})",
            self.puts,
            self.updates,
            self.gets,
            self.splits_leaf,
            self.splits_interior,
            self.root_growths,
            self.overflow_pages_allocated,
            self.max_key_len,
            cache_requests,
            cache_misses,
        );
    }
}
