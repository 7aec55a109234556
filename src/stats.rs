//! Gauge/counter statistics the arena subsystem touches.
//!
//! Mirrors the subset of mimalloc's `_mi_stats_main` fields this
//! subsystem updates directly (`committed`, plus purge/arena-count
//! counters it is solely responsible for). Relaxed ordering throughout:
//! these are gauges an embedder samples for diagnostics, not values any
//! correctness property depends on.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering::Relaxed};

#[derive(Default)]
pub struct Stats {
    /// Bytes currently committed across all arenas. A gauge, not a
    /// running log: adjusted up and down as commit/purge state changes.
    committed_bytes: AtomicI64,
    /// Number of arenas ever registered (monotonic).
    arena_count: AtomicUsize,
    /// Bytes reclaimed by purges (monotonic).
    purged_bytes: AtomicUsize,
    /// Number of completed purge operations (monotonic).
    purge_count: AtomicUsize,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub fn committed_bytes(&self) -> i64 {
        self.committed_bytes.load(Relaxed)
    }

    pub fn add_committed(&self, bytes: i64) {
        self.committed_bytes.fetch_add(bytes, Relaxed);
    }

    pub fn sub_committed(&self, bytes: i64) {
        self.committed_bytes.fetch_sub(bytes, Relaxed);
    }

    pub fn arena_count(&self) -> usize {
        self.arena_count.load(Relaxed)
    }

    pub fn note_arena_registered(&self) {
        self.arena_count.fetch_add(1, Relaxed);
    }

    pub fn purged_bytes(&self) -> usize {
        self.purged_bytes.load(Relaxed)
    }

    pub fn purge_count(&self) -> usize {
        self.purge_count.load(Relaxed)
    }

    pub fn note_purge(&self, bytes: usize) {
        self.purged_bytes.fetch_add(bytes, Relaxed);
        self.purge_count.fetch_add(1, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_bytes_is_a_gauge() {
        let stats = Stats::new();
        stats.add_committed(100);
        stats.sub_committed(40);
        assert_eq!(stats.committed_bytes(), 60);
    }

    #[test]
    fn purge_counters_accumulate() {
        let stats = Stats::new();
        stats.note_purge(4096);
        stats.note_purge(8192);
        assert_eq!(stats.purge_count(), 2);
        assert_eq!(stats.purged_bytes(), 12288);
    }
}
