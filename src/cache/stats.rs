//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, and evictions.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Cache Stats ==
/// Lock-free performance counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sets: AtomicU64,
}

// == Stats Snapshot ==
/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Live entries in the cache; expired entries awaiting a sweep are excluded
    pub size: usize,
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (key not found or expired)
    pub misses: u64,
    /// Number of entries evicted by the capacity policy
    pub evictions: u64,
    /// Number of writes
    pub sets: u64,
    /// hits / (hits + misses), 0 when no requests were made
    pub hit_rate: f64,
    /// hits + misses
    pub total_requests: u64,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Record Hit ==
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    // == Record Miss ==
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    // == Record Eviction ==
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    // == Record Set ==
    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    // == Snapshot ==
    /// Reads every counter; `size` is supplied by the owner of the store.
    pub fn snapshot(&self, size: usize) -> StatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        StatsSnapshot {
            size,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            hit_rate: hit_rate(hits, misses),
            total_requests: hits + misses,
        }
    }

    // == Reset ==
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
    }
}

impl StatsSnapshot {
    /// Adds another snapshot's counters into this one and recomputes the rate.
    pub fn accumulate(&mut self, other: &StatsSnapshot) {
        self.size += other.size;
        self.hits += other.hits;
        self.misses += other.misses;
        self.evictions += other.evictions;
        self.sets += other.sets;
        self.total_requests = self.hits + self.misses;
        self.hit_rate = hit_rate(self.hits, self.misses);
    }
}

// == Hit Rate ==
/// Returns hits / (hits + misses), or 0.0 if no requests have been made.
fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let snapshot = CacheStats::new().snapshot(0);
        assert_eq!(snapshot, StatsSnapshot::default());
    }

    #[test]
    fn test_hit_rate_no_requests() {
        let stats = CacheStats::new();
        assert_eq!(stats.snapshot(0).hit_rate, 0.0);
    }

    #[test]
    fn test_hit_rate_all_hits() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        assert_eq!(stats.snapshot(0).hit_rate, 1.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_miss();

        let snapshot = stats.snapshot(1);
        assert_eq!(snapshot.hit_rate, 0.5);
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.size, 1);
    }

    #[test]
    fn test_record_eviction_and_set() {
        let stats = CacheStats::new();
        stats.record_eviction();
        stats.record_eviction();
        stats.record_set();

        let snapshot = stats.snapshot(0);
        assert_eq!(snapshot.evictions, 2);
        assert_eq!(snapshot.sets, 1);
    }

    #[test]
    fn test_reset() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_miss();
        stats.record_eviction();
        stats.reset();

        assert_eq!(stats.snapshot(3), StatsSnapshot {
            size: 3,
            ..StatsSnapshot::default()
        });
    }

    #[test]
    fn test_accumulate() {
        let mut total = StatsSnapshot::default();
        let a = CacheStats::new();
        a.record_hit();
        let b = CacheStats::new();
        b.record_miss();
        b.record_hit();

        total.accumulate(&a.snapshot(2));
        total.accumulate(&b.snapshot(5));

        assert_eq!(total.size, 7);
        assert_eq!(total.hits, 2);
        assert_eq!(total.total_requests, 3);
        assert!((total.hit_rate - 2.0 / 3.0).abs() < f64::EPSILON);
    }
}
