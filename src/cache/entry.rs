//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with TTL support.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
///
/// Access bookkeeping is atomic so readers holding a shared lock can record it.
#[derive(Debug)]
pub struct CacheEntry {
    /// The key this entry is stored under
    pub key: String,
    /// The stored value
    pub value: Value,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Time to live in milliseconds
    pub ttl_ms: u64,
    /// Expiration timestamp (Unix milliseconds), `created_at + ttl_ms`
    pub expires_at: u64,
    access_count: AtomicU64,
    last_accessed_at: AtomicU64,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new cache entry.
    ///
    /// # Arguments
    /// * `key` - The key the entry lives under
    /// * `value` - The value to store
    /// * `ttl` - Time to live
    /// * `now` - Current time in Unix milliseconds
    pub fn new(key: impl Into<String>, value: Value, ttl: Duration, now: u64) -> Self {
        let ttl_ms = ttl.as_millis() as u64;
        Self {
            key: key.into(),
            value,
            created_at: now,
            ttl_ms,
            expires_at: now.saturating_add(ttl_ms),
            access_count: AtomicU64::new(0),
            last_accessed_at: AtomicU64::new(now),
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// Boundary condition: an entry is expired once `now >= expires_at`.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    // == Age ==
    /// Milliseconds since the entry was written.
    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    // == Time To Live ==
    /// Returns remaining TTL in milliseconds, 0 once expired.
    pub fn ttl_remaining_ms(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    // == Access Bookkeeping ==
    /// Records a read of this entry.
    pub fn record_access(&self, now: u64) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_accessed_at.fetch_max(now, Ordering::Relaxed);
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn last_accessed_at(&self) -> u64 {
        self.last_accessed_at.load(Ordering::Relaxed)
    }
}

impl Clone for CacheEntry {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            created_at: self.created_at,
            ttl_ms: self.ttl_ms,
            expires_at: self.expires_at,
            access_count: AtomicU64::new(self.access_count()),
            last_accessed_at: AtomicU64::new(self.last_accessed_at()),
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_creation() {
        let entry = CacheEntry::new("k", json!("v"), Duration::from_secs(60), 1_000);

        assert_eq!(entry.value, json!("v"));
        assert_eq!(entry.created_at, 1_000);
        assert_eq!(entry.expires_at, 61_000);
        assert!(!entry.is_expired(1_000));
    }

    #[test]
    fn test_expiration_boundary_condition() {
        let entry = CacheEntry::new("k", json!(1), Duration::from_millis(500), 1_000);

        assert!(!entry.is_expired(1_499));
        assert!(entry.is_expired(1_500), "Entry should be expired at boundary");
    }

    #[test]
    fn test_ttl_remaining() {
        let entry = CacheEntry::new("k", json!(1), Duration::from_secs(10), 0);

        assert_eq!(entry.ttl_remaining_ms(4_000), 6_000);
        assert_eq!(entry.ttl_remaining_ms(20_000), 0);
    }

    #[test]
    fn test_record_access() {
        let entry = CacheEntry::new("k", json!(1), Duration::from_secs(10), 0);
        entry.record_access(5);
        entry.record_access(3);

        assert_eq!(entry.access_count(), 2);
        assert_eq!(entry.last_accessed_at(), 5);

        let copy = entry.clone();
        assert_eq!(copy.access_count(), 2);
    }
}
