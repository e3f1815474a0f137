//! Cache Store Module
//!
//! Key/value map with per-entry TTL and lazy expiration. Knows nothing about
//! eviction or statistics; the orchestrator layers those on top.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::cache::CacheEntry;

// == Store ==
/// Raw entry storage.
#[derive(Debug, Default)]
pub struct Store {
    entries: HashMap<String, CacheEntry>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // == Get ==
    /// Returns the live entry for `key`; expired entries are treated as absent.
    pub fn get(&self, key: &str, now: u64) -> Option<&CacheEntry> {
        self.entries.get(key).filter(|entry| !entry.is_expired(now))
    }

    /// Mutable access to a live entry.
    pub fn get_mut(&mut self, key: &str, now: u64) -> Option<&mut CacheEntry> {
        self.entries
            .get_mut(key)
            .filter(|entry| !entry.is_expired(now))
    }

    // == Set ==
    /// Stores a value, always overwriting and refreshing its timestamps.
    ///
    /// Returns true if the key was not present before.
    pub fn set(&mut self, key: String, value: Value, ttl: Duration, now: u64) -> bool {
        let entry = CacheEntry::new(key.clone(), value, ttl, now);
        self.entries.insert(key, entry).is_none()
    }

    /// Puts a previously captured entry back unchanged.
    ///
    /// Returns true if the key was not present before.
    pub fn restore(&mut self, entry: CacheEntry) -> bool {
        self.entries.insert(entry.key.clone(), entry).is_none()
    }

    // == Delete ==
    /// Removes an entry, returning it if it existed (expired or not).
    pub fn delete(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    // == Remove If Expired ==
    /// Removes `key` only if it is present and expired.
    pub fn remove_if_expired(&mut self, key: &str, now: u64) -> bool {
        let expired = self
            .entries
            .get(key)
            .map(|entry| entry.is_expired(now))
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
        }
        expired
    }

    // == Has ==
    pub fn has(&self, key: &str, now: u64) -> bool {
        self.get(key, now).is_some()
    }

    /// True if the key is physically stored, expired or not.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    // == Take Expired ==
    /// Removes every expired entry and returns their keys.
    pub fn take_expired(&mut self, now: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    // == Keys ==
    /// All stored keys, including ones that expired but were not yet swept.
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    // == Size ==
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Entries still live at `now`.
    pub fn live_count(&self, now: u64) -> usize {
        self.entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
