//! LRU Policy Module
//!
//! Implements Least Recently Used tracking for cache eviction.

use std::collections::{BTreeMap, HashMap};

use crate::cache::{EvictionPolicy, Store};
use crate::config::EvictionKind;

// == LRU Policy ==
/// Tracks access order with a monotonically increasing logical clock.
///
/// Every read and write stamps the key with the next tick. The victim is the
/// key with the smallest tick that is still present in the store. Ticks are
/// unique, so the tick order is also the insertion order among equals.
#[derive(Debug, Default)]
pub struct LruPolicy {
    /// Logical clock
    clock: u64,
    /// Key -> last access tick
    ticks: HashMap<String, u64>,
    /// Tick -> key, oldest first
    by_tick: BTreeMap<u64, String>,
}

impl LruPolicy {
    // == Constructor ==
    /// Creates a new empty LRU policy.
    pub fn new() -> Self {
        Self::default()
    }

    // == Touch ==
    /// Marks a key as most recently used.
    pub fn touch(&mut self, key: &str) {
        self.clock += 1;
        if let Some(old) = self.ticks.insert(key.to_string(), self.clock) {
            self.by_tick.remove(&old);
        }
        self.by_tick.insert(self.clock, key.to_string());
    }

    // == Remove ==
    /// Removes a key from the tracker.
    pub fn remove(&mut self, key: &str) {
        if let Some(tick) = self.ticks.remove(key) {
            self.by_tick.remove(&tick);
        }
    }

    // == Peek Oldest ==
    /// Returns the least recently used key without removing it.
    pub fn peek_oldest(&self) -> Option<&String> {
        self.by_tick.values().next()
    }

    /// Last access tick of `key`.
    pub fn tick_of(&self, key: &str) -> Option<u64> {
        self.ticks.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.ticks.contains_key(key)
    }
}

impl EvictionPolicy for LruPolicy {
    fn kind(&self) -> EvictionKind {
        EvictionKind::Lru
    }

    fn on_insert(&mut self, key: &str) {
        self.touch(key);
    }

    fn on_access(&mut self, key: &str) {
        self.touch(key);
    }

    fn on_remove(&mut self, key: &str) {
        self.remove(key);
    }

    fn should_evict(&mut self, store: &Store) -> Option<String> {
        loop {
            let (tick, key) = self
                .by_tick
                .iter()
                .next()
                .map(|(tick, key)| (*tick, key.clone()))?;
            if store.contains(&key) {
                return Some(key);
            }
            // Removed behind our back; drop the stale bookkeeping
            self.by_tick.remove(&tick);
            self.ticks.remove(&key);
        }
    }

    fn order(&self) -> Vec<String> {
        self.by_tick.values().cloned().collect()
    }

    fn clear(&mut self) {
        self.ticks.clear();
        self.by_tick.clear();
    }
}
