//! FIFO Policy Module
//!
//! Insertion-order eviction. Reads never reorder.

use std::collections::{HashMap, VecDeque};

use crate::cache::{EvictionPolicy, Store};
use crate::config::EvictionKind;

/// Queues this short are never compacted
const COMPACT_MIN_SLOTS: usize = 32;

// == FIFO Policy ==
/// Tracks insertion order only.
///
/// Each insert is stamped with a sequence number. Removal just forgets the
/// key; the queue slot is discarded lazily when it reaches the front, which
/// also covers keys that left the store without the policy being told.
#[derive(Debug, Default)]
pub struct FifoPolicy {
    seq: u64,
    /// (key, sequence at insertion), oldest first
    queue: VecDeque<(String, u64)>,
    /// Live key -> its current sequence
    live: HashMap<String, u64>,
}

impl FifoPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.live.contains_key(key)
    }

    fn is_current(&self, key: &str, seq: u64) -> bool {
        self.live.get(key) == Some(&seq)
    }

    /// Drops dead slots once they outnumber live keys, keeping the queue
    /// within twice the live size.
    fn compact(&mut self) {
        if self.queue.len() <= COMPACT_MIN_SLOTS || self.queue.len() <= 2 * self.live.len() {
            return;
        }
        let live = &self.live;
        self.queue.retain(|(key, seq)| live.get(key) == Some(seq));
    }
}

impl EvictionPolicy for FifoPolicy {
    fn kind(&self) -> EvictionKind {
        EvictionKind::Fifo
    }

    fn on_insert(&mut self, key: &str) {
        // An overwrite keeps its original position
        if self.live.contains_key(key) {
            return;
        }
        self.seq += 1;
        self.live.insert(key.to_string(), self.seq);
        self.queue.push_back((key.to_string(), self.seq));
        self.compact();
    }

    fn on_access(&mut self, _key: &str) {}

    fn on_remove(&mut self, key: &str) {
        if self.live.remove(key).is_some() {
            self.compact();
        }
    }

    fn should_evict(&mut self, store: &Store) -> Option<String> {
        while let Some((key, seq)) = self.queue.front() {
            if self.is_current(key, *seq) && store.contains(key) {
                return Some(key.clone());
            }
            let (key, seq) = self.queue.pop_front()?;
            if self.is_current(&key, seq) {
                self.live.remove(&key);
            }
        }
        None
    }

    fn order(&self) -> Vec<String> {
        self.queue
            .iter()
            .filter(|(key, seq)| self.is_current(key, *seq))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.live.clear();
    }
}
