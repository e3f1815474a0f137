//! Eviction Policy Module
//!
//! Chooses a victim key when a store grows past its capacity.

use std::fmt::Debug;

use crate::cache::{FifoPolicy, LruPolicy, Store};
use crate::config::EvictionKind;

// == Eviction Policy ==
/// Bookkeeping for victim selection.
///
/// The orchestrator calls the hooks while holding the store's write lock (or,
/// for `on_access`, its read lock), so implementations see a consistent
/// view of which keys exist.
pub trait EvictionPolicy: Send + Debug {
    /// Which variant this is.
    fn kind(&self) -> EvictionKind;

    /// A key was written (new or overwritten).
    fn on_insert(&mut self, key: &str);

    /// A key was read.
    fn on_access(&mut self, key: &str);

    /// A key left the store.
    fn on_remove(&mut self, key: &str);

    /// Returns the key to evict next, if any key is still present in `store`.
    fn should_evict(&mut self, store: &Store) -> Option<String>;

    /// Keys in eviction order, first victim first. Diagnostic only.
    fn order(&self) -> Vec<String>;

    /// Forget every key.
    fn clear(&mut self);
}

// == Factory ==
/// Builds an empty policy of the given kind.
pub fn build_policy(kind: EvictionKind) -> Box<dyn EvictionPolicy> {
    match kind {
        EvictionKind::Lru => Box::new(LruPolicy::new()),
        EvictionKind::Fifo => Box::new(FifoPolicy::new()),
    }
}
