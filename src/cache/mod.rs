//! Cache Module
//!
//! Provides in-memory caching with TTL expiration, pluggable eviction and
//! single-flight fetches.

mod engine;
mod entry;
mod events;
mod fifo;
mod lru;
mod pattern;
mod policy;
mod stats;
mod store;


// Re-export public types
pub use engine::{Cache, CacheBuilder};
pub use entry::CacheEntry;
pub use events::{CacheEvent, CacheEventSink};
pub use fifo::FifoPolicy;
pub use lru::LruPolicy;
pub use pattern::KeyPattern;
pub use policy::{build_policy, EvictionPolicy};
pub use stats::{CacheStats, StatsSnapshot};
pub use store::Store;
