//! Cache diagnostic events.
//!
//! An optional sink receives a notification whenever an entry leaves a cache.
//! Sink failures are logged and counted; they never change cache state.

use serde::Serialize;

// == Cache Event ==
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    /// Removed by the capacity policy
    Evicted { cache: String, key: String },
    /// Removed because its TTL elapsed
    Expired { cache: String, key: String },
    /// Removed by an explicit invalidation
    Invalidated { cache: String, key: String },
}

impl CacheEvent {
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::Evicted { key, .. }
            | CacheEvent::Expired { key, .. }
            | CacheEvent::Invalidated { key, .. } => key,
        }
    }
}

// == Event Sink ==
/// Observer for cache events.
pub trait CacheEventSink: Send + Sync {
    fn notify(&self, event: &CacheEvent) -> anyhow::Result<()>;
}

impl<F> CacheEventSink for F
where
    F: Fn(&CacheEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(&self, event: &CacheEvent) -> anyhow::Result<()> {
        self(event)
    }
}
