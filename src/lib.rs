//! Mirror Cache - an in-memory cache and synchronization engine
//!
//! Keeps a local mirror of remote data with TTL expiration, LRU/FIFO
//! eviction, single-flight fetches, stale-while-revalidate reads, push-driven
//! reconciliation and optimistic mutations with rollback.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
mod lock;
pub mod mutation;
pub mod query;
pub mod registry;
pub mod sync;
pub mod tasks;
pub mod traits;

pub use cache::{Cache, CacheBuilder, CacheEvent, CacheEventSink, StatsSnapshot};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CacheConfig, CacheConfigUpdate, EvictionKind};
pub use error::{CacheError, Result};
pub use mutation::{MutationCoordinator, MutationIntent, MutationOptions, MutationState, MutationView};
pub use query::{Freshness, QueryExecutor, QueryOptions};
pub use registry::{CacheRegistry, GlobalStats};
pub use sync::{InMemoryPushChannel, PushEvent, PushOperation, Subscription, UpdateReconciler};
pub use traits::{Command, DataSource, PushChannel, PushHandler};
