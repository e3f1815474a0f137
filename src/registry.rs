//! Cache Registry
//!
//! Owns one named cache per feature domain. Each cache is built lazily from
//! the global defaults with the feature's overrides merged on top.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{Cache, CacheEventSink, StatsSnapshot};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{CacheConfig, CacheConfigUpdate, EvictionKind};
use crate::error::Result;
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "registry";

/// Feed items, newest first.
pub const FEATURE_FEED: &str = "feed";
/// Chat threads and messages.
pub const FEATURE_CHAT: &str = "chat";
/// Notification lists.
pub const FEATURE_NOTIFICATIONS: &str = "notifications";
/// Profile and user records.
pub const FEATURE_PROFILE: &str = "profile";

// == Global Stats ==
/// Statistics for every registered cache plus their sum.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStats {
    pub caches: BTreeMap<String, StatsSnapshot>,
    pub totals: StatsSnapshot,
}

// == Registry ==
pub struct CacheRegistry {
    defaults: CacheConfig,
    overrides: RwLock<HashMap<String, CacheConfigUpdate>>,
    caches: RwLock<HashMap<String, Cache>>,
    clock: SharedClock,
    sink: Option<Arc<dyn CacheEventSink>>,
}

impl CacheRegistry {
    /// Creates an empty registry; every cache starts from `defaults`.
    pub fn new(defaults: CacheConfig) -> Result<Self> {
        defaults.validate()?;
        Ok(Self {
            defaults,
            overrides: RwLock::new(HashMap::new()),
            caches: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            sink: None,
        })
    }

    /// Creates a registry with tuned overrides for the standard features.
    ///
    /// - `feed`: 500 entries, 5 minutes, LRU
    /// - `chat`: 200 entries, 10 minutes, LRU
    /// - `notifications`: 100 entries, 2 minutes, FIFO
    /// - `profile`: 300 entries, 15 minutes, LRU
    pub fn with_feature_defaults(defaults: CacheConfig) -> Result<Self> {
        let registry = Self::new(defaults)?;
        registry.register_feature(
            FEATURE_FEED,
            CacheConfigUpdate::new()
                .max_size(500)
                .default_ttl(Duration::from_secs(5 * 60)),
        )?;
        registry.register_feature(
            FEATURE_CHAT,
            CacheConfigUpdate::new()
                .max_size(200)
                .default_ttl(Duration::from_secs(10 * 60)),
        )?;
        registry.register_feature(
            FEATURE_NOTIFICATIONS,
            CacheConfigUpdate::new()
                .max_size(100)
                .default_ttl(Duration::from_secs(2 * 60))
                .eviction_policy(EvictionKind::Fifo),
        )?;
        registry.register_feature(
            FEATURE_PROFILE,
            CacheConfigUpdate::new()
                .max_size(300)
                .default_ttl(Duration::from_secs(15 * 60)),
        )?;
        Ok(registry)
    }

    /// Uses `clock` for every cache created from now on.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Attaches `sink` to every cache created from now on.
    pub fn with_event_sink(mut self, sink: Arc<dyn CacheEventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn defaults(&self) -> &CacheConfig {
        &self.defaults
    }

    // == Register Feature ==
    /// Records config overrides for `feature`.
    ///
    /// If the feature's cache already exists the overrides are applied to it
    /// directly; an invalid merge is rejected and nothing changes.
    pub fn register_feature(&self, feature: &str, overrides: CacheConfigUpdate) -> Result<()> {
        self.defaults.merged(&overrides).validate()?;

        if let Some(cache) = rw_read(&self.caches, SOURCE, "register_feature").get(feature) {
            cache.update_config(overrides.clone())?;
        }
        rw_write(&self.overrides, SOURCE, "register_feature").insert(feature.to_string(), overrides);
        Ok(())
    }

    /// Config a cache for `feature` would be built with.
    pub fn feature_config(&self, feature: &str) -> CacheConfig {
        match rw_read(&self.overrides, SOURCE, "feature_config").get(feature) {
            Some(overrides) => self.defaults.merged(overrides),
            None => self.defaults.clone(),
        }
    }

    // == Get Cache ==
    /// Returns the cache for `feature`, building it on first use.
    pub fn get_cache(&self, feature: &str) -> Result<Cache> {
        if let Some(cache) = rw_read(&self.caches, SOURCE, "get_cache").get(feature) {
            return Ok(cache.clone());
        }

        let mut caches = rw_write(&self.caches, SOURCE, "get_cache");
        // Another caller may have built it between the two locks
        if let Some(cache) = caches.get(feature) {
            return Ok(cache.clone());
        }

        let config = self.feature_config(feature);
        let mut builder = Cache::builder()
            .name(feature)
            .config(config.clone())
            .clock(self.clock.clone());
        if let Some(sink) = &self.sink {
            builder = builder.event_sink(sink.clone());
        }
        let cache = builder.build()?;

        info!(
            feature,
            max_size = config.max_size,
            default_ttl_ms = config.default_ttl.as_millis() as u64,
            eviction_policy = %config.eviction_policy,
            "Created feature cache"
        );
        caches.insert(feature.to_string(), cache.clone());
        Ok(cache)
    }

    /// Names of caches built so far, sorted.
    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = rw_read(&self.caches, SOURCE, "feature_names")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn all_caches(&self) -> Vec<Cache> {
        rw_read(&self.caches, SOURCE, "all_caches")
            .values()
            .cloned()
            .collect()
    }

    // == Invalidate Feature ==
    /// Empties one feature's cache. Returns how many entries it held.
    pub fn invalidate_feature(&self, feature: &str) -> usize {
        let cache = rw_read(&self.caches, SOURCE, "invalidate_feature")
            .get(feature)
            .cloned();
        match cache {
            Some(cache) => {
                let removed = cache.clear();
                debug!(feature, removed, "Invalidated feature cache");
                removed
            }
            None => 0,
        }
    }

    // == Invalidate Pattern ==
    /// Applies `pattern` to every cache and sums the removals.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        self.all_caches()
            .iter()
            .map(|cache| cache.invalidate_pattern(pattern))
            .sum()
    }

    // == Global Stats ==
    pub fn get_global_stats(&self) -> GlobalStats {
        let caches = rw_read(&self.caches, SOURCE, "get_global_stats");
        let mut stats = GlobalStats::default();
        for (name, cache) in caches.iter() {
            let snapshot = cache.get_stats();
            stats.totals.accumulate(&snapshot);
            stats.caches.insert(name.clone(), snapshot);
        }
        stats
    }

    // == Dispose ==
    /// Stops every sweeper, empties every cache and forgets them.
    pub fn dispose(&self) {
        let caches: Vec<(String, Cache)> = rw_write(&self.caches, SOURCE, "dispose")
            .drain()
            .collect();
        for (_, cache) in &caches {
            cache.dispose();
        }
        info!(count = caches.len(), "Cache registry disposed");
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("defaults", &self.defaults)
            .field("features", &self.feature_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::CacheError;
    use serde_json::json;

    fn registry() -> CacheRegistry {
        CacheRegistry::with_feature_defaults(CacheConfig::default())
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn test_get_cache_returns_same_instance() {
        let registry = registry();
        let first = registry.get_cache(FEATURE_FEED).unwrap();
        first.set("feed:home", json!([]), None);

        let second = registry.get_cache(FEATURE_FEED).unwrap();
        assert!(second.has("feed:home"));
        assert_eq!(registry.feature_names(), vec![FEATURE_FEED]);
    }

    #[test]
    fn test_feature_overrides_merge_over_defaults() {
        let registry = registry();

        let notifications = registry.get_cache(FEATURE_NOTIFICATIONS).unwrap();
        let config = notifications.get_config();
        assert_eq!(config.max_size, 100);
        assert_eq!(config.eviction_policy, EvictionKind::Fifo);
        assert_eq!(config.cleanup_interval, CacheConfig::default().cleanup_interval);

        let unknown = registry.get_cache("search").unwrap();
        assert_eq!(unknown.get_config(), CacheConfig::default());
    }

    #[test]
    fn test_register_feature_rejects_invalid() {
        let registry = registry();
        let result = registry.register_feature("bad", CacheConfigUpdate::new().max_size(0));

        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
        assert_eq!(registry.feature_config("bad"), CacheConfig::default());
    }

    #[test]
    fn test_register_feature_updates_live_cache() {
        let registry = registry();
        let chat = registry.get_cache(FEATURE_CHAT).unwrap();

        registry
            .register_feature(FEATURE_CHAT, CacheConfigUpdate::new().max_size(7))
            .unwrap();
        assert_eq!(chat.get_config().max_size, 7);
    }

    #[test]
    fn test_invalidate_feature_clears_only_that_cache() {
        let registry = registry();
        let feed = registry.get_cache(FEATURE_FEED).unwrap();
        let chat = registry.get_cache(FEATURE_CHAT).unwrap();
        feed.set("a", json!(1), None);
        feed.set("b", json!(2), None);
        chat.set("c", json!(3), None);

        assert_eq!(registry.invalidate_feature(FEATURE_FEED), 2);
        assert_eq!(registry.invalidate_feature("missing"), 0);
        assert!(feed.is_empty());
        assert!(chat.has("c"));
    }

    #[test]
    fn test_invalidate_pattern_sums_across_caches() {
        let registry = registry();
        let feed = registry.get_cache(FEATURE_FEED).unwrap();
        let profile = registry.get_cache(FEATURE_PROFILE).unwrap();
        feed.set("user:1:posts", json!([]), None);
        profile.set("user:1", json!({}), None);
        profile.set("user:2", json!({}), None);
        profile.set("settings", json!({}), None);

        assert_eq!(registry.invalidate_pattern("user:*"), 3);
        assert!(profile.has("settings"));
    }

    #[test]
    fn test_global_stats_totals() {
        let registry = registry();
        let feed = registry.get_cache(FEATURE_FEED).unwrap();
        let chat = registry.get_cache(FEATURE_CHAT).unwrap();
        feed.set("a", json!(1), None);
        feed.get("a");
        chat.get("missing");

        let stats = registry.get_global_stats();
        assert_eq!(stats.caches.len(), 2);
        assert_eq!(stats.totals.hits, 1);
        assert_eq!(stats.totals.misses, 1);
        assert_eq!(stats.totals.size, 1);
        assert_eq!(stats.totals.hit_rate, 0.5);
    }

    #[tokio::test]
    async fn test_dispose_stops_every_sweeper() {
        let registry = CacheRegistry::with_feature_defaults(CacheConfig::default()).unwrap();
        let feed = registry.get_cache(FEATURE_FEED).unwrap();
        let chat = registry.get_cache(FEATURE_CHAT).unwrap();
        feed.set("a", json!(1), None);
        assert!(feed.sweeper_running());

        registry.dispose();

        assert!(!feed.sweeper_running());
        assert!(!chat.sweeper_running());
        assert!(feed.is_empty());
        assert!(registry.feature_names().is_empty());
    }
}
