//! Cache Engine Module
//!
//! The orchestrator: composes the store, eviction policy, statistics and
//! cleanup sweeper behind one cloneable handle, and de-duplicates concurrent
//! fetches of the same key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{
    build_policy, CacheEntry, CacheEvent, CacheEventSink, CacheStats, EvictionPolicy, KeyPattern,
    StatsSnapshot, Store,
};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{CacheConfig, CacheConfigUpdate};
use crate::error::{CacheError, Result};
use crate::lock::{mutex_lock, rw_read, rw_write};
use crate::tasks::{SweepFn, SweepReport, Sweeper};

const SOURCE: &str = "cache::engine";

type SharedFetch = Shared<BoxFuture<'static, Result<Value>>>;

struct InFlight {
    id: u64,
    future: SharedFetch,
}

struct CacheInner {
    name: String,
    config: ArcSwap<CacheConfig>,
    /// Serializes `update_config` calls
    config_update: Mutex<()>,
    store: RwLock<Store>,
    /// Always locked after `store`
    policy: Mutex<Box<dyn EvictionPolicy>>,
    stats: CacheStats,
    clock: SharedClock,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_flight: AtomicU64,
    sweeper: Sweeper,
    sink: Option<Arc<dyn CacheEventSink>>,
}

// == Cache ==
/// Bounded TTL cache handle. Clones share the same cache.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

// == Builder ==
/// Configures and constructs a [`Cache`].
pub struct CacheBuilder {
    name: String,
    config: CacheConfig,
    clock: SharedClock,
    sink: Option<Arc<dyn CacheEventSink>>,
}

impl CacheBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn CacheEventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validates the config and builds the cache.
    ///
    /// The cleanup sweeper starts immediately when called inside a tokio
    /// runtime; outside one, expired entries are still removed lazily and by
    /// explicit `sweep_expired` calls.
    pub fn build(self) -> Result<Cache> {
        self.config.validate()?;

        let cleanup_interval = self.config.cleanup_interval;
        let policy = build_policy(self.config.eviction_policy);
        let inner = Arc::new(CacheInner {
            sweeper: Sweeper::new(self.name.clone()),
            name: self.name,
            config: ArcSwap::from_pointee(self.config),
            config_update: Mutex::new(()),
            store: RwLock::new(Store::new()),
            policy: Mutex::new(policy),
            stats: CacheStats::new(),
            clock: self.clock,
            in_flight: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
            sink: self.sink,
        });

        let cache = Cache { inner };
        cache.start_sweeper(cleanup_interval);
        debug!(cache = %cache.name(), "Cache created");
        Ok(cache)
    }
}

impl Cache {
    // == Constructors ==
    /// Creates a cache named "default" on the system clock.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> CacheBuilder {
        CacheBuilder {
            name: "default".to_string(),
            config: CacheConfig::default(),
            clock: Arc::new(SystemClock),
            sink: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    /// Current time on this cache's clock, in Unix milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.now()
    }

    // == Get ==
    /// Returns the live value for `key`, recording a hit or a miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Returns a copy of the live entry for `key`, recording a hit or a miss.
    ///
    /// An expired entry found here is removed on the spot.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let now = self.now();
        let found = {
            let store = rw_read(&self.inner.store, SOURCE, "get");
            store.get(key, now).map(|entry| {
                entry.record_access(now);
                mutex_lock(&self.inner.policy, SOURCE, "get").on_access(key);
                entry.clone()
            })
        };

        match found {
            Some(entry) => {
                self.record(CacheStats::record_hit);
                Some(entry)
            }
            None => {
                self.remove_if_expired(key, now);
                self.record(CacheStats::record_miss);
                None
            }
        }
    }

    // == Has ==
    /// True if a live entry exists. Does not count as a read.
    pub fn has(&self, key: &str) -> bool {
        let now = self.now();
        rw_read(&self.inner.store, SOURCE, "has").has(key, now)
    }

    // == Set ==
    /// Stores `value` under `key` for `ttl` (the configured default if None).
    ///
    /// Capacity is restored before this returns.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let config = self.inner.config.load();
        let ttl = ttl.unwrap_or(config.default_ttl);
        let now = self.now();

        let evicted = {
            let mut store = rw_write(&self.inner.store, SOURCE, "set");
            let mut policy = mutex_lock(&self.inner.policy, SOURCE, "set");
            store.set(key.to_string(), value, ttl, now);
            policy.on_insert(key);
            enforce_capacity(&mut store, &mut **policy, config.max_size)
        };

        self.record(CacheStats::record_set);
        self.report_evictions(evicted);
    }

    // == Invalidate ==
    /// Removes `key`. Returns true if a live entry was removed.
    pub fn invalidate(&self, key: &str) -> bool {
        let now = self.now();
        let removed = {
            let mut store = rw_write(&self.inner.store, SOURCE, "invalidate");
            let removed = store.delete(key);
            if removed.is_some() {
                mutex_lock(&self.inner.policy, SOURCE, "invalidate").on_remove(key);
            }
            removed
        };

        match removed {
            Some(entry) if !entry.is_expired(now) => {
                debug!(cache = %self.name(), key, "Invalidated entry");
                self.emit(CacheEvent::Invalidated {
                    cache: self.inner.name.clone(),
                    key: key.to_string(),
                });
                true
            }
            _ => false,
        }
    }

    // == Invalidate Pattern ==
    /// Removes every key matching a literal or `*`-wildcard pattern.
    ///
    /// Returns how many live entries were removed.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let matcher = KeyPattern::new(pattern);
        let now = self.now();
        let removed: Vec<String> = {
            let mut store = rw_write(&self.inner.store, SOURCE, "invalidate_pattern");
            let mut policy = mutex_lock(&self.inner.policy, SOURCE, "invalidate_pattern");
            let matching: Vec<String> = store
                .keys()
                .into_iter()
                .filter(|key| matcher.matches(key))
                .collect();

            matching
                .into_iter()
                .filter_map(|key| {
                    let entry = store.delete(&key)?;
                    policy.on_remove(&key);
                    (!entry.is_expired(now)).then_some(key)
                })
                .collect()
        };

        debug!(
            cache = %self.name(),
            pattern,
            removed = removed.len(),
            "Invalidated by pattern"
        );
        for key in &removed {
            self.emit(CacheEvent::Invalidated {
                cache: self.inner.name.clone(),
                key: key.clone(),
            });
        }
        removed.len()
    }

    // == Clear ==
    /// Removes every entry. Returns how many were stored.
    pub fn clear(&self) -> usize {
        let mut store = rw_write(&self.inner.store, SOURCE, "clear");
        mutex_lock(&self.inner.policy, SOURCE, "clear").clear();
        store.clear()
    }

    // == In-place Update ==
    /// Runs `patch` on the live value of `key` without touching its TTL or
    /// its eviction position.
    ///
    /// Returns false if no live entry exists; otherwise whatever `patch`
    /// reports (true when it changed something).
    pub fn update_in_place<F>(&self, key: &str, patch: F) -> bool
    where
        F: FnOnce(&mut Value) -> bool,
    {
        let now = self.now();
        let mut store = rw_write(&self.inner.store, SOURCE, "update_in_place");
        match store.get_mut(key, now) {
            Some(entry) => patch(&mut entry.value),
            None => false,
        }
    }

    // == Snapshot / Restore ==
    /// Copy of the live entry without recording a read.
    pub fn snapshot_entry(&self, key: &str) -> Option<CacheEntry> {
        let now = self.now();
        rw_read(&self.inner.store, SOURCE, "snapshot_entry")
            .get(key, now)
            .cloned()
    }

    /// Puts a snapshot back, or removes `key` when the snapshot is empty.
    ///
    /// The entry keeps its original timestamps, so a snapshot whose TTL has
    /// since elapsed reads as a miss.
    pub fn restore_entry(&self, key: &str, snapshot: Option<CacheEntry>) {
        let max_size = self.inner.config.load().max_size;
        let evicted = {
            let mut store = rw_write(&self.inner.store, SOURCE, "restore_entry");
            let mut policy = mutex_lock(&self.inner.policy, SOURCE, "restore_entry");
            match snapshot {
                Some(entry) => {
                    store.restore(entry);
                    policy.on_insert(key);
                    enforce_capacity(&mut store, &mut **policy, max_size)
                }
                None => {
                    if store.delete(key).is_some() {
                        policy.on_remove(key);
                    }
                    Vec::new()
                }
            }
        };
        self.report_evictions(evicted);
    }

    /// Writes `replacement` only if the live value still equals `expected`.
    ///
    /// With `replacement` None the current value is left as is. Returns
    /// false, writing nothing, if the value changed or disappeared.
    pub fn compare_and_set(
        &self,
        key: &str,
        expected: &Value,
        replacement: Option<Value>,
        ttl: Option<Duration>,
    ) -> bool {
        let config = self.inner.config.load();
        let now = self.now();
        let evicted = {
            let mut store = rw_write(&self.inner.store, SOURCE, "compare_and_set");
            let current = store.get(key, now).map(|entry| &entry.value);
            if current != Some(expected) {
                return false;
            }
            match replacement {
                Some(value) => {
                    let mut policy = mutex_lock(&self.inner.policy, SOURCE, "compare_and_set");
                    store.set(key.to_string(), value, ttl.unwrap_or(config.default_ttl), now);
                    policy.on_insert(key);
                    enforce_capacity(&mut store, &mut **policy, config.max_size)
                }
                None => Vec::new(),
            }
        };
        self.report_evictions(evicted);
        true
    }

    // == Keys ==
    /// Live keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        let now = self.now();
        let store = rw_read(&self.inner.store, SOURCE, "keys");
        store
            .keys()
            .into_iter()
            .filter(|key| store.has(key, now))
            .collect()
    }

    /// Stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        rw_read(&self.inner.store, SOURCE, "len").size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys in eviction order, next victim first.
    pub fn eviction_order(&self) -> Vec<String> {
        mutex_lock(&self.inner.policy, SOURCE, "eviction_order").order()
    }

    // == Get Or Fetch ==
    /// Returns the live value, or fetches it with single-flight semantics.
    ///
    /// If a fetch for `key` is already running, the caller joins it instead
    /// of calling `fetch_fn`. See [`Cache::refresh`].
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        fetch_fn: F,
        ttl: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        self.refresh(key, fetch_fn, ttl, timeout).await
    }

    // == Refresh ==
    /// Fetches `key` regardless of what is cached, joining any running fetch.
    ///
    /// The fetch runs on its own task. On success the value is written with
    /// `ttl`; on failure nothing is written, so an older entry stays
    /// readable, and every joined caller receives the same error. A caller
    /// whose `timeout` elapses, or who stops waiting, detaches alone: the
    /// fetch keeps running and still populates the cache.
    pub async fn refresh<F, Fut>(
        &self,
        key: &str,
        fetch_fn: F,
        ttl: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let shared = self.join_or_start(key, fetch_fn, ttl);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, shared)
                .await
                .map_err(|_| CacheError::timeout(key, limit))?,
            None => shared.await,
        }
    }

    /// Number of fetches currently running.
    pub fn in_flight_count(&self) -> usize {
        mutex_lock(&self.inner.in_flight, SOURCE, "in_flight_count").len()
    }

    fn join_or_start<F, Fut>(&self, key: &str, fetch_fn: F, ttl: Option<Duration>) -> SharedFetch
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let mut in_flight = mutex_lock(&self.inner.in_flight, SOURCE, "join_or_start");
        if let Some(existing) = in_flight.get(key) {
            debug!(cache = %self.name(), key, "Joining in-flight fetch");
            return existing.future.clone();
        }

        let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
        let fetch = fetch_fn();
        let cache = self.clone();
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            let result = match fetch.await {
                Ok(value) => {
                    cache.set(&owned_key, value.clone(), ttl);
                    Ok(value)
                }
                Err(err) => {
                    warn!(
                        cache = %cache.name(),
                        key = %owned_key,
                        error = %format!("{:#}", err),
                        "Fetch failed, keeping cached state"
                    );
                    Err(CacheError::fetch(&owned_key, &err))
                }
            };
            cache.finish_flight(&owned_key, id);
            result
        });

        let join_key = key.to_string();
        let future: SharedFetch = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(CacheError::Fetch {
                    key: join_key,
                    message: format!("fetch task did not complete: {}", join_err),
                }),
            }
        }
        .boxed()
        .shared();

        debug!(cache = %self.name(), key, "Started fetch");
        in_flight.insert(
            key.to_string(),
            InFlight {
                id,
                future: future.clone(),
            },
        );
        future
    }

    fn finish_flight(&self, key: &str, id: u64) {
        let mut in_flight = mutex_lock(&self.inner.in_flight, SOURCE, "finish_flight");
        if in_flight.get(key).map(|flight| flight.id) == Some(id) {
            in_flight.remove(key);
        }
    }

    // == Sweep ==
    /// Removes every expired entry now.
    ///
    /// Event sink failures are counted per entry and never stop the pass.
    pub fn sweep_expired(&self) -> SweepReport {
        let now = self.now();
        let expired = {
            let mut store = rw_write(&self.inner.store, SOURCE, "sweep");
            let mut policy = mutex_lock(&self.inner.policy, SOURCE, "sweep");
            let expired = store.take_expired(now);
            for key in &expired {
                policy.on_remove(key);
            }
            expired
        };

        let failures = expired
            .iter()
            .filter(|key| {
                !self.emit(CacheEvent::Expired {
                    cache: self.inner.name.clone(),
                    key: (*key).clone(),
                })
            })
            .count();

        SweepReport {
            removed: expired.len(),
            failures,
        }
    }

    /// Runs one sweep through the sweeper, serialized with periodic passes.
    pub fn sweep_once(&self) -> SweepReport {
        self.inner.sweeper.sweep_once()
    }

    pub fn sweeper_running(&self) -> bool {
        self.inner.sweeper.is_running()
    }

    fn start_sweeper(&self, interval: Duration) {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let sweep_fn: SweepFn = Arc::new(move || {
            weak.upgrade()
                .map(|inner| Cache { inner }.sweep_expired())
                .unwrap_or_default()
        });
        self.inner.sweeper.start(interval, sweep_fn);
    }

    // == Stats ==
    /// Counters plus the number of live entries; expired entries awaiting a
    /// sweep are not counted.
    pub fn get_stats(&self) -> StatsSnapshot {
        let now = self.now();
        let live = rw_read(&self.inner.store, SOURCE, "get_stats").live_count(now);
        self.inner.stats.snapshot(live)
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    // == Config ==
    pub fn get_config(&self) -> CacheConfig {
        self.inner.config.load().as_ref().clone()
    }

    /// Merges `update` over the current config.
    ///
    /// An invalid result is rejected with `InvalidConfig` and the previous
    /// config stays in force. Shrinking `max_size` evicts immediately,
    /// switching the policy rebuilds its bookkeeping, and a new cleanup
    /// interval restarts the sweeper.
    pub fn update_config(&self, update: CacheConfigUpdate) -> Result<()> {
        let _serial = mutex_lock(&self.inner.config_update, SOURCE, "update_config");
        let current = self.inner.config.load_full();
        let next = current.merged(&update);
        next.validate()?;
        if next == *current {
            return Ok(());
        }

        self.inner.config.store(Arc::new(next.clone()));

        let evicted = {
            let mut store = rw_write(&self.inner.store, SOURCE, "update_config");
            let mut policy = mutex_lock(&self.inner.policy, SOURCE, "update_config");
            if next.eviction_policy != current.eviction_policy {
                let mut rebuilt = build_policy(next.eviction_policy);
                let mut ordered = policy.order();
                let mut rest: Vec<String> = store
                    .keys()
                    .into_iter()
                    .filter(|key| !ordered.contains(key))
                    .collect();
                rest.sort();
                ordered.extend(rest);
                for key in ordered.iter().filter(|key| store.contains(key)) {
                    rebuilt.on_insert(key);
                }
                *policy = rebuilt;
            }
            enforce_capacity(&mut store, &mut **policy, next.max_size)
        };
        self.report_evictions(evicted);

        if next.cleanup_interval != current.cleanup_interval {
            self.start_sweeper(next.cleanup_interval);
        }

        info!(
            cache = %self.name(),
            max_size = next.max_size,
            default_ttl_ms = next.default_ttl.as_millis() as u64,
            eviction_policy = %next.eviction_policy,
            "Cache config updated"
        );
        Ok(())
    }

    // == Dispose ==
    /// Stops the sweeper and drops every entry.
    ///
    /// Running fetches stay registered until they finish, so later callers
    /// still join them instead of starting a second fetch. Their results
    /// are written when they land.
    pub fn dispose(&self) {
        self.inner.sweeper.stop();
        let removed = self.clear();
        debug!(cache = %self.name(), removed, "Cache disposed");
    }

    // == Internals ==
    fn record(&self, counter: fn(&CacheStats)) {
        if self.inner.config.load().enable_stats {
            counter(&self.inner.stats);
        }
    }

    fn remove_if_expired(&self, key: &str, now: u64) {
        let removed = {
            let mut store = rw_write(&self.inner.store, SOURCE, "expire");
            let removed = store.remove_if_expired(key, now);
            if removed {
                mutex_lock(&self.inner.policy, SOURCE, "expire").on_remove(key);
            }
            removed
        };
        if removed {
            self.emit(CacheEvent::Expired {
                cache: self.inner.name.clone(),
                key: key.to_string(),
            });
        }
    }

    fn report_evictions(&self, evicted: Vec<String>) {
        for key in evicted {
            debug!(cache = %self.name(), key = %key, "Evicted entry");
            self.record(CacheStats::record_eviction);
            self.emit(CacheEvent::Evicted {
                cache: self.inner.name.clone(),
                key,
            });
        }
    }

    /// Delivers an event to the sink. Returns false if the sink failed.
    fn emit(&self, event: CacheEvent) -> bool {
        let Some(sink) = &self.inner.sink else {
            return true;
        };
        match sink.notify(&event) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    cache = %self.name(),
                    key = %event.key(),
                    error = %err,
                    "Cache event sink failed"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .finish()
    }
}

/// Evicts until `store` fits in `max_size`. Returns the evicted keys.
fn enforce_capacity(
    store: &mut Store,
    policy: &mut dyn EvictionPolicy,
    max_size: usize,
) -> Vec<String> {
    let mut evicted = Vec::new();
    while store.size() > max_size {
        let Some(victim) = policy.should_evict(store) else {
            unreachable!(
                "eviction policy tracks no key while the store holds {} entries",
                store.size()
            );
        };
        store.delete(&victim);
        policy.on_remove(&victim);
        evicted.push(victim);
    }
    evicted
}
