//! Query Executor
//!
//! Cache-first reads with stale-while-revalidate on top of a [`Cache`] and a
//! [`DataSource`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::error::Result;
use crate::traits::DataSource;

// == Query Options ==
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// Age after which a cached value is served but refreshed in the background
    pub stale_time: Duration,
    /// TTL for fetched values; the cache default when None
    pub ttl: Option<Duration>,
    /// How long a caller waits on a fetch; unbounded when None
    pub timeout: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(30),
            ttl: None,
            timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Freshness of a cached value as seen by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Missing,
}

// == Query Executor ==
#[derive(Clone)]
pub struct QueryExecutor {
    cache: Cache,
    source: Arc<dyn DataSource>,
    options: QueryOptions,
}

impl QueryExecutor {
    pub fn new(cache: Cache, source: Arc<dyn DataSource>, options: QueryOptions) -> Self {
        Self {
            cache,
            source,
            options,
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    // == Query ==
    /// Reads `key`.
    ///
    /// 1. Fresh (younger than `stale_time`): returned as is.
    /// 2. Stale but live: returned as is, and one background refresh is
    ///    started or joined.
    /// 3. Missing: waits for a single-flight fetch.
    pub async fn query(&self, key: &str) -> Result<Value> {
        let stale_ms = self.options.stale_time.as_millis() as u64;
        match self.cache.get_entry(key) {
            Some(entry) if entry.age_ms(self.cache.now_ms()) < stale_ms => Ok(entry.value),
            Some(entry) => {
                debug!(cache = %self.cache.name(), key, "Serving stale value, revalidating");
                self.revalidate_in_background(key);
                Ok(entry.value)
            }
            None => self.fetch(key).await,
        }
    }

    /// Classifies the cached value for `key` without counting a read.
    pub fn freshness(&self, key: &str) -> Freshness {
        let stale_ms = self.options.stale_time.as_millis() as u64;
        match self.cache.snapshot_entry(key) {
            Some(entry) if entry.age_ms(self.cache.now_ms()) < stale_ms => Freshness::Fresh,
            Some(_) => Freshness::Stale,
            None => Freshness::Missing,
        }
    }

    // == Prefetch ==
    /// Warms `key` if it is not cached, without returning the value.
    pub async fn prefetch(&self, key: &str) -> Result<()> {
        if self.cache.has(key) {
            return Ok(());
        }
        self.fetch(key).await.map(|_| ())
    }

    /// Writes `value` as if it had just been fetched.
    pub fn set_query_data(&self, key: &str, value: Value) {
        self.cache.set(key, value, self.options.ttl);
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.invalidate(key)
    }

    async fn fetch(&self, key: &str) -> Result<Value> {
        // Filled by a fetch that finished after our miss
        if let Some(entry) = self.cache.snapshot_entry(key) {
            return Ok(entry.value);
        }
        self.cache
            .refresh(key, self.fetch_fn(key), self.options.ttl, self.options.timeout)
            .await
    }

    fn revalidate_in_background(&self, key: &str) {
        let cache = self.cache.clone();
        let fetch_fn = self.fetch_fn(key);
        let ttl = self.options.ttl;
        let timeout = self.options.timeout;
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(err) = cache.refresh(&key, fetch_fn, ttl, timeout).await {
                warn!(
                    cache = %cache.name(),
                    key = %key,
                    error = %err,
                    "Background revalidation failed, stale value kept"
                );
            }
        });
    }

    fn fetch_fn(&self, key: &str) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<Value>> {
        let source = self.source.clone();
        let key = key.to_string();
        let deadline = self.options.timeout.map(|timeout| Instant::now() + timeout);
        move || async move { source.fetch(&key, deadline).await }.boxed()
    }
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("cache", &self.cache)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::error::CacheError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns `"<key>#<call number>"`, optionally failing.
    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingSource {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataSource for CountingSource {
        async fn fetch(&self, key: &str, _deadline: Option<Instant>) -> anyhow::Result<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                anyhow::bail!("backend unavailable");
            }
            Ok(json!(format!("{}#{}", key, n)))
        }
    }

    fn executor(source: Arc<CountingSource>) -> (QueryExecutor, ManualClock) {
        let clock = ManualClock::new(0);
        let cache = Cache::builder()
            .config(CacheConfig::default())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        let options = QueryOptions {
            stale_time: Duration::from_secs(1),
            ttl: Some(Duration::from_secs(60)),
            timeout: None,
        };
        (QueryExecutor::new(cache, source, options), clock)
    }

    #[tokio::test]
    async fn test_miss_fetches_and_caches() {
        let source = CountingSource::new(false);
        let (executor, _) = executor(source.clone());

        assert_eq!(executor.query("k").await.unwrap(), json!("k#1"));
        assert_eq!(executor.query("k").await.unwrap(), json!("k#1"));
        assert_eq!(source.calls(), 1);
        assert_eq!(executor.freshness("k"), Freshness::Fresh);
    }

    #[tokio::test]
    async fn test_stale_value_served_then_refreshed() {
        let source = CountingSource::new(false);
        let (executor, clock) = executor(source.clone());
        executor.set_query_data("k", json!("old"));
        clock.advance(Duration::from_secs(2));
        assert_eq!(executor.freshness("k"), Freshness::Stale);

        assert_eq!(executor.query("k").await.unwrap(), json!("old"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls(), 1);
        assert_eq!(executor.query("k").await.unwrap(), json!("k#1"));
    }

    #[tokio::test]
    async fn test_concurrent_stale_readers_share_one_refresh() {
        let source = CountingSource::new(false);
        let (executor, clock) = executor(source.clone());
        executor.set_query_data("k", json!("old"));
        clock.advance(Duration::from_secs(2));

        let reads = futures::future::join_all((0..8).map(|_| executor.query("k"))).await;

        assert!(reads.iter().all(|r| r.as_ref().unwrap() == &json!("old")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_revalidation_keeps_stale_value() {
        let source = CountingSource::new(true);
        let (executor, clock) = executor(source.clone());
        executor.set_query_data("k", json!("old"));
        clock.advance(Duration::from_secs(2));

        assert_eq!(executor.query("k").await.unwrap(), json!("old"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(executor.cache().get("k"), Some(json!("old")));
    }

    #[tokio::test]
    async fn test_miss_with_failing_source_surfaces_error() {
        let source = CountingSource::new(true);
        let (executor, _) = executor(source);

        let result = executor.query("k").await;
        assert!(matches!(result, Err(CacheError::Fetch { .. })));
        assert!(!executor.cache().has("k"));
    }

    #[tokio::test]
    async fn test_prefetch_and_invalidate() {
        let source = CountingSource::new(false);
        let (executor, _) = executor(source.clone());

        executor.prefetch("k").await.unwrap();
        executor.prefetch("k").await.unwrap();
        assert_eq!(source.calls(), 1);

        assert!(executor.invalidate("k"));
        assert_eq!(executor.freshness("k"), Freshness::Missing);
    }
}
