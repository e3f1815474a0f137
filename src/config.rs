//! Configuration Module
//!
//! Cache configuration snapshots, partial updates and environment loading.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

// == Eviction Kind ==
/// Which eviction policy a cache uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionKind {
    /// Least recently used
    #[default]
    Lru,
    /// First in, first out
    Fifo,
}

impl FromStr for EvictionKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionKind::Lru),
            "fifo" => Ok(EvictionKind::Fifo),
            other => Err(CacheError::InvalidConfig(format!(
                "unknown eviction policy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for EvictionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionKind::Lru => f.write_str("lru"),
            EvictionKind::Fifo => f.write_str("fifo"),
        }
    }
}

/// Cache configuration.
///
/// Held by a cache as an immutable snapshot and replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without one
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    /// Maximum number of entries
    pub max_size: usize,
    /// Period of the background expiration sweep
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Victim selection when over capacity
    pub eviction_policy: EvictionKind,
    /// Whether hit/miss/eviction counters are recorded
    pub enable_stats: bool,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_DEFAULT_TTL_MS` - Default TTL in milliseconds (default: 300000)
    /// - `CACHE_MAX_SIZE` - Maximum entries (default: 1000)
    /// - `CACHE_CLEANUP_INTERVAL_MS` - Sweep period in milliseconds (default: 60000)
    /// - `CACHE_EVICTION_POLICY` - `lru` or `fifo` (default: lru)
    /// - `CACHE_ENABLE_STATS` - `true`/`false` (default: true)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_ttl: env_parse::<u64>("CACHE_DEFAULT_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_ttl),
            max_size: env_parse("CACHE_MAX_SIZE").unwrap_or(defaults.max_size),
            cleanup_interval: env_parse::<u64>("CACHE_CLEANUP_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.cleanup_interval),
            eviction_policy: env_parse("CACHE_EVICTION_POLICY")
                .unwrap_or(defaults.eviction_policy),
            enable_stats: env_parse("CACHE_ENABLE_STATS").unwrap_or(defaults.enable_stats),
        }
    }

    /// Checks the invariants every live config must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(CacheError::InvalidConfig(
                "max_size must be greater than 0".to_string(),
            ));
        }
        if self.default_ttl.is_zero() {
            return Err(CacheError::InvalidConfig(
                "default_ttl must be greater than 0".to_string(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "cleanup_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns a copy with `update` merged over this config.
    pub fn merged(&self, update: &CacheConfigUpdate) -> Self {
        Self {
            default_ttl: update.default_ttl.unwrap_or(self.default_ttl),
            max_size: update.max_size.unwrap_or(self.max_size),
            cleanup_interval: update.cleanup_interval.unwrap_or(self.cleanup_interval),
            eviction_policy: update.eviction_policy.unwrap_or(self.eviction_policy),
            enable_stats: update.enable_stats.unwrap_or(self.enable_stats),
        }
    }

    // == Builder-style setters ==
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionKind) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.enable_stats = enabled;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_size: 1000,
            cleanup_interval: Duration::from_secs(60),
            eviction_policy: EvictionKind::Lru,
            enable_stats: true,
        }
    }
}

// == Partial Update ==
/// Partial configuration; unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfigUpdate {
    #[serde(with = "opt_duration_ms")]
    pub default_ttl: Option<Duration>,
    pub max_size: Option<usize>,
    #[serde(with = "opt_duration_ms")]
    pub cleanup_interval: Option<Duration>,
    pub eviction_policy: Option<EvictionKind>,
    pub enable_stats: Option<bool>,
}

impl CacheConfigUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionKind) -> Self {
        self.eviction_policy = Some(policy);
        self
    }

    pub fn enable_stats(mut self, enabled: bool) -> Self {
        self.enable_stats = Some(enabled);
        self
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl, Duration::from_secs(300));
        assert_eq!(config.max_size, 1000);
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.eviction_policy, EvictionKind::Lru);
        assert!(config.enable_stats);
    }

    #[test]
    fn test_config_from_env_defaults() {
        env::remove_var("CACHE_DEFAULT_TTL_MS");
        env::remove_var("CACHE_MAX_SIZE");
        env::remove_var("CACHE_CLEANUP_INTERVAL_MS");
        env::remove_var("CACHE_EVICTION_POLICY");
        env::remove_var("CACHE_ENABLE_STATS");

        assert_eq!(CacheConfig::from_env(), CacheConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_max_size() {
        let config = CacheConfig::default().with_max_size(0);
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let config = CacheConfig::default().with_default_ttl(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = CacheConfig::default().with_cleanup_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merged_only_overrides_set_fields() {
        let base = CacheConfig::default();
        let merged = base.merged(
            &CacheConfigUpdate::new()
                .max_size(50)
                .eviction_policy(EvictionKind::Fifo),
        );

        assert_eq!(merged.max_size, 50);
        assert_eq!(merged.eviction_policy, EvictionKind::Fifo);
        assert_eq!(merged.default_ttl, base.default_ttl);
        assert_eq!(merged.enable_stats, base.enable_stats);
    }

    #[test]
    fn test_eviction_kind_parse() {
        assert_eq!("LRU".parse::<EvictionKind>().unwrap(), EvictionKind::Lru);
        assert_eq!(" fifo ".parse::<EvictionKind>().unwrap(), EvictionKind::Fifo);
        assert!("random".parse::<EvictionKind>().is_err());
    }

    #[test]
    fn test_config_serde_uses_milliseconds() {
        let json = serde_json::json!({
            "default_ttl": 1000,
            "max_size": 3,
            "cleanup_interval": 500,
            "eviction_policy": "fifo",
            "enable_stats": false
        });
        let config: CacheConfig = serde_json::from_value(json).unwrap();

        assert_eq!(config.default_ttl, Duration::from_millis(1000));
        assert_eq!(config.eviction_policy, EvictionKind::Fifo);

        let update: CacheConfigUpdate =
            serde_json::from_value(serde_json::json!({ "max_size": 10 })).unwrap();
        assert_eq!(update, CacheConfigUpdate::new().max_size(10));
    }
}
