//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror.

use std::time::Duration;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache engine.
///
/// The enum is `Clone` because a single fetch outcome is handed to every
/// caller that joined the same in-flight request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The data source failed to produce a value
    #[error("Fetch failed for '{key}': {message}")]
    Fetch { key: String, message: String },

    /// A mutation command failed and the optimistic value was rolled back
    #[error("Command failed for '{key}': {message}")]
    Command { key: String, message: String },

    /// The caller's deadline elapsed while waiting on shared work
    #[error("Timed out after {after:?} waiting on '{key}'")]
    Timeout { key: String, after: Duration },

    /// A configuration value was rejected
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// An optimistic write was superseded before it committed
    #[error("Stale write: '{key}' was modified before the mutation committed")]
    StaleWrite { key: String },
}

impl CacheError {
    // == Constructors ==
    /// Wraps a data source failure.
    pub fn fetch(key: impl Into<String>, err: &anyhow::Error) -> Self {
        CacheError::Fetch {
            key: key.into(),
            message: format!("{:#}", err),
        }
    }

    /// Wraps a command failure.
    pub fn command(key: impl Into<String>, err: &anyhow::Error) -> Self {
        CacheError::Command {
            key: key.into(),
            message: format!("{:#}", err),
        }
    }

    /// Builds a timeout error for the given key.
    pub fn timeout(key: impl Into<String>, after: Duration) -> Self {
        CacheError::Timeout {
            key: key.into(),
            after,
        }
    }

    /// Returns true for errors that leave cached state untouched and may be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CacheError::Fetch { .. } | CacheError::Command { .. } | CacheError::Timeout { .. }
        )
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;
