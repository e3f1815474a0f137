//! Collaborator traits.
//!
//! The engine never talks to the network itself. Reads go through a
//! [`DataSource`], mutations through a [`Command`], and live updates arrive
//! from a [`PushChannel`].

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::mutation::MutationView;
use crate::sync::{PushEvent, Subscription};

// ============================================================================
// Data Source
// ============================================================================

/// Loads authoritative values for cache keys.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetches the value for `key`.
    ///
    /// `deadline` is the latest instant any caller is still waiting for the
    /// result. It is advisory: the engine stops waiting at the deadline but
    /// lets the fetch finish so the value can still be cached.
    async fn fetch(&self, key: &str, deadline: Option<Instant>) -> anyhow::Result<Value>;
}

// ============================================================================
// Command
// ============================================================================

/// Performs a remote mutation.
#[async_trait]
pub trait Command: Send + Sync {
    /// Executes the mutation described by `intent`.
    ///
    /// `Ok(Some(value))` replaces the optimistic value with the server's
    /// version; `Ok(None)` keeps the optimistic value.
    async fn execute(
        &self,
        intent: &MutationView,
        deadline: Option<Instant>,
    ) -> anyhow::Result<Option<Value>>;
}

// ============================================================================
// Push Channel
// ============================================================================

/// Callback invoked for every push event.
pub type PushHandler = Box<dyn Fn(PushEvent) + Send + Sync>;

/// Source of live update events.
pub trait PushChannel: Send + Sync {
    /// Registers `handler`; events stop when the subscription is dropped or
    /// explicitly unsubscribed.
    fn subscribe(&self, handler: PushHandler) -> Subscription;
}
