//! Mutation Coordinator
//!
//! Optimistic writes with rollback. The optimistic value is visible to every
//! reader before the remote command resolves; a failed command restores what
//! was cached before.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{Cache, CacheEntry};
use crate::error::{CacheError, Result};
use crate::traits::Command;

// == State ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    Committed,
    RolledBack,
}

// == View ==
/// What a [`Command`] gets to see of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationView {
    pub key: String,
    pub optimistic_value: Value,
    /// Value cached when the mutation started, if any
    pub previous_value: Option<Value>,
}

// == Intent ==
/// One optimistic write awaiting its outcome.
///
/// `commit` and `rollback` consume the intent, so it resolves exactly once.
/// Dropping a pending intent rolls it back.
#[must_use = "a dropped intent rolls back its optimistic write"]
pub struct MutationIntent {
    cache: Cache,
    view: MutationView,
    previous: Option<CacheEntry>,
    ttl: Option<Duration>,
    state: MutationState,
}

impl MutationIntent {
    pub fn key(&self) -> &str {
        &self.view.key
    }

    pub fn optimistic_value(&self) -> &Value {
        &self.view.optimistic_value
    }

    pub fn previous_value(&self) -> Option<&Value> {
        self.view.previous_value.as_ref()
    }

    pub fn state(&self) -> MutationState {
        self.state
    }

    pub fn view(&self) -> &MutationView {
        &self.view
    }

    /// True if the cached value is no longer the optimistic one.
    pub fn is_superseded(&self) -> bool {
        self.cache.snapshot_entry(&self.view.key).map(|entry| entry.value)
            != Some(self.view.optimistic_value.clone())
    }

    // == Commit ==
    /// Marks the mutation committed, writing `authoritative` over the
    /// optimistic value when given. Returns the value left in the cache.
    pub fn commit(mut self, authoritative: Option<Value>) -> Value {
        self.state = MutationState::Committed;
        match authoritative {
            Some(value) => {
                self.cache.set(&self.view.key, value.clone(), self.ttl);
                debug!(key = %self.view.key, "Mutation committed with server value");
                value
            }
            None => {
                debug!(key = %self.view.key, "Mutation committed");
                self.view.optimistic_value.clone()
            }
        }
    }

    /// Like [`commit`](Self::commit), but fails with `StaleWrite` instead of
    /// overwriting when another writer replaced the optimistic value first.
    pub fn commit_checked(mut self, authoritative: Option<Value>) -> Result<Value> {
        self.state = MutationState::Committed;
        let expected = self.view.optimistic_value.clone();
        let final_value = authoritative.clone().unwrap_or_else(|| expected.clone());
        if self
            .cache
            .compare_and_set(&self.view.key, &expected, authoritative, self.ttl)
        {
            debug!(key = %self.view.key, "Mutation committed");
            Ok(final_value)
        } else {
            warn!(key = %self.view.key, "Optimistic write was superseded before commit");
            Err(CacheError::StaleWrite {
                key: self.view.key.clone(),
            })
        }
    }

    // == Rollback ==
    /// Restores the value cached before the mutation, or removes the key if
    /// there was none.
    pub fn rollback(mut self) -> MutationState {
        self.restore();
        self.state
    }

    fn restore(&mut self) {
        self.cache
            .restore_entry(&self.view.key, self.previous.take());
        self.state = MutationState::RolledBack;
        debug!(key = %self.view.key, "Mutation rolled back");
    }
}

impl Drop for MutationIntent {
    fn drop(&mut self) {
        if self.state == MutationState::Pending {
            warn!(key = %self.view.key, "Pending mutation dropped, rolling back");
            self.restore();
        }
    }
}

impl std::fmt::Debug for MutationIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationIntent")
            .field("view", &self.view)
            .field("state", &self.state)
            .finish()
    }
}

// == Options ==
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationOptions {
    /// TTL for optimistic and committed values; the cache default when None
    pub ttl: Option<Duration>,
    /// How long to wait for the command; unbounded when None
    pub timeout: Option<Duration>,
}

// == Coordinator ==
#[derive(Debug, Clone)]
pub struct MutationCoordinator {
    cache: Cache,
    options: MutationOptions,
}

impl MutationCoordinator {
    pub fn new(cache: Cache, options: MutationOptions) -> Self {
        Self { cache, options }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    // == Apply Optimistic ==
    /// Snapshots `key` and writes `value` immediately.
    pub fn apply_optimistic(&self, key: &str, value: Value) -> MutationIntent {
        let previous = self.cache.snapshot_entry(key);
        self.cache.set(key, value.clone(), self.options.ttl);

        MutationIntent {
            cache: self.cache.clone(),
            view: MutationView {
                key: key.to_string(),
                optimistic_value: value,
                previous_value: previous.as_ref().map(|entry| entry.value.clone()),
            },
            previous,
            ttl: self.options.ttl,
            state: MutationState::Pending,
        }
    }

    // == Mutate ==
    /// Writes `optimistic`, runs `command`, then commits or rolls back.
    ///
    /// Returns the value left in the cache on success. A failed command rolls
    /// back and returns `Command`; an elapsed timeout rolls back and returns
    /// `Timeout`, while the command itself may still finish in the
    /// background with its result discarded.
    pub async fn mutate(
        &self,
        key: &str,
        optimistic: Value,
        command: Arc<dyn Command>,
    ) -> Result<Value> {
        let intent = self.apply_optimistic(key, optimistic);
        let (intent, outcome) = self.execute(intent, command).await?;
        match outcome {
            Ok(authoritative) => Ok(intent.commit(authoritative)),
            Err(err) => Err(self.fail(intent, &err)),
        }
    }

    /// [`mutate`](Self::mutate), but reports `StaleWrite` instead of
    /// overwriting when a push update replaced the optimistic value while the
    /// command was running.
    pub async fn mutate_checked(
        &self,
        key: &str,
        optimistic: Value,
        command: Arc<dyn Command>,
    ) -> Result<Value> {
        let intent = self.apply_optimistic(key, optimistic);
        let (intent, outcome) = self.execute(intent, command).await?;
        match outcome {
            Ok(authoritative) => intent.commit_checked(authoritative),
            Err(err) => Err(self.fail(intent, &err)),
        }
    }

    async fn execute(
        &self,
        intent: MutationIntent,
        command: Arc<dyn Command>,
    ) -> Result<(MutationIntent, anyhow::Result<Option<Value>>)> {
        let view = intent.view().clone();
        let deadline = self.options.timeout.map(|timeout| Instant::now() + timeout);
        let task = tokio::spawn(async move {
            let outcome = command.execute(&view, deadline).await;
            if outcome.is_err() {
                debug!(key = %view.key, "Command returned an error");
            }
            outcome
        });

        let joined = match self.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    let key = intent.key().to_string();
                    warn!(key = %key, "Command timed out, rolling back");
                    intent.rollback();
                    return Err(CacheError::timeout(key, limit));
                }
            },
            None => task.await,
        };

        let outcome = joined.unwrap_or_else(|join_err| Err(anyhow::Error::new(join_err)));
        Ok((intent, outcome))
    }

    fn fail(&self, intent: MutationIntent, err: &anyhow::Error) -> CacheError {
        let key = intent.key().to_string();
        warn!(key = %key, error = %format!("{:#}", err), "Command failed, rolling back");
        intent.rollback();
        CacheError::command(key, err)
    }
}
