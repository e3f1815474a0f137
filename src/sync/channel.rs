//! Push channel plumbing.
//!
//! [`Subscription`] is the cancellable handle every [`PushChannel`] returns;
//! [`InMemoryPushChannel`] is a process-local channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::lock::mutex_lock;
use crate::sync::PushEvent;
use crate::traits::{PushChannel, PushHandler};

const SOURCE: &str = "sync::channel";

// == Subscription ==
/// Keeps a handler registered until dropped or unsubscribed.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps the action that detaches the handler.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Detaches the handler. Further calls do nothing.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

type Handlers = Mutex<HashMap<u64, Arc<PushHandler>>>;

// == In-Memory Channel ==
/// Fan-out channel that calls every handler synchronously on `publish`.
#[derive(Default)]
pub struct InMemoryPushChannel {
    handlers: Arc<Handlers>,
    next_id: AtomicU64,
}

impl InMemoryPushChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` to every current subscriber. Returns how many.
    pub fn publish(&self, event: PushEvent) -> usize {
        let handlers: Vec<Arc<PushHandler>> = mutex_lock(&self.handlers, SOURCE, "publish")
            .values()
            .cloned()
            .collect();
        for handler in &handlers {
            handler(event.clone());
        }
        handlers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        mutex_lock(&self.handlers, SOURCE, "subscriber_count").len()
    }
}

impl PushChannel for InMemoryPushChannel {
    fn subscribe(&self, handler: PushHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        mutex_lock(&self.handlers, SOURCE, "subscribe").insert(id, Arc::new(handler));
        debug!(id, "Push subscriber added");

        let handlers: Weak<Handlers> = Arc::downgrade(&self.handlers);
        Subscription::new(move || {
            if let Some(handlers) = handlers.upgrade() {
                mutex_lock(&handlers, SOURCE, "unsubscribe").remove(&id);
                debug!(id, "Push subscriber removed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_reaches_subscribers_until_unsubscribed() {
        let channel = InMemoryPushChannel::new();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();

        let mut subscription = channel.subscribe(Box::new(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let event = PushEvent::insert("message", "m1", "chat:1", json!({"id": "m1"}));

        assert_eq!(channel.publish(event.clone()), 1);
        subscription.unsubscribe();
        subscription.unsubscribe();
        assert_eq!(channel.publish(event), 0);

        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert!(!subscription.is_active());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let channel = InMemoryPushChannel::new();
        {
            let _subscription = channel.subscribe(Box::new(|_event| {}));
            assert_eq!(channel.subscriber_count(), 1);
        }
        assert_eq!(channel.subscriber_count(), 0);
    }
}
