//! Update Reconciler
//!
//! Patches cached collections from push events without a round-trip.
//!
//! A collection cached under key `C` is the entry `C` itself and/or the page
//! entries `C:page:<n>`, ordered by `n`. A page is a JSON array of items or
//! an object with an `items` array. Items are matched on an id field.
//! Collections are opaque ordered lists: items are inserted at one end or
//! replaced/removed in place, never re-sorted.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::cache::Cache;
use crate::sync::{PushEvent, PushOperation, Subscription};
use crate::traits::PushChannel;

const PAGE_SEGMENT: &str = ":page:";

/// Key of page `page` of `collection`.
pub fn page_key(collection: &str, page: u64) -> String {
    format!("{}{}{}", collection, PAGE_SEGMENT, page)
}

// == Config ==
/// Where inserted items land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertPosition {
    /// Start of the first page (newest-first lists)
    #[default]
    Front,
    /// End of the last page (oldest-first lists)
    Back,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Item field holding the entity id
    pub id_field: String,
    /// Boolean item field set by `mark_seen`
    pub seen_field: String,
    pub insert_position: InsertPosition,
    /// Number of serialized worker lanes used by `spawn`
    pub lanes: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            seen_field: "seen".to_string(),
            insert_position: InsertPosition::Front,
            lanes: 8,
        }
    }
}

/// What applying one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileOutcome {
    /// Cache entries that changed
    pub entries_patched: usize,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.entries_patched == 0
    }
}

// == Reconciler ==
#[derive(Debug, Clone)]
pub struct UpdateReconciler {
    cache: Cache,
    config: Arc<ReconcilerConfig>,
}

impl UpdateReconciler {
    pub fn new(cache: Cache) -> Self {
        Self::with_config(cache, ReconcilerConfig::default())
    }

    pub fn with_config(cache: Cache, config: ReconcilerConfig) -> Self {
        Self {
            cache,
            config: Arc::new(config),
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    // == Apply ==
    /// Applies one event synchronously.
    ///
    /// Events for collections or items that are not cached do nothing; the
    /// next full fetch brings them in.
    pub fn apply(&self, event: &PushEvent) -> ReconcileOutcome {
        let pages = self.page_keys(&event.collection_key);
        if pages.is_empty() {
            trace!(collection = %event.collection_key, "Collection not cached, event ignored");
            return ReconcileOutcome::default();
        }

        let entries_patched = match event.operation {
            PushOperation::Insert => self.insert(&pages, event),
            PushOperation::Update => self.replace(&pages, event),
            PushOperation::Delete => self.remove(&pages, event),
            PushOperation::MarkSeen => self.mark_seen(&pages, event),
        };

        debug!(
            entity = %event.ordering_key(),
            operation = %event.operation,
            collection = %event.collection_key,
            entries_patched,
            "Applied push event"
        );
        ReconcileOutcome { entries_patched }
    }

    /// Cached entries making up `collection`, in page order.
    pub fn page_keys(&self, collection: &str) -> Vec<String> {
        let prefix = format!("{}{}", collection, PAGE_SEGMENT);
        let mut pages: Vec<(Option<u64>, String)> = self
            .cache
            .keys()
            .into_iter()
            .filter_map(|key| {
                if key == collection {
                    return Some((None, key));
                }
                let page = key.strip_prefix(&prefix)?.parse::<u64>().ok()?;
                Some((Some(page), key))
            })
            .collect();
        // The bare collection entry sorts before numbered pages
        pages.sort();
        pages.into_iter().map(|(_, key)| key).collect()
    }

    fn insert(&self, pages: &[String], event: &PushEvent) -> usize {
        let already_cached = pages.iter().any(|key| {
            self.cache
                .snapshot_entry(key)
                .map(|entry| self.contains_item(&entry.value, &event.entity_id))
                .unwrap_or(false)
        });
        if already_cached {
            return self.replace(pages, event);
        }

        let (target, front) = match self.config.insert_position {
            InsertPosition::Front => (pages.first(), true),
            InsertPosition::Back => (pages.last(), false),
        };
        let Some(target) = target else {
            return 0;
        };

        let payload = event.payload.clone();
        let inserted = self.cache.update_in_place(target, |value| match items_mut(value) {
            Some(items) => {
                if front {
                    items.insert(0, payload);
                } else {
                    items.push(payload);
                }
                true
            }
            None => false,
        });
        if !inserted {
            warn!(key = %target, "Insert target is not a list, event ignored");
        }
        usize::from(inserted)
    }

    fn replace(&self, pages: &[String], event: &PushEvent) -> usize {
        self.patch_each(pages, |config, value| {
            if let Some(items) = items_mut(value) {
                let mut changed = false;
                for item in items.iter_mut() {
                    if item_has_id(item, &config.id_field, &event.entity_id) {
                        *item = event.payload.clone();
                        changed = true;
                    }
                }
                changed
            } else if item_has_id(value, &config.id_field, &event.entity_id) {
                *value = event.payload.clone();
                true
            } else {
                false
            }
        })
    }

    fn remove(&self, pages: &[String], event: &PushEvent) -> usize {
        let mut removed = 0;
        for key in pages {
            let single_entity = self
                .cache
                .snapshot_entry(key)
                .map(|entry| {
                    items_of(&entry.value).is_none()
                        && item_has_id(&entry.value, &self.config.id_field, &event.entity_id)
                })
                .unwrap_or(false);
            if single_entity {
                removed += usize::from(self.cache.invalidate(key));
                continue;
            }

            let changed = self.cache.update_in_place(key, |value| {
                let Some(items) = items_mut(value) else {
                    return false;
                };
                let before = items.len();
                items.retain(|item| !item_has_id(item, &self.config.id_field, &event.entity_id));
                items.len() != before
            });
            removed += usize::from(changed);
        }
        removed
    }

    fn mark_seen(&self, pages: &[String], event: &PushEvent) -> usize {
        self.patch_each(pages, |config, value| {
            let mut changed = false;
            let mut flag = |item: &mut Value| {
                if item_has_id(item, &config.id_field, &event.entity_id) {
                    if let Some(fields) = item.as_object_mut() {
                        fields.insert(config.seen_field.clone(), Value::Bool(true));
                        changed = true;
                    }
                }
            };
            match items_mut(value) {
                Some(items) => items.iter_mut().for_each(&mut flag),
                None => flag(value),
            }
            changed
        })
    }

    fn patch_each<F>(&self, pages: &[String], patch: F) -> usize
    where
        F: Fn(&ReconcilerConfig, &mut Value) -> bool,
    {
        pages
            .iter()
            .filter(|key| {
                self.cache
                    .update_in_place(key, |value| patch(&*self.config, value))
            })
            .count()
    }

    fn contains_item(&self, value: &Value, id: &str) -> bool {
        match items_of(value) {
            Some(items) => items
                .iter()
                .any(|item| item_has_id(item, &self.config.id_field, id)),
            None => false,
        }
    }

    // == Spawn ==
    /// Starts background workers that apply submitted events.
    ///
    /// Events with the same ordering key always land on the same worker and
    /// are applied in submission order; other entities proceed in parallel.
    pub fn spawn(&self) -> ReconcilerHandle {
        let lanes = self.config.lanes.max(1);
        let mut workers = JoinSet::new();
        let mut senders = Vec::with_capacity(lanes);

        for lane in 0..lanes {
            let (tx, mut rx) = mpsc::unbounded_channel::<PushEvent>();
            let reconciler = self.clone();
            workers.spawn(async move {
                while let Some(event) = rx.recv().await {
                    reconciler.apply(&event);
                }
                trace!(lane, "Reconciler lane drained");
            });
            senders.push(tx);
        }

        debug!(cache = %self.cache.name(), lanes, "Reconciler workers started");
        ReconcilerHandle {
            senders: Arc::new(senders),
            workers,
        }
    }
}

// == Handle ==
/// Submits events to running reconciler workers.
pub struct ReconcilerHandle {
    senders: Arc<Vec<mpsc::UnboundedSender<PushEvent>>>,
    workers: JoinSet<()>,
}

impl ReconcilerHandle {
    /// Queues `event` on its entity's lane. Returns false after shutdown.
    pub fn submit(&self, event: PushEvent) -> bool {
        route(&self.senders, event)
    }

    /// Feeds every event from `channel` into the workers.
    pub fn attach(&self, channel: &dyn PushChannel) -> Subscription {
        let senders = self.senders.clone();
        channel.subscribe(Box::new(move |event| {
            if !route(&senders, event) {
                warn!("Reconciler stopped, push event dropped");
            }
        }))
    }

    /// Stops accepting events and waits until every queued one is applied.
    ///
    /// Subscriptions created by `attach` must be dropped first, since they
    /// keep the lanes open.
    pub async fn shutdown(mut self) {
        self.senders = Arc::new(Vec::new());
        while let Some(result) = self.workers.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "Reconciler worker failed");
            }
        }
    }
}

impl Drop for ReconcilerHandle {
    /// Closes the lanes and leaves the workers running until every accepted
    /// event is applied.
    fn drop(&mut self) {
        self.senders = Arc::new(Vec::new());
        if !self.workers.is_empty() {
            debug!(
                workers = self.workers.len(),
                "Reconciler handle dropped, lanes draining in background"
            );
            self.workers.detach_all();
        }
    }
}

fn route(senders: &[mpsc::UnboundedSender<PushEvent>], event: PushEvent) -> bool {
    if senders.is_empty() {
        return false;
    }
    let mut hasher = DefaultHasher::new();
    event.ordering_key().hash(&mut hasher);
    let lane = (hasher.finish() % senders.len() as u64) as usize;
    senders[lane].send(event).is_ok()
}

// == Item helpers ==
fn items_of(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(fields) => fields.get("items").and_then(Value::as_array),
        _ => None,
    }
}

fn items_mut(value: &mut Value) -> Option<&mut Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(fields) => fields.get_mut("items").and_then(Value::as_array_mut),
        _ => None,
    }
}

fn item_has_id(item: &Value, id_field: &str, id: &str) -> bool {
    match item.get(id_field) {
        Some(Value::String(s)) => s == id,
        Some(Value::Number(n)) => n.to_string() == id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use serde_json::json;
    use std::time::Duration;

    fn cache() -> Cache {
        Cache::builder()
            .config(CacheConfig::default())
            .clock(Arc::new(ManualClock::new(0)))
            .build()
            .unwrap()
    }

    fn item(id: &str) -> Value {
        json!({"id": id, "seen": false})
    }

    fn seed_feed(cache: &Cache) {
        cache.set(&page_key("feed", 0), json!([item("a"), item("b")]), None);
        cache.set(&page_key("feed", 1), json!({"items": [item("c"), item("b")], "cursor": "x"}), None);
    }

    #[test]
    fn test_page_keys_ordering() {
        let cache = cache();
        cache.set("feed:page:10", json!([]), None);
        cache.set("feed:page:2", json!([]), None);
        cache.set("feed", json!([]), None);
        cache.set("feed:page:x", json!([]), None);
        cache.set("feedback:page:1", json!([]), None);

        let reconciler = UpdateReconciler::new(cache);
        assert_eq!(
            reconciler.page_keys("feed"),
            vec!["feed", "feed:page:2", "feed:page:10"]
        );
    }

    #[test]
    fn test_insert_front_of_first_page() {
        let cache = cache();
        seed_feed(&cache);
        let reconciler = UpdateReconciler::new(cache.clone());

        let outcome = reconciler.apply(&PushEvent::insert("post", "z", "feed", item("z")));

        assert_eq!(outcome.entries_patched, 1);
        assert_eq!(
            cache.get("feed:page:0"),
            Some(json!([item("z"), item("a"), item("b")]))
        );
    }

    #[test]
    fn test_insert_back_of_last_page() {
        let cache = cache();
        seed_feed(&cache);
        let config = ReconcilerConfig {
            insert_position: InsertPosition::Back,
            ..ReconcilerConfig::default()
        };
        let reconciler = UpdateReconciler::with_config(cache.clone(), config);

        reconciler.apply(&PushEvent::insert("post", "z", "feed", item("z")));

        assert_eq!(
            cache.get("feed:page:1").unwrap()["items"],
            json!([item("c"), item("b"), item("z")])
        );
    }

    #[test]
    fn test_insert_of_known_item_acts_as_update() {
        let cache = cache();
        seed_feed(&cache);
        let reconciler = UpdateReconciler::new(cache.clone());

        let updated = json!({"id": "a", "seen": false, "title": "edited"});
        reconciler.apply(&PushEvent::insert("post", "a", "feed", updated.clone()));

        let page = cache.get("feed:page:0").unwrap();
        assert_eq!(page, json!([updated, item("b")]));
    }

    #[test]
    fn test_update_replaces_in_every_page() {
        let cache = cache();
        seed_feed(&cache);
        let reconciler = UpdateReconciler::new(cache.clone());
        let updated = json!({"id": "b", "seen": true, "likes": 3});

        let outcome = reconciler.apply(&PushEvent::update("post", "b", "feed", updated.clone()));

        assert_eq!(outcome.entries_patched, 2);
        assert_eq!(cache.get("feed:page:0").unwrap()[1], updated);
        assert_eq!(cache.get("feed:page:1").unwrap()["items"][1], updated);
    }

    #[test]
    fn test_delete_removes_from_every_page() {
        let cache = cache();
        seed_feed(&cache);
        let reconciler = UpdateReconciler::new(cache.clone());

        let outcome = reconciler.apply(&PushEvent::delete("post", "b", "feed"));

        assert_eq!(outcome.entries_patched, 2);
        assert_eq!(cache.get("feed:page:0"), Some(json!([item("a")])));
        assert_eq!(
            cache.get("feed:page:1"),
            Some(json!({"items": [item("c")], "cursor": "x"}))
        );
    }

    #[test]
    fn test_mark_seen_keeps_position() {
        let cache = cache();
        seed_feed(&cache);
        let reconciler = UpdateReconciler::new(cache.clone());

        reconciler.apply(&PushEvent::mark_seen("post", "a", "feed"));

        let page = cache.get("feed:page:0").unwrap();
        assert_eq!(page[0], json!({"id": "a", "seen": true}));
        assert_eq!(page[1], item("b"));
    }

    #[test]
    fn test_single_entity_entry() {
        let cache = cache();
        cache.set("user:7", json!({"id": 7, "name": "old"}), None);
        let reconciler = UpdateReconciler::new(cache.clone());

        reconciler.apply(&PushEvent::update("user", "7", "user:7", json!({"id": 7, "name": "new"})));
        assert_eq!(cache.get("user:7").unwrap()["name"], json!("new"));

        reconciler.apply(&PushEvent::delete("user", "7", "user:7"));
        assert!(!cache.has("user:7"));
    }

    #[test]
    fn test_uncached_collection_or_item_is_noop() {
        let cache = cache();
        seed_feed(&cache);
        let reconciler = UpdateReconciler::new(cache.clone());

        assert!(reconciler
            .apply(&PushEvent::insert("post", "z", "other", item("z")))
            .is_noop());
        assert!(reconciler
            .apply(&PushEvent::update("post", "missing", "feed", item("missing")))
            .is_noop());
        assert!(reconciler
            .apply(&PushEvent::delete("post", "missing", "feed"))
            .is_noop());
        assert_eq!(cache.get("feed:page:0"), Some(json!([item("a"), item("b")])));
    }

    #[test]
    fn test_patch_keeps_ttl() {
        let clock = ManualClock::new(0);
        let cache = Cache::builder()
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        cache.set("feed", json!([item("a")]), Some(Duration::from_millis(100)));
        let reconciler = UpdateReconciler::new(cache.clone());

        clock.advance(Duration::from_millis(60));
        reconciler.apply(&PushEvent::mark_seen("post", "a", "feed"));
        clock.advance(Duration::from_millis(40));

        assert!(!cache.has("feed"));
    }

    #[tokio::test]
    async fn test_workers_preserve_per_entity_order() {
        let cache = cache();
        cache.set("chat:1", json!([]), None);
        let reconciler = UpdateReconciler::new(cache.clone());
        let handle = reconciler.spawn();

        handle.submit(PushEvent::insert("message", "m1", "chat:1", json!({"id": "m1", "v": 0})));
        for v in 1..=20 {
            handle.submit(PushEvent::update("message", "m1", "chat:1", json!({"id": "m1", "v": v})));
        }
        handle.submit(PushEvent::insert("message", "m2", "chat:1", json!({"id": "m2", "v": 0})));
        handle.shutdown().await;

        let items = cache.get("chat:1").unwrap();
        let m1 = items
            .as_array()
            .unwrap()
            .iter()
            .find(|item| item["id"] == "m1")
            .cloned()
            .unwrap();
        assert_eq!(m1["v"], 20);
        assert_eq!(items.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_handle_still_applies_accepted_events() {
        let cache = cache();
        cache.set("chat:1", json!([]), None);
        let handle = UpdateReconciler::new(cache.clone()).spawn();

        for n in 0..50 {
            let id = format!("m{}", n);
            assert!(handle.submit(PushEvent::insert("message", id.clone(), "chat:1", json!({"id": id}))));
        }
        drop(handle);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let items = cache.get("chat:1").unwrap();
        assert_eq!(items.as_array().unwrap().len(), 50);
    }
}
