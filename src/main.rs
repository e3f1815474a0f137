//! Mirror Cache demo harness
//!
//! Wires a feature registry to an in-memory backend and walks through a
//! feed read, a chat push update and an optimistic like, then prints the
//! global statistics as JSON.
//!
//! Configuration comes from `CACHE_*` environment variables, log filtering
//! from `RUST_LOG`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mirror_cache::registry::{FEATURE_CHAT, FEATURE_FEED};
use mirror_cache::sync::page_key;
use mirror_cache::{
    CacheConfig, CacheRegistry, Command, DataSource, InMemoryPushChannel, MutationCoordinator,
    MutationOptions, MutationView, PushEvent, QueryExecutor, QueryOptions, UpdateReconciler,
};

/// Backend stand-in holding authoritative documents.
#[derive(Default)]
struct InMemoryBackend {
    documents: Mutex<HashMap<String, Value>>,
}

impl InMemoryBackend {
    fn seeded() -> Arc<Self> {
        let backend = Self::default();
        {
            let mut documents = backend
                .documents
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            documents.insert(
                "feed:home".to_string(),
                json!([{"id": "p1", "likes": 3}, {"id": "p2", "likes": 0}]),
            );
            documents.insert(
                "chat:general:page:0".to_string(),
                json!({"items": [{"id": "m1", "text": "hello", "seen": false}]}),
            );
        }
        Arc::new(backend)
    }
}

#[async_trait]
impl DataSource for InMemoryBackend {
    async fn fetch(&self, key: &str, _deadline: Option<Instant>) -> anyhow::Result<Value> {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let documents = self
            .documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        documents
            .get(key)
            .cloned()
            .with_context(|| format!("no document for {}", key))
    }
}

/// Increments `likes` on one feed post.
struct LikePost {
    backend: Arc<InMemoryBackend>,
    post_id: String,
}

#[async_trait]
impl Command for LikePost {
    async fn execute(
        &self,
        intent: &MutationView,
        _deadline: Option<Instant>,
    ) -> anyhow::Result<Option<Value>> {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let mut documents = self
            .backend
            .documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let feed = documents
            .get_mut(&intent.key)
            .and_then(Value::as_array_mut)
            .context("feed not found")?;
        let post = feed
            .iter_mut()
            .find(|post| post["id"] == json!(self.post_id))
            .with_context(|| format!("post {} not found", self.post_id))?;
        let likes = post["likes"].as_u64().unwrap_or(0) + 1;
        post["likes"] = json!(likes);
        Ok(Some(Value::Array(feed.clone())))
    }
}

fn liked(feed: &Value, post_id: &str) -> Value {
    let mut feed = feed.clone();
    if let Some(post) = feed
        .as_array_mut()
        .and_then(|posts| posts.iter_mut().find(|post| post["id"] == json!(post_id)))
    {
        let likes = post["likes"].as_u64().unwrap_or(0) + 1;
        post["likes"] = json!(likes);
    }
    feed
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "mirror_cache=info", overridable with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mirror_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Mirror Cache demo");

    let config = CacheConfig::from_env();
    info!(
        "Configuration loaded: max_size={}, default_ttl={}ms, cleanup_interval={}ms, policy={}",
        config.max_size,
        config.default_ttl.as_millis(),
        config.cleanup_interval.as_millis(),
        config.eviction_policy
    );

    let registry = CacheRegistry::with_feature_defaults(config)?;
    let backend = InMemoryBackend::seeded();

    // Feed: concurrent readers share one fetch
    let feed = QueryExecutor::new(
        registry.get_cache(FEATURE_FEED)?,
        backend.clone(),
        QueryOptions::default(),
    );
    let reads = futures::future::join_all((0..4).map(|_| feed.query("feed:home"))).await;
    for read in reads {
        read?;
    }
    info!("Feed loaded by 4 readers");

    // Feed: optimistic like
    let coordinator = MutationCoordinator::new(
        feed.cache().clone(),
        MutationOptions {
            ttl: None,
            timeout: Some(Duration::from_secs(2)),
        },
    );
    let current = feed.query("feed:home").await?;
    let command = Arc::new(LikePost {
        backend: backend.clone(),
        post_id: "p1".to_string(),
    });
    match coordinator
        .mutate("feed:home", liked(&current, "p1"), command)
        .await
    {
        Ok(value) => info!(feed = %value, "Like committed"),
        Err(err) => warn!(error = %err, "Like rolled back"),
    }

    // Chat: push updates patch the cached page
    let chat = QueryExecutor::new(
        registry.get_cache(FEATURE_CHAT)?,
        backend.clone(),
        QueryOptions::default(),
    );
    chat.query(&page_key("chat:general", 0)).await?;

    let channel = InMemoryPushChannel::new();
    let workers = UpdateReconciler::new(chat.cache().clone()).spawn();
    let subscription = workers.attach(&channel);
    channel.publish(PushEvent::insert(
        "message",
        "m2",
        "chat:general",
        json!({"id": "m2", "text": "hi there", "seen": false}),
    ));
    channel.publish(PushEvent::mark_seen("message", "m1", "chat:general"));
    drop(subscription);
    workers.shutdown().await;

    if let Some(page) = chat.cache().get(&page_key("chat:general", 0)) {
        info!(page = %page, "Chat page reconciled");
    }

    let stats = registry.get_global_stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    registry.dispose();
    info!("Demo complete");
    Ok(())
}
