//! Document registry: the single authority mapping names to live documents.
//!
//! ```text
//!   connection ──get_or_create──▶ ┌──────────────┐      miss      ┌──────────┐
//!                                 │   registry   │ ─────read────▶ │  cache   │
//!   sweeper ───────evict_idle───▶ │  (live map)  │ ─────write───▶ │ (tiered) │
//!   shutdown ────────drain──────▶ └──────────────┘                └──────────┘
//! ```
//!
//! The registry owns the document lifecycle end to end: materialization
//! from the persistence cache, idle eviction, and the shutdown drain. It
//! is constructed once and injected wherever documents are needed; nothing
//! else creates or drops a `SharedDoc`.
//!
//! Lock order is registry map before document state, everywhere. The
//! reverse order never occurs, so the two lock layers cannot deadlock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::doc::{DocEvent, SharedDoc};
use crate::storage::{DocCache, StoreError};

/// Lifecycle policy knobs for the registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity of each document's broadcast channel.
    pub broadcast_capacity: usize,
    /// A document with no connections is evicted once idle this long.
    pub doc_idle_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            doc_idle_secs: 300,
        }
    }
}

/// Maps document names to resident instances, race-free.
pub struct DocRegistry {
    docs: RwLock<HashMap<String, Arc<SharedDoc>>>,
    cache: Arc<DocCache>,
    events: mpsc::UnboundedSender<DocEvent>,
    config: RegistryConfig,
}

impl DocRegistry {
    pub fn new(
        cache: Arc<DocCache>,
        events: mpsc::UnboundedSender<DocEvent>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            cache,
            events,
            config,
        }
    }

    /// Look up a document, materializing it from the cache on first use.
    ///
    /// Concurrent callers for the same name always receive the same
    /// instance: the shared-lock fast path serves residents, and racing
    /// creators re-check under the exclusive lock before inserting.
    /// `gc_enabled` only takes effect for the caller that creates the
    /// instance; later callers get whatever was created.
    pub async fn get_or_create(
        &self,
        name: &str,
        gc_enabled: bool,
    ) -> Result<Arc<SharedDoc>, StoreError> {
        {
            let docs = self.docs.read().await;
            if let Some(doc) = docs.get(name) {
                return Ok(doc.clone());
            }
        }

        let blob = self.cache.read(name).await?;

        let mut docs = self.docs.write().await;
        if let Some(doc) = docs.get(name) {
            return Ok(doc.clone());
        }
        let doc = Arc::new(SharedDoc::new(
            name,
            gc_enabled,
            self.config.broadcast_capacity,
            self.events.clone(),
        ));
        if let Some(blob) = blob {
            doc.load_state(&blob)
                .await
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        }
        docs.insert(name.to_string(), doc.clone());
        log::debug!("materialized document '{}'", name);
        Ok(doc)
    }

    /// Evict documents that have no connections and have been idle past
    /// the configured threshold. Each victim's state is staged into the
    /// cache (hot tier plus dirty mark) before the instance is dropped,
    /// so the flusher persists it and no acknowledged edit is lost.
    ///
    /// Returns the number of documents evicted.
    pub async fn evict_idle(&self) -> usize {
        let idle = Duration::from_secs(self.config.doc_idle_secs);
        let candidates: Vec<String> = {
            let docs = self.docs.read().await;
            let mut names = Vec::new();
            for (name, doc) in docs.iter() {
                if doc.connection_count().await == 0 && doc.idle_for().await >= idle {
                    names.push(name.clone());
                }
            }
            names
        };
        if candidates.is_empty() {
            return 0;
        }

        let mut evicted = 0;
        let mut docs = self.docs.write().await;
        for name in candidates {
            let Some(doc) = docs.get(&name) else { continue };
            // Re-check under the exclusive lock: the candidate scan ran
            // without it. A strong count above one means some task still
            // holds a handle and could register a connection; leave the
            // document for the next sweep.
            if doc.connection_count().await != 0
                || doc.idle_for().await < idle
                || Arc::strong_count(doc) > 1
            {
                continue;
            }
            let state = doc.encode_state().await;
            if let Err(e) = self.cache.write(&name, state).await {
                log::warn!("eviction of '{}' deferred, staging failed: {}", name, e);
                continue;
            }
            docs.remove(&name);
            evicted += 1;
            log::debug!("evicted idle document '{}'", name);
        }
        evicted
    }

    /// Drain every resident document into the cache and empty the map.
    /// Called once during shutdown, after the accept loop has stopped; a
    /// final flush cycle then pushes the staged state to the durable
    /// store.
    ///
    /// Returns the number of documents drained.
    pub async fn shutdown(&self) -> usize {
        let mut docs = self.docs.write().await;
        let mut drained = 0;
        for (name, doc) in docs.drain() {
            let state = doc.encode_state().await;
            match self.cache.write(&name, state).await {
                Ok(()) => drained += 1,
                Err(e) => log::error!("shutdown: failed to stage '{}': {}", name, e),
            }
        }
        drained
    }

    /// Run `evict_idle` forever on a fixed cadence.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = self.evict_idle().await;
                if evicted > 0 {
                    log::info!("idle sweep evicted {} document(s)", evicted);
                }
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}
