//! Tiered persistence cache: TTL'd hot tier fronting the durable store.
//!
//! The hot tier is an in-process map; entries expire a fixed TTL after the
//! write or durable load that produced them, and reads never refresh the
//! clock. The dirty set tracks names with cache writes not yet reflected
//! durably. Both structures are mirrored into the store's pending journal
//! so `storectl` can drain a crashed process's unflushed work.
//!
//! The cache is not authoritative: a miss falls through to the durable
//! store, and a successful load repopulates the hot tier.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use super::blob::{BlobStore, StoreError};

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Hot-tier entry lifetime in seconds (default: 1800)
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 1800 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

struct HotEntry {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// TTL-bounded in-process key-value tier.
pub struct HotCache {
    entries: RwLock<HashMap<String, HotEntry>>,
    ttl: Duration,
}

impl HotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Insert with a fresh TTL, replacing any previous entry.
    pub async fn set(&self, name: &str, bytes: Vec<u8>) {
        let entry = HotEntry {
            bytes,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().await.insert(name.to_owned(), entry);
    }

    /// Fetch an unexpired entry. Expiry is lazy: a dead entry is dropped
    /// on the read that finds it. Reads do not refresh the TTL.
    pub async fn get(&self, name: &str) -> Option<Vec<u8>> {
        {
            let entries = self.entries.read().await;
            match entries.get(name) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.bytes.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: re-check under the write lock before removing, the
        // entry may have been replaced since the read.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(name) {
            if entry.expires_at > Instant::now() {
                return Some(entry.bytes.clone());
            }
            entries.remove(name);
        }
        None
    }

    /// Number of resident entries, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Concurrent set of document names pending flush.
#[derive(Default)]
pub struct DirtySet {
    members: Mutex<HashSet<String>>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: returns false when the name was already marked.
    pub async fn add(&self, name: &str) -> bool {
        self.members.lock().await.insert(name.to_owned())
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.members.lock().await.remove(name)
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.members.lock().await.contains(name)
    }

    pub async fn members(&self) -> Vec<String> {
        self.members.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }
}

/// Outcome of flushing one name.
#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Blob written durably; carries the uncompressed size.
    Flushed(usize),
    /// No live cache entry; the name was dropped from the dirty set.
    Missing,
}

/// The persistence cache: hot tier + dirty set over a durable store.
pub struct DocCache {
    hot: HotCache,
    dirty: DirtySet,
    store: Arc<dyn BlobStore>,
}

impl DocCache {
    pub fn new(store: Arc<dyn BlobStore>, config: CacheConfig) -> Self {
        Self {
            hot: HotCache::new(config.ttl()),
            dirty: DirtySet::new(),
            store,
        }
    }

    /// Repopulate the hot tier and dirty set from the pending journal.
    /// Returns the number of recovered entries.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let entries = self.store.pending_all()?;
        let count = entries.len();
        for (name, bytes) in entries {
            self.hot.set(&name, bytes).await;
            self.dirty.add(&name).await;
        }
        if count > 0 {
            log::info!("recovered {count} unflushed document(s) from the pending journal");
        }
        Ok(count)
    }

    /// Read path: hot tier first, then the durable store. `Ok(None)` is
    /// the explicit no-document outcome; a store failure aborts the load.
    pub async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(bytes) = self.hot.get(name).await {
            return Ok(Some(bytes));
        }
        match self.store.get(name)? {
            Some(bytes) => {
                self.hot.set(name, bytes.clone()).await;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    /// Write path: refresh the hot entry, mark dirty, mirror to the
    /// pending journal.
    pub async fn write(&self, name: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.store.pending_put(name, &bytes)?;
        self.hot.set(name, bytes).await;
        self.dirty.add(name).await;
        Ok(())
    }

    /// Names currently pending flush.
    pub async fn dirty_docs(&self) -> Vec<String> {
        self.dirty.members().await
    }

    pub async fn is_dirty(&self, name: &str) -> bool {
        self.dirty.contains(name).await
    }

    /// Flush one name to the durable store.
    ///
    /// A missing hot entry drops the name from the dirty set with nothing
    /// persisted and no retry. A durable write failure leaves the name
    /// marked so the next cycle retries; a write racing the flush may
    /// re-mark the name immediately after it is cleared, which the next
    /// cycle self-corrects.
    pub async fn flush_entry(&self, name: &str) -> Result<FlushOutcome, StoreError> {
        let bytes = match self.hot.get(name).await {
            Some(bytes) => bytes,
            None => {
                self.dirty.remove(name).await;
                self.store.pending_remove(name)?;
                return Ok(FlushOutcome::Missing);
            }
        };
        self.store.put(name, &bytes)?;
        self.dirty.remove(name).await;
        self.store.pending_remove(name)?;
        Ok(FlushOutcome::Flushed(bytes.len()))
    }
}
