//! Durable blob store seam.
//!
//! The sync core persists one opaque blob per document name, full
//! overwrite on every flush. `Ok(None)` from [`BlobStore::get`] is the
//! normal "no such document" outcome so callers can initialize a fresh
//! replica; only real backend failures surface as [`StoreError`].
//!
//! The pending journal rides on the same trait: every unflushed blob is
//! mirrored there by the cache layer and cleared on flush, so whatever
//! outlives a crash can be drained offline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable backing store for document blobs plus the pending-flush journal.
pub trait BlobStore: Send + Sync {
    /// Store the blob for a document, replacing any previous value.
    fn put(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Fetch the blob for a document. `Ok(None)` means the store holds no
    /// entry, a normal outcome distinct from a backend failure.
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Record a not-yet-flushed blob in the pending journal.
    fn pending_put(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Drop a document from the pending journal.
    fn pending_remove(&self, name: &str) -> Result<(), StoreError>;

    /// Every journaled document with its blob.
    fn pending_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

/// In-memory store for tests and embedders that bring their own durability.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    pending: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail, for failure-injection in tests.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("blob map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryStore {
    fn put(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("injected put failure".into()));
        }
        self.blobs
            .lock()
            .expect("blob map poisoned")
            .insert(name.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .blobs
            .lock()
            .expect("blob map poisoned")
            .get(name)
            .cloned())
    }

    fn pending_put(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(name.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn pending_remove(&self, name: &str) -> Result<(), StoreError> {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .remove(name);
        Ok(())
    }

    fn pending_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .pending
            .lock()
            .expect("pending map poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let store = MemoryStore::new();
        store.put("doc-a", b"payload").unwrap();
        assert_eq!(store.get("doc-a").unwrap(), Some(b"payload".to_vec()));
    }

    #[test]
    fn test_get_missing_is_none() {
        let store = MemoryStore::new();
        assert_eq!(store.get("nope").unwrap(), None);
    }

    #[test]
    fn test_put_overwrites() {
        let store = MemoryStore::new();
        store.put("doc-a", b"v1").unwrap();
        store.put("doc-a", b"v2").unwrap();
        assert_eq!(store.get("doc-a").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_injected_put_failure() {
        let store = MemoryStore::new();
        store.set_fail_puts(true);
        assert!(store.put("doc-a", b"x").is_err());
        store.set_fail_puts(false);
        assert!(store.put("doc-a", b"x").is_ok());
    }

    #[test]
    fn test_pending_journal_lifecycle() {
        let store = MemoryStore::new();
        store.pending_put("doc-a", b"dirty").unwrap();
        store.pending_put("doc-a", b"dirtier").unwrap();
        store.pending_put("doc-b", b"x").unwrap();

        let mut all = store.pending_all().unwrap();
        all.sort();
        assert_eq!(
            all,
            vec![
                ("doc-a".to_owned(), b"dirtier".to_vec()),
                ("doc-b".to_owned(), b"x".to_vec()),
            ]
        );

        store.pending_remove("doc-a").unwrap();
        assert_eq!(store.pending_all().unwrap().len(), 1);
    }
}
