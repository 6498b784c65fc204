//! RocksDB-backed durable blob store.
//!
//! Column families:
//! - `blobs`   — full document states, one per name (LZ4 compressed)
//! - `meta`    — per-document metadata (bincode: sizes, timestamps, flushes)
//! - `pending` — journal of not-yet-flushed blobs (LZ4 compressed)
//!
//! Every flush is a full overwrite of the `blobs` entry; there is no
//! version history at this layer. The `pending` column family mirrors the
//! cache's dirty blobs so a crash between merge and flush leaves nothing
//! behind that `storectl flush` cannot drain.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::blob::{BlobStore, StoreError};

/// Column family names.
const CF_BLOBS: &str = "blobs";
const CF_META: &str = "meta";
const CF_PENDING: &str = "pending";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_BLOBS, CF_META, CF_PENDING];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Metadata stored alongside each durable blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMeta {
    /// Document name (also the key)
    pub name: String,
    /// Uncompressed blob size in bytes
    pub size: u64,
    /// Compressed blob size in bytes
    pub compressed_size: u64,
    /// Number of flushes that reached this entry
    pub flush_count: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last flush timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl BlobMeta {
    fn new(name: &str) -> Self {
        let now = unix_now();
        Self {
            name: name.to_owned(),
            size: 0,
            compressed_size: 0,
            flush_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed blob store.
///
/// Blobs and journal entries are LZ4 compressed; blob writes update the
/// metadata record in the same atomic batch.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_BLOBS => {
                // Full overwrites of point-looked-up keys
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_META => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_PENDING => {
                // Rewritten on every dirty write; speed over ratio
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Load metadata for a document, `None` if never flushed.
    pub fn load_meta(&self, name: &str) -> Result<Option<BlobMeta>, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, name.as_bytes())? {
            Some(bytes) => Ok(Some(BlobMeta::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

impl BlobStore for RocksStore {
    fn put(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let cf_blobs = self.cf(CF_BLOBS)?;
        let cf_meta = self.cf(CF_META)?;

        let compressed = lz4_flex::compress_prepend_size(bytes);

        let mut meta = self
            .load_meta(name)?
            .unwrap_or_else(|| BlobMeta::new(name));
        meta.size = bytes.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.flush_count += 1;
        meta.updated_at = unix_now();

        // Atomic batch: blob + metadata
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_blobs, name.as_bytes(), &compressed);
        batch.put_cf(cf_meta, name.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_BLOBS)?;
        match self.db.get_cf(cf, name.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }

    fn pending_put(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let compressed = lz4_flex::compress_prepend_size(bytes);
        // No fsync: the journal narrows the loss window, it is not a WAL
        self.db.put_cf(cf, name.as_bytes(), &compressed)?;
        Ok(())
    }

    fn pending_remove(&self, name: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_PENDING)?;
        self.db.delete_cf(cf, name.as_bytes())?;
        Ok(())
    }

    fn pending_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let name = std::str::from_utf8(&key)
                .map_err(|_| StoreError::DeserializationError("Invalid UTF-8 key".into()))?
                .to_owned();
            let bytes = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            entries.push((name, bytes));
        }
        Ok(entries)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
