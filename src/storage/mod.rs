//! Tiered persistence for synchronized documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  full state on   ┌──────────────┐  flush cycle   ┌──────────────┐
//! │ SharedDoc    │  every update    │ DocCache     │  (dirty only)  │ BlobStore    │
//! │ (in-memory)  │ ───────────────► │ hot TTL map  │ ─────────────► │ (RocksDB)    │
//! └──────────────┘                  │ + dirty set  │                └──────┬───────┘
//!                                   └──────┬───────┘                       │
//!                                          │ write-through                 ▼
//!                                          ▼                  ┌───────────────────────┐
//!                                   ┌──────────────┐          │ CF "blobs"   — LZ4    │
//!                                   │ pending      │          │ CF "meta"    — bincode│
//!                                   │ journal      │──────────│ CF "pending" — journal│
//!                                   └──────────────┘          └───────────────────────┘
//! ```
//!
//! The hot tier answers reads without touching disk and absorbs the
//! write rate between flushes; the durable tier is the source of truth.
//! Dirty blobs are mirrored into the pending journal so a crash between
//! merge and flush is recoverable by `storectl flush`.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod blob;
pub mod cache;
pub mod flusher;
pub mod rocks;

pub use blob::{BlobStore, MemoryStore, StoreError};
pub use cache::{CacheConfig, DirtySet, DocCache, FlushOutcome, HotCache};
pub use flusher::{FlushCycle, Flusher};
pub use rocks::{BlobMeta, RocksStore, StoreConfig};
