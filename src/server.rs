//! Sync server: accept loop, component wiring, and lifecycle.
//!
//! ```text
//!   ws connect ──▶ accept loop ──▶ doc name ──▶ registry ──▶ connection task
//!                                                  │
//!                       update events              ▼
//!   flusher ◀── dirty set ◀── event pump ◀── SharedDoc broadcast
//!      │
//!      ▼
//!   durable store                sweeper ──▶ evict idle documents
//! ```
//!
//! One `SyncServer` owns the whole component graph: the tiered cache, the
//! registry, the event pump staging updated documents into the cache, the
//! flusher, and the idle sweeper. `run_until` serves until the supplied
//! future resolves, then drains: close connections, drain the registry,
//! flush once more, exit.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

use crate::config::Config;
use crate::connection::{self, ConnCounters, ConnOptions, SyncError};
use crate::doc::DocEvent;
use crate::registry::{DocRegistry, RegistryConfig};
use crate::storage::{BlobStore, CacheConfig, DocCache, Flusher, RocksStore, StoreConfig};

/// Eviction sweep cadence.
const SWEEP_INTERVAL_SECS: u64 = 60;

/// Point-in-time server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub documents_open: usize,
    pub documents_dirty: usize,
}

/// The sync server.
pub struct SyncServer {
    config: Config,
    cache: Arc<DocCache>,
    registry: Arc<DocRegistry>,
    counters: Arc<ConnCounters>,
    shutdown_tx: watch::Sender<bool>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DocEvent>>>,
}

impl SyncServer {
    /// Open the durable store under `config.data_dir` and wire the
    /// component graph.
    pub fn new(config: Config) -> Result<Self, SyncError> {
        let store_config = StoreConfig {
            path: config.data_dir.clone(),
            ..StoreConfig::default()
        };
        let store = Arc::new(RocksStore::open(store_config)?);
        Ok(Self::with_store(config, store))
    }

    /// Wire against a caller-supplied durable store. Tests use this with
    /// the in-memory backend.
    pub fn with_store(config: Config, store: Arc<dyn BlobStore>) -> Self {
        let cache = Arc::new(DocCache::new(
            store,
            CacheConfig {
                ttl_secs: config.cache_ttl_secs,
            },
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(DocRegistry::new(
            cache.clone(),
            events_tx,
            RegistryConfig {
                broadcast_capacity: config.broadcast_capacity,
                doc_idle_secs: config.doc_idle_secs,
            },
        ));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            cache,
            registry,
            counters: Arc::new(ConnCounters::default()),
            shutdown_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Snapshot of traffic counters and component gauges.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            documents_open: self.registry.len().await,
            documents_dirty: self.cache.dirty_docs().await.len(),
        }
    }

    /// Serve until the process is killed.
    pub async fn run(&self) -> Result<(), SyncError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `shutdown` resolves, then drain and flush everything.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), SyncError>
    where
        F: Future<Output = ()>,
    {
        let recovered = self.cache.recover().await?;
        if recovered > 0 {
            log::info!("recovered {recovered} unflushed document(s) from the journal");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("listening on {}", self.config.bind_addr);

        let flusher = Flusher::new(
            self.cache.clone(),
            Duration::from_secs(self.config.flush_interval_secs),
        );
        let flush_task = flusher.spawn();
        let sweep_task = self
            .registry
            .clone()
            .spawn_sweeper(Duration::from_secs(SWEEP_INTERVAL_SECS));
        let pump_task = self.spawn_event_pump().await?;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("tcp connection from {addr}");
                    let registry = self.registry.clone();
                    let counters = self.counters.clone();
                    let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs);
                    let shutdown_rx = self.shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_socket(stream, registry, counters, heartbeat, shutdown_rx).await
                        {
                            log::warn!("connection from {addr} failed: {e}");
                        }
                    });
                }
            }
        }

        log::info!("shutting down");
        let _ = self.shutdown_tx.send(true);
        self.wait_for_connection_drain().await;
        sweep_task.abort();
        flush_task.abort();
        pump_task.abort();

        let drained = self.registry.shutdown().await;
        let final_flush = Flusher::new(
            self.cache.clone(),
            Duration::from_secs(self.config.flush_interval_secs),
        );
        let cycle = final_flush.run_cycle().await;
        log::info!(
            "drained {} document(s), final flush persisted {}",
            drained,
            cycle.flushed
        );
        Ok(())
    }

    /// Stage every document update into the cache as it happens; surface
    /// document-level errors in the log.
    async fn spawn_event_pump(&self) -> Result<JoinHandle<()>, SyncError> {
        let Some(mut rx) = self.events_rx.lock().await.take() else {
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "server already running",
            )));
        };
        let cache = self.cache.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    DocEvent::Updated { name, state } => {
                        if let Err(e) = cache.write(&name, state).await {
                            log::error!("failed to stage '{}' after update: {}", name, e);
                        }
                    }
                    DocEvent::Error { name, detail } => {
                        log::warn!("document '{}': {}", name, detail);
                    }
                }
            }
        }))
    }

    async fn wait_for_connection_drain(&self) {
        for _ in 0..100 {
            if self.counters.active_connections.load(Ordering::Relaxed) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        log::warn!(
            "{} connection(s) still open after drain wait",
            self.counters.active_connections.load(Ordering::Relaxed)
        );
    }
}

/// Upgrade one TCP stream, resolve its document, and serve it to close.
async fn handle_socket(
    stream: TcpStream,
    registry: Arc<DocRegistry>,
    counters: Arc<ConnCounters>,
    heartbeat: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<(), SyncError> {
    // The request path is only visible during the websocket handshake.
    let path: Arc<std::sync::Mutex<Option<String>>> = Arc::new(std::sync::Mutex::new(None));
    let holder = path.clone();
    let ws = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
        if let Ok(mut slot) = holder.lock() {
            *slot = Some(req.uri().path().to_string());
        }
        Ok(resp)
    })
    .await?;

    let name = {
        let captured = path.lock().ok().and_then(|mut slot| slot.take());
        doc_name_from_path(captured.as_deref().unwrap_or(""))
    };

    let options = ConnOptions::default();
    let doc = registry.get_or_create(&name, options.gc_enabled).await?;
    connection::serve_connection(ws, doc, options, heartbeat, counters, shutdown).await
}

/// Derive the document name from the request path: leading slash and any
/// query stripped, percent-encoding decoded. Malformed escapes are kept
/// literal rather than rejected.
fn doc_name_from_path(path: &str) -> String {
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.split('?').next().unwrap_or("");
    percent_decode(path)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_doc_name_plain() {
        assert_eq!(doc_name_from_path("/notes"), "notes");
    }

    #[test]
    fn test_doc_name_keeps_inner_slashes() {
        assert_eq!(doc_name_from_path("/team/standup"), "team/standup");
    }

    #[test]
    fn test_doc_name_strips_query() {
        assert_eq!(doc_name_from_path("/notes?token=abc&x=1"), "notes");
    }

    #[test]
    fn test_doc_name_percent_decoded() {
        assert_eq!(doc_name_from_path("/meeting%20notes"), "meeting notes");
        assert_eq!(doc_name_from_path("/%E2%9C%93"), "\u{2713}");
    }

    #[test]
    fn test_doc_name_malformed_escape_kept_literal() {
        assert_eq!(doc_name_from_path("/50%25off"), "50%off");
        assert_eq!(doc_name_from_path("/bad%zzescape"), "bad%zzescape");
        assert_eq!(doc_name_from_path("/trailing%2"), "trailing%2");
    }

    #[test]
    fn test_doc_name_empty_path() {
        assert_eq!(doc_name_from_path("/"), "");
        assert_eq!(doc_name_from_path(""), "");
    }

    #[tokio::test]
    async fn test_fresh_server_stats_are_zero() {
        let server = SyncServer::with_store(Config::default(), Arc::new(MemoryStore::new()));
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.documents_open, 0);
        assert_eq!(stats.documents_dirty, 0);
    }
}
