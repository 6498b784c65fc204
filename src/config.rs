//! Runtime configuration.
//!
//! Plain struct with defaults; `from_env` overlays `TANDEM_*` environment
//! variables. Unset or unparseable values fall back to the default, so a
//! bare process always starts.

use std::env;
use std::path::PathBuf;

/// Aggregated server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address the WebSocket listener binds. `TANDEM_BIND_ADDR`
    pub bind_addr: String,
    /// Directory for the durable store. `TANDEM_DATA_DIR`
    pub data_dir: PathBuf,
    /// Hot-cache entry lifetime. `TANDEM_CACHE_TTL_SECS`
    pub cache_ttl_secs: u64,
    /// Dirty-set flush cadence. `TANDEM_FLUSH_INTERVAL_SECS`
    pub flush_interval_secs: u64,
    /// Ping cadence; one unanswered interval closes the connection.
    /// `TANDEM_HEARTBEAT_SECS`
    pub heartbeat_interval_secs: u64,
    /// Idle time before a connectionless document is evicted.
    /// `TANDEM_DOC_IDLE_SECS`
    pub doc_idle_secs: u64,
    /// Per-document broadcast channel capacity. `TANDEM_BROADCAST_CAPACITY`
    pub broadcast_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            data_dir: PathBuf::from("tandem_data"),
            cache_ttl_secs: 1800,
            flush_interval_secs: 10,
            heartbeat_interval_secs: 30,
            doc_idle_secs: 300,
            broadcast_capacity: 256,
        }
    }
}

impl Config {
    /// Read configuration from the environment.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            bind_addr: env::var("TANDEM_BIND_ADDR").unwrap_or(defaults.bind_addr),
            data_dir: env::var("TANDEM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            cache_ttl_secs: env_u64("TANDEM_CACHE_TTL_SECS", defaults.cache_ttl_secs),
            flush_interval_secs: env_u64(
                "TANDEM_FLUSH_INTERVAL_SECS",
                defaults.flush_interval_secs,
            ),
            heartbeat_interval_secs: env_u64(
                "TANDEM_HEARTBEAT_SECS",
                defaults.heartbeat_interval_secs,
            ),
            doc_idle_secs: env_u64("TANDEM_DOC_IDLE_SECS", defaults.doc_idle_secs),
            broadcast_capacity: env_u64(
                "TANDEM_BROADCAST_CAPACITY",
                defaults.broadcast_capacity as u64,
            ) as usize,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            log::warn!("ignoring unparseable {key}={v}, using {default}");
            default
        }),
        Err(_) => default,
    }
}
