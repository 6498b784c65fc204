//! Periodic drain of the dirty set into the durable store.
//!
//! Each cycle snapshots the dirty names and flushes them one by one.
//! Failures are isolated per name: a failing durable write leaves that
//! name queued for the next cycle and never blocks the rest. The cadence
//! is the explicit `flush_interval_secs` configuration value (default 10).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::cache::{DocCache, FlushOutcome};

/// Counts from one flush cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushCycle {
    /// Names written durably this cycle.
    pub flushed: u64,
    /// Dirty names that had no live cache entry and were dropped.
    pub missing: u64,
    /// Names whose durable write failed and stay queued.
    pub failed: u64,
}

/// Background task draining the persistence cache.
pub struct Flusher {
    cache: Arc<DocCache>,
    interval: Duration,
}

impl Flusher {
    pub fn new(cache: Arc<DocCache>, interval: Duration) -> Self {
        Self { cache, interval }
    }

    /// Run one flush cycle synchronously. Also the CLI entry point.
    pub async fn run_cycle(&self) -> FlushCycle {
        let names = self.cache.dirty_docs().await;
        let mut cycle = FlushCycle::default();
        for name in names {
            match self.cache.flush_entry(&name).await {
                Ok(FlushOutcome::Flushed(size)) => {
                    cycle.flushed += 1;
                    log::debug!("flushed '{name}' ({size} bytes)");
                }
                Ok(FlushOutcome::Missing) => {
                    cycle.missing += 1;
                    log::warn!("dirty document '{name}' has no cache entry, dropping");
                }
                Err(e) => {
                    cycle.failed += 1;
                    log::warn!("flush of '{name}' failed, will retry: {e}");
                }
            }
        }
        cycle
    }

    /// Spawn the periodic flush loop. Abort the handle to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.interval);
            loop {
                timer.tick().await;
                self.run_cycle().await;
            }
        })
    }
}
