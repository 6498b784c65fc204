//! storectl — inspect and repair the durable document store.
//!
//! ```text
//! storectl <data-dir> list    list documents waiting in the journal
//! storectl <data-dir> flush   replay the journal into the blob store
//! ```
//!
//! `flush` is the crash-recovery path: it loads every journaled blob
//! into the cache and runs one flush cycle, persisting whatever a
//! crashed server left behind. Run it only while the server is down;
//! RocksDB allows a single process.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tandem_sync::{BlobStore, CacheConfig, DocCache, Flusher, RocksStore, StoreConfig};

fn usage() -> ExitCode {
    eprintln!("usage: storectl <data-dir> <list|flush>");
    ExitCode::from(2)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let (dir, command) = match (args.get(1), args.get(2)) {
        (Some(dir), Some(command)) => (dir.clone(), command.clone()),
        _ => return usage(),
    };

    let store = match RocksStore::open(StoreConfig {
        path: dir.clone().into(),
        ..StoreConfig::default()
    }) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("storectl: cannot open store at {dir}: {e}");
            return ExitCode::FAILURE;
        }
    };

    match command.as_str() {
        "list" => {
            let pending = match store.pending_all() {
                Ok(pending) => pending,
                Err(e) => {
                    eprintln!("storectl: {e}");
                    return ExitCode::FAILURE;
                }
            };
            if pending.is_empty() {
                println!("journal is empty");
                return ExitCode::SUCCESS;
            }
            for (name, blob) in &pending {
                println!("{name}\t{} bytes", blob.len());
            }
            println!("{} document(s) pending", pending.len());
            ExitCode::SUCCESS
        }
        "flush" => {
            let cache = Arc::new(DocCache::new(store, CacheConfig::default()));
            let recovered = match cache.recover().await {
                Ok(recovered) => recovered,
                Err(e) => {
                    eprintln!("storectl: journal replay failed: {e}");
                    return ExitCode::FAILURE;
                }
            };
            let cycle = Flusher::new(cache, Duration::from_secs(1))
                .run_cycle()
                .await;
            println!(
                "recovered {recovered} document(s): {} flushed, {} failed",
                cycle.flushed, cycle.failed
            );
            if cycle.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        _ => usage(),
    }
}
