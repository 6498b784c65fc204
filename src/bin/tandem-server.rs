//! tandem-server — standalone document sync server.
//!
//! Configuration comes from `TANDEM_*` environment variables; see
//! [`tandem_sync::Config`]. Runs until Ctrl-C, then drains connections
//! and flushes every dirty document before exiting.

use log::info;
use tandem_sync::{Config, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::from_env();
    info!(
        "starting tandem-server (data dir: {})",
        config.data_dir.display()
    );

    let server = SyncServer::new(config)?;
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("ctrl-c received");
        })
        .await?;
    Ok(())
}
