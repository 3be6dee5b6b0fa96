// syncd: Replicates the local event log to the cloud and applies downlinks.

use std::path::Path;
use std::sync::Arc;
use syncd::controller::ExitReason;
use syncd::manager::SyncManager;
use syncd::storage::SyncStore;
use tokio::sync::{Mutex, watch};
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "syncd starting");

    let cfg = match std::env::args().nth(1) {
        Some(path) => syncd::config::load_config_from_path(Path::new(&path)),
        None => syncd::config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => {
            info!(base_url = %cfg.cloud.base_url, "config loaded");
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let store = match SyncStore::open(Path::new(&cfg.event_storage.sqlite_path)) {
        Ok(store) => Arc::new(Mutex::new(store)),
        Err(e) => {
            eprintln!("FATAL: failed to open store: {e}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    let manager = SyncManager::new(cfg, store);
    if let Some(ExitReason::CloudTypeMismatch) = manager.run(shutdown_rx).await {
        std::process::exit(-1);
    }
}
