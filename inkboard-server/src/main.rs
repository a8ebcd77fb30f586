//! Inkboard sync server.
//!
//! Configuration comes from `INKBOARD_*` environment variables (see
//! `ServerConfig::from_env`); logging from `RUST_LOG` (default `info`).

use log::{error, info};
use std::sync::Arc;

use inkboard_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    info!(
        "Starting inkboard on {} (storage: {})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string())
    );

    let server = Arc::new(SyncServer::new(config));

    let runner = server.clone();
    tokio::select! {
        result = runner.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
            }
        }
    }

    server.persist_all().await;
    info!("Bye");
}
