//! Quill sync server.
//!
//! Configuration comes from the environment:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `QUILL_JWT_SECRET` | HS256 secret for client tokens (required) |
//! | `QUILL_STORAGE_PATH` | RocksDB directory; in-memory store when unset |
//! | `QUILL_BIND_ADDR` / `QUILL_PORT` | Listen address |
//! | `QUILL_DEBOUNCE_MS` / `QUILL_MAX_DEBOUNCE_MS` | Save timing |
//! | `QUILL_BROADCAST_CAPACITY` | Fan-out buffer per document |
//! | `RUST_LOG` | Log filter (default `info`) |

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use quill_collab::{DocumentStore, JwtVerifier, MemoryStore, RocksStore, ServerConfig, StoreConfig, SyncServer};

/// How long shutdown may spend flushing sessions.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    let secret = std::env::var("QUILL_JWT_SECRET").map_err(|_| "QUILL_JWT_SECRET must be set")?;
    if secret.is_empty() {
        return Err("QUILL_JWT_SECRET must not be empty".into());
    }

    let store: Arc<dyn DocumentStore> = match std::env::var("QUILL_STORAGE_PATH") {
        Ok(path) => {
            info!("Opening document store at {path}");
            Arc::new(RocksStore::open(StoreConfig::new(path))?)
        }
        Err(_) => {
            warn!("QUILL_STORAGE_PATH not set, documents are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let server = SyncServer::new(config, Arc::new(JwtVerifier::new(secret.as_bytes())), store);
    info!(
        "Starting Quill sync server (debounce {:?}, max {:?})",
        server.config().debounce,
        server.config().max_debounce
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                return Err(e.into());
            }
        }
        _ = shutdown_signal() => info!("Shutdown requested"),
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, server.shutdown()).await {
        Ok(()) => info!("All sessions flushed"),
        Err(_) => warn!("Shutdown grace period elapsed with sessions still flushing"),
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
