//! muxrpc-registry - standalone service registry daemon
//!
//! Maintains a liveness-filtered table of RPC servers per service name and
//! exposes it over HTTP for heartbeats and discovery.

use muxrpc_registry::{run_http, Registry, RegistryConfig};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match RegistryConfig::load() {
        Ok(config) => {
            if let Ok(path) = std::env::var("MUXRPC_REGISTRY_CONFIG") {
                tracing::info!("loaded config from {}", path);
            }
            config
        }
        Err(e) => {
            tracing::error!("failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("starting muxrpc registry");
    tracing::info!("  bind address: {}", config.bind_addr);
    tracing::info!("  path: {}", config.path);
    if config.timeout_secs == 0 {
        tracing::info!("  entry expiry: disabled");
    } else {
        tracing::info!("  entry timeout: {}s", config.timeout_secs);
    }

    let registry = Arc::new(Registry::new(config.timeout()));
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("received shutdown signal, stopping registry...");
        let _ = shutdown_tx.send(());
    });

    run_http(registry, listener, config.path, shutdown_rx).await?;

    tracing::info!("registry stopped");
    Ok(())
}
