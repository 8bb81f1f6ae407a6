//! blogd - blog post server
//!
//! Serves blog operations over BRP, backed by a document store.

use blogd_server::metrics::run_metrics_server;
use blogd_server::{Config, Metrics, Server, ServerConfig};
use blogd_storage::Database;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if BLOGD_CONFIG is set, then env overrides)
    let config = Config::load().map_err(|e| {
        tracing::error!("Failed to load config: {}", e);
        e
    })?;
    if let Ok(path) = std::env::var("BLOGD_CONFIG") {
        tracing::info!("Loaded config from {}", path);
    }

    tracing::info!("Starting blogd server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    match config.storage.data_dir {
        Some(ref dir) => tracing::info!("  Data directory: {}", dir.display()),
        None => tracing::info!("  Data directory: none (in-memory)"),
    }
    tracing::info!(
        "  Collection: {}.{}",
        config.storage.database,
        config.storage.collection
    );

    let database = Database::open(config.storage.database_config())?;
    let collection = database.collection(&config.storage.collection)?;

    let mut server_config = ServerConfig::from(&config.network);
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        tracing::info!("  Metrics: http://{}/metrics", config.metrics.bind_addr);
        Some(metrics)
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    // Bind the metrics port up front so a taken port fails startup
    let metrics_listener = match metrics {
        Some(metrics) => {
            let listener = TcpListener::bind(config.metrics.bind_addr)
                .await
                .map_err(|e| {
                    tracing::error!(
                        "Failed to bind metrics address {}: {}",
                        config.metrics.bind_addr,
                        e
                    );
                    e
                })?;
            Some((listener, metrics))
        }
        None => None,
    };

    let server = Arc::new(Server::new(server_config, collection));

    let metrics_handle = metrics_listener.map(|(listener, metrics)| {
        let shutdown = server.shutdown_signal();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(listener, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        })
    });

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown and drain)
    let result = server.run().await;
    if result.is_err() {
        server.shutdown();
    }

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    // Flush collections before exit
    if let Err(e) = database.close() {
        tracing::error!("Failed to close database: {}", e);
        return Err(e.into());
    }

    result?;
    tracing::info!("Server stopped");
    Ok(())
}
