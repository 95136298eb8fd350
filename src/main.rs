//! lw3 - LW3 remote-object server
//!
//! Serves a tree of nodes, properties and methods over the LW3 text protocol.

use lw3_server::{
    create_tls_acceptor, run_metrics_server, Config, Metrics, Server, ServerConfig,
};
use lw3_tree::Tree;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if LW3_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("LW3_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting lw3 server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Transport: {}", config.network.transport);
    tracing::info!("  Max connections: {}", config.network.max_connections);

    // Seed the tree
    let tree = Tree::new();
    match config.tree.seed_path {
        Some(ref path) => {
            tree.load_json(path)?;
            tracing::info!("  Tree seeded from {}", path.display());
        }
        None => tracing::info!("  Tree: empty"),
    }

    let mut server_config = ServerConfig::from_network(&config.network);

    if config.tls.enabled {
        server_config = server_config.with_tls(create_tls_acceptor(&config.tls)?);
        tracing::info!("  TLS: enabled");
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
    } else {
        tracing::info!("  TLS: disabled");
    }

    if let Some(credentials) = config.auth.credentials() {
        tracing::info!("  Auth: enabled for user '{}'", credentials.username);
        server_config = server_config.with_credentials(credentials);
    }

    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        Some(metrics)
    } else {
        None
    };

    let server = Arc::new(Server::new(server_config, tree));

    let metrics_handle = metrics.map(|metrics| {
        let addr = config.metrics.bind_addr;
        let shutdown = server.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
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

    // Run server (blocks until shutdown)
    server.run().await?;

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
