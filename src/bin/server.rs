//! curator HTTP server binary.
//!
//! Starts the curator facade and an axum server over it.
//!
//! # Environment Variables
//!
//! - `PORT`: HTTP port (default: 8080)
//! - `CURATOR_CONFIG`: Path to a YAML configuration file (optional)
//! - `CURATOR_CONSUL_ADDR`, `CURATOR_CONSUL_TOKEN`: Consul backend
//! - `CURATOR_HEARTBEAT_TIMEOUT_SECS`, `CURATOR_ENFORCEMENT`: overrides
//! - `CURATOR_TRUST_FORWARDED_ROLES`: honour `x-roles` (only behind a proxy
//!   that sets it)
//! - `RUST_LOG`: Tracing filter (default: "info,curator=debug")
//!
//! # Usage
//!
//! ```bash
//! CURATOR_CONFIG=curator.yaml cargo run --bin server
//! ```

use std::sync::Arc;

use anyhow::Context;
use curator::config::CuratorConfig;
use curator::docs::LogSink;
use curator::server::{app_router, AppState};
use curator::Curator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `init` also routes `log` records from the library into tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,curator=debug".into()),
        )
        .init();

    let mut config = match std::env::var("CURATOR_CONFIG") {
        Ok(path) => CuratorConfig::from_yaml_file(&path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        Err(_) => CuratorConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("invalid environment override")?;

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_addr = format!("0.0.0.0:{}", port);

    let curator = Curator::builder(config)
        .documentation_sink(Arc::new(LogSink))
        .build()
        .context("failed to build curator")?;
    curator.initialize().await.context("failed to initialize curator")?;

    let app = app_router(AppState::new(curator.clone()));

    tracing::info!("curator server starting on {}", bind_addr);
    tracing::info!(
        "Enforcement: {:?}, discovery backend: {}, forwarded roles: {}",
        curator.config().enforcement,
        if curator.config().consul.is_some() { "consul" } else { "none" },
        if curator.config().trust_forwarded_roles { "trusted" } else { "ignored" }
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    let shutdown = curator.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            tracing::info!("Shutdown signal received");
            if let Err(e) = shutdown.begin_shutdown() {
                tracing::warn!("Could not begin shutdown: {}", e);
            }
        })
        .await
        .context("server failed")?;

    curator.shutdown().await.context("curator shutdown failed")?;
    tracing::info!("curator stopped");
    Ok(())
}
