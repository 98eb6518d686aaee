//! # Presence Relay
//!
//! Bridges browser WebSocket clients to a shared presence mesh.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! presence-relay
//!
//! # Run against an in-process mesh
//! PRESENCE__MESH__ADDRESS=loopback presence-relay
//!
//! # Run with environment overrides
//! PRESENCE__PORT=8080 PRESENCE__HOST=0.0.0.0 MESH_ID=eu-west presence-relay
//! ```

mod config;
mod handlers;
mod mesh;
mod metrics;

use anyhow::Result;
use presence_transport::{LoopbackConnector, MeshConnector, MeshWriter, TcpConfig, TcpConnector};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "presence_relay=debug,presence_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    info!(
        "Starting presence relay {} on {}:{}",
        config.mesh.mesh_id, config.host, config.port
    );

    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let connector: Arc<dyn MeshConnector> = if config.mesh.is_loopback() {
        info!("Using in-process loopback mesh");
        Arc::new(LoopbackConnector::new())
    } else {
        Arc::new(TcpConnector::new(TcpConfig {
            name: format!("presence-relay/{}", config.mesh.mesh_id),
            credential: config.mesh.credential(),
            connect_timeout: config.mesh.connect_timeout(),
        }))
    };

    let writer = Arc::new(MeshWriter::spawn_with_config(
        connector.clone(),
        config.mesh.address.clone(),
        config.mesh.writer_config(),
    ));
    let state = Arc::new(handlers::AppState::new(config.clone(), writer.clone()));

    let (stop, shutdown) = watch::channel(false);
    let inbound = mesh::spawn_inbound(
        connector,
        config.mesh.address.clone(),
        config.mesh.reconnect_delay(),
        state.processor(),
        shutdown,
    );

    let stopping = state.shutdown.clone();
    handlers::run_server(state.clone(), async move {
        shutdown_signal().await;
        stopping.cancel();
    })
    .await?;

    // Connections queue their offline events before the writer closes
    state.drain(config.relay.drain_timeout()).await;

    let _ = stop.send(true);
    if let Err(e) = inbound.await {
        warn!(error = %e, "Mesh inbound task failed");
    }
    writer.shutdown().await;

    let stats = writer.stats();
    info!(
        written = stats.written(),
        dropped = stats.dropped(),
        reconnects = stats.reconnects(),
        "Presence relay stopped"
    );

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
