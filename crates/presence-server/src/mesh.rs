//! Mesh inbound supervisor.
//!
//! Keeps one sink connection to the mesh open and feeds everything it
//! receives through the inbound processor. The connection is re-opened
//! after a fixed delay whenever it ends or fails.

use crate::metrics;
use presence_core::InboundProcessor;
use presence_transport::{MeshConnector, MeshReader};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawn the inbound supervisor. It runs until `shutdown` flips to `true`
/// or its sender is dropped.
pub fn spawn_inbound(
    connector: Arc<dyn MeshConnector>,
    address: String,
    reconnect_delay: Duration,
    processor: InboundProcessor,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_inbound(
        connector,
        address,
        reconnect_delay,
        processor,
        shutdown,
    ))
}

async fn run_inbound(
    connector: Arc<dyn MeshConnector>,
    address: String,
    reconnect_delay: Duration,
    mut processor: InboundProcessor,
    mut shutdown: watch::Receiver<bool>,
) {
    'supervise: loop {
        if *shutdown.borrow() {
            break;
        }

        let connected = tokio::select! {
            result = MeshReader::connect(connector.as_ref(), &address) => result,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok(mut reader) => {
                info!(
                    connector = connector.name(),
                    peer = reader.peer().unwrap_or(&address),
                    "Mesh inbound connected"
                );
                processor.reset();

                loop {
                    tokio::select! {
                        chunk = reader.next_chunk() => match chunk {
                            Ok(Some(bytes)) => {
                                let summary = processor.feed(&bytes);
                                metrics::record_inbound(summary.dispatched, summary.dropped);
                            }
                            Ok(None) => {
                                warn!(address = %address, "Mesh inbound stream ended");
                                break;
                            }
                            Err(e) => {
                                warn!(address = %address, error = %e, "Mesh inbound read failed");
                                break;
                            }
                        },
                        _ = shutdown.changed() => break 'supervise,
                    }
                }
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Mesh inbound connect failed");
            }
        }

        metrics::record_reconnect();
        debug!(delay_ms = reconnect_delay.as_millis() as u64, "Reconnecting mesh inbound");

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    info!("Mesh inbound stopped");
}
