//! Metrics collection and export for the presence relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use presence_core::{DropReason, Outcome};
use presence_transport::writer::names as writer_names;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "presence_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "presence_connections_active";
    pub const EVENTS_TOTAL: &str = "presence_events_total";
    pub const EVENTS_DROPPED: &str = "presence_events_dropped_total";
    pub const MESH_WRITE_FAILURES: &str = super::writer_names::WRITE_FAILURES;
    pub const MESH_WRITER_RECONNECTS: &str = super::writer_names::WRITER_RECONNECTS;
    pub const DECODE_ERRORS: &str = "presence_decode_errors_total";
    pub const MESH_RECONNECTS: &str = "presence_mesh_reconnects_total";
    pub const ROOMS_ACTIVE: &str = "presence_rooms_active";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of client connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of client connections"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Presence events relayed, by direction");
    metrics::describe_counter!(names::EVENTS_DROPPED, "Client events dropped, by reason");
    metrics::describe_counter!(
        names::MESH_WRITE_FAILURES,
        "Frames that never reached the mesh"
    );
    metrics::describe_counter!(
        names::MESH_WRITER_RECONNECTS,
        "Reconnects of the mesh outbound stream"
    );
    metrics::describe_counter!(names::DECODE_ERRORS, "Mesh frames that failed to decode");
    metrics::describe_counter!(
        names::MESH_RECONNECTS,
        "Reconnects of the mesh inbound stream"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of rooms");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record the outcome of a client event.
pub fn record_outcome(outcome: Outcome) {
    match outcome {
        Outcome::Handled => {}
        Outcome::Forwarded(kind) => {
            counter!(names::EVENTS_TOTAL, "direction" => "outbound", "kind" => kind.as_str())
                .increment(1);
        }
        Outcome::Local(kind) => {
            counter!(names::EVENTS_TOTAL, "direction" => "local", "kind" => kind.as_str())
                .increment(1);
        }
        Outcome::Dropped(reason) => {
            // Frames the writer accepted are counted by the writer itself
            if reason == DropReason::MeshUnavailable {
                counter!(names::MESH_WRITE_FAILURES).increment(1);
            }
            counter!(names::EVENTS_DROPPED, "reason" => reason.as_str()).increment(1);
        }
    }
}

/// Record events decoded from the mesh.
pub fn record_inbound(dispatched: usize, dropped: usize) {
    if dispatched > 0 {
        counter!(names::EVENTS_TOTAL, "direction" => "inbound").increment(dispatched as u64);
    }
    if dropped > 0 {
        counter!(names::DECODE_ERRORS).increment(dropped as u64);
    }
}

/// Record a reconnect of the inbound mesh stream.
pub fn record_reconnect() {
    counter!(names::MESH_RECONNECTS).increment(1);
}

/// Update active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
