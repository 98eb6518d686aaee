//! Connection handlers for the presence relay.
//!
//! This module hosts the client-facing WebSocket gateway. Each text message
//! is a JSON envelope `{"event": <name>, "data": <payload>}`; room
//! broadcasts go back out in the same shape.
//!
//! Every connection task is tracked so shutdown can stop them all and wait
//! for their `offline` events to reach the mesh writer.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use presence_core::{
    ConnectionId, DropReason, Gateway, InboundProcessor, Outcome, RelayContext, RelayDispatcher,
    RoomConfig, RoomTable,
};
use presence_transport::MeshSink;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Local room membership; the gateway seam of the relay.
    pub rooms: Arc<RoomTable>,
    /// Client events to the mesh.
    pub dispatcher: RelayDispatcher,
    /// Cancelled when the server begins shutting down.
    pub shutdown: CancellationToken,
    /// Open connection tasks.
    pub connections: TaskTracker,
}

impl AppState {
    /// Create new app state writing to `mesh`.
    #[must_use]
    pub fn new(config: Config, mesh: Arc<dyn MeshSink>) -> Self {
        let rooms = Arc::new(RoomTable::with_config(RoomConfig {
            max_rooms_per_connection: config.gateway.max_rooms_per_connection,
            ..RoomConfig::default()
        }));

        let gateway: Arc<dyn Gateway> = rooms.clone();
        let ctx = RelayContext::new(config.relay_config(), gateway, mesh);

        Self {
            config,
            rooms,
            dispatcher: RelayDispatcher::new(Arc::new(ctx)),
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Inbound processor broadcasting into this server's rooms.
    #[must_use]
    pub fn processor(&self) -> InboundProcessor {
        InboundProcessor::new(self.dispatcher.context().clone())
    }

    /// Stop every open connection and wait up to `timeout` for them to
    /// finish their disconnect handling.
    pub async fn drain(&self, timeout: Duration) {
        self.shutdown.cancel();
        self.connections.close();

        let open = self.connections.len();
        if open > 0 {
            info!(connections = open, "Draining connections");
        }
        if tokio::time::timeout(timeout, self.connections.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.connections.len(),
                "Connections still open after drain timeout"
            );
        }
    }
}

/// Run the HTTP/WebSocket server until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = state.config.bind_addr()?;
    let path = state.config.gateway.path.clone();

    let app = Router::new()
        .route(&path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;

    info!("Presence relay listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(health_report(&state))
}

fn health_report(state: &AppState) -> Value {
    let ctx = state.dispatcher.context();
    serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "mesh": ctx.config.mesh_id,
        "sessions": ctx.sessions.len(),
        "rooms": state.rooms.stats().room_count,
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.config.gateway.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _task = state.connections.token();
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate(&state.config.mesh.mesh_id);
    let (sender, receiver) = socket.split();
    run_connection(&state, connection_id, sender, receiver).await;
}

/// Drive one client connection until it closes or the server shuts down.
async fn run_connection<S, R>(
    state: &AppState,
    connection_id: ConnectionId,
    mut sender: S,
    mut receiver: R,
) -> &'static str
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut outbox = state.rooms.register(&connection_id);
    metrics::record_outcome(state.dispatcher.on_connect(&connection_id));

    debug!(connection = %connection_id, "WebSocket connected");

    let reason = loop {
        tokio::select! {
            biased;

            () = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break "server shutdown";
            }

            Some(broadcast) = outbox.recv() => {
                if sender.send(Message::Text(broadcast.to_json())).await.is_err() {
                    break "send failed";
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(state, &connection_id, &text);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(connection = %connection_id, "Ignoring binary message");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break "send failed";
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        break "client close";
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        break "transport error";
                    }
                    None => {
                        break "transport close";
                    }
                }
            }
        }
    };

    metrics::record_outcome(state.dispatcher.on_disconnect(&connection_id, reason));
    state.rooms.unregister(&connection_id);
    metrics::set_active_rooms(state.rooms.stats().room_count);

    debug!(connection = %connection_id, reason = reason, "WebSocket disconnected");
    reason
}

/// A client message envelope.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Dispatch one text message from a client.
fn handle_text(state: &AppState, connection_id: &ConnectionId, text: &str) -> Outcome {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Ignoring malformed client message");
            let outcome = Outcome::Dropped(DropReason::Malformed);
            metrics::record_outcome(outcome);
            return outcome;
        }
    };

    let outcome = state
        .dispatcher
        .handle(connection_id, &message.event, message.data);
    metrics::record_outcome(outcome);

    if message.event == "online" {
        metrics::set_active_rooms(state.rooms.stats().room_count);
    }
    outcome
}
