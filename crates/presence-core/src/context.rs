//! Shared relay state.

use crate::broadcaster::RoomBroadcaster;
use crate::gateway::Gateway;
use crate::session::SessionRegistry;
use presence_transport::MeshSink;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Room used when a client does not name one.
pub const DEFAULT_ROOM: &str = "void";

/// Country code used when a client does not send one.
pub const DEFAULT_COUNTRY: &str = "US";

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Identity of this gateway in the mesh, stamped on `online` events.
    pub mesh_id: String,
    /// Room for clients that do not name one.
    pub default_room: String,
    /// Country for clients that do not send one.
    pub default_country: String,
    /// Deliver events to the local room while the mesh is unreachable.
    pub local_fallback: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mesh_id: "local".to_string(),
            default_room: DEFAULT_ROOM.to_string(),
            default_country: DEFAULT_COUNTRY.to_string(),
            local_fallback: true,
        }
    }
}

/// Everything the dispatcher and processor share, wired at startup.
pub struct RelayContext {
    pub config: RelayConfig,
    pub sessions: SessionRegistry,
    pub gateway: Arc<dyn Gateway>,
    pub broadcaster: RoomBroadcaster,
    pub mesh: Arc<dyn MeshSink>,
}

impl RelayContext {
    #[must_use]
    pub fn new(config: RelayConfig, gateway: Arc<dyn Gateway>, mesh: Arc<dyn MeshSink>) -> Self {
        Self {
            config,
            sessions: SessionRegistry::new(),
            broadcaster: RoomBroadcaster::new(gateway.clone()),
            gateway,
            mesh,
        }
    }
}

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
