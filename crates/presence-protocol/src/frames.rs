//! Frame types exchanged with the mesh.
//!
//! Every frame on a mesh stream is a length-prefixed MessagePack body. The
//! first frame on a connection is a [`Handshake`]; every frame after it is
//! an [`Envelope`] carrying one presence event.

use serde::{Deserialize, Serialize};

/// Wire envelope of a presence event.
///
/// The kind is kept as a raw discriminant so that frames of unknown kinds
/// can be skipped instead of failing the whole stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol major version of the sender.
    pub v: u8,
    /// Target room.
    pub room: String,
    /// Event kind discriminant.
    pub event: u8,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Kind-specific payload.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Role of a mesh connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Writes presence events into the mesh.
    Source,
    /// Receives processed presence events from the mesh.
    Sink,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Sink => "sink",
        }
    }
}

/// Initial frame sent on every mesh connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Protocol major version.
    pub version: u8,
    /// Connection role.
    pub role: Role,
    /// Human-readable client name.
    pub name: String,
    /// Application credential, see [`credential`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl Handshake {
    /// Create a handshake for the current protocol version.
    #[must_use]
    pub fn new(role: Role, name: impl Into<String>) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION.major,
            role,
            name: name.into(),
            credential: None,
        }
    }

    /// Attach an application credential.
    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

/// Format the credential presented to the mesh for an application key pair.
#[must_use]
pub fn credential(app_id: &str, app_secret: &str) -> String {
    format!("app-key-secret:{app_id}|{app_secret}")
}
