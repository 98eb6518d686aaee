//! Mesh transport abstraction traits.
//!
//! The relay only needs to open a byte stream to a mesh node, write whole
//! frames to it, and read raw chunks back. These traits keep the relay
//! independent of how that stream is carried.

use async_trait::async_trait;
use bytes::Bytes;
use presence_protocol::Role;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The outbound queue or stream is closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connecting timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to reach the mesh.
    #[error("Connect to {address} failed: {reason}")]
    ConnectFailed {
        /// Mesh endpoint address.
        address: String,
        /// Underlying failure.
        reason: String,
    },

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] presence_protocol::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read half of a mesh stream.
pub type MeshRead = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a mesh stream.
pub type MeshWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// An established, handshaken mesh stream.
pub struct MeshConnection {
    /// Inbound bytes from the mesh.
    pub reader: MeshRead,
    /// Outbound bytes to the mesh.
    pub writer: MeshWrite,
    /// Remote address, if known.
    pub peer: Option<String>,
}

impl MeshConnection {
    /// Create a connection from its two halves.
    #[must_use]
    pub fn new(reader: MeshRead, writer: MeshWrite) -> Self {
        Self {
            reader,
            writer,
            peer: None,
        }
    }

    /// Record the remote address.
    #[must_use]
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }
}

impl std::fmt::Debug for MeshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshConnection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Opens streams to a mesh node.
#[async_trait]
pub trait MeshConnector: Send + Sync {
    /// Connect to `address` in the given role.
    ///
    /// Implementations perform any handshake before returning, so the
    /// returned stream is ready to carry presence frames.
    async fn connect(&self, address: &str, role: Role) -> Result<MeshConnection, TransportError>;

    /// Get the connector name (e.g., "tcp").
    fn name(&self) -> &'static str;
}

/// The outbound side of the mesh, shared by all connection workers.
///
/// A call to [`MeshSink::write`] hands over exactly one complete frame;
/// implementations must never interleave bytes of different frames.
pub trait MeshSink: Send + Sync {
    /// Queue a frame for the mesh without waiting for it to be written.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink no longer accepts frames.
    fn write(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Whether frames written now are expected to reach the mesh.
    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failed_display() {
        let err = TransportError::ConnectFailed {
            address: "mesh:9000".into(),
            reason: "refused".into(),
        };
        assert_eq!(err.to_string(), "Connect to mesh:9000 failed: refused");
    }

    #[tokio::test]
    async fn test_connection_debug_hides_streams() {
        let (a, b) = tokio::io::duplex(64);
        let conn = MeshConnection::new(Box::new(a), Box::new(b)).with_peer("10.0.0.1:9000");
        let debug = format!("{conn:?}");
        assert!(debug.contains("10.0.0.1:9000"));
    }
}
