//! Inbound chunk source for the mesh.

use bytes::{Bytes, BytesMut};
use presence_protocol::Role;
use tokio::io::AsyncReadExt;
use tracing::trace;

use crate::traits::{MeshConnector, MeshRead, MeshWrite, TransportError};

/// Read buffer size.
const READ_CAPACITY: usize = 8 * 1024;

/// Yields raw byte chunks from a mesh stream.
///
/// Chunks carry no frame alignment; the consumer reassembles frames.
pub struct MeshReader {
    reader: MeshRead,
    // Dropping the write half would half-close the stream.
    _writer: Option<MeshWrite>,
    buf: BytesMut,
    peer: Option<String>,
}

impl MeshReader {
    /// Wrap the read half of a mesh stream.
    #[must_use]
    pub fn new(reader: MeshRead) -> Self {
        Self {
            reader,
            _writer: None,
            buf: BytesMut::with_capacity(READ_CAPACITY),
            peer: None,
        }
    }

    /// Connect to `address` as a sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or handshake fails.
    pub async fn connect(
        connector: &dyn MeshConnector,
        address: &str,
    ) -> Result<Self, TransportError> {
        let conn = connector.connect(address, Role::Sink).await?;
        let mut reader = Self::new(conn.reader);
        reader._writer = Some(conn.writer);
        reader.peer = conn.peer;
        Ok(reader)
    }

    /// Remote address, if known.
    #[must_use]
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Read the next chunk.
    ///
    /// Returns `Ok(None)` once the stream has ended.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        self.buf.reserve(READ_CAPACITY);
        let n = self.reader.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        trace!(bytes = n, "Mesh chunk received");
        Ok(Some(self.buf.split().freeze()))
    }
}
