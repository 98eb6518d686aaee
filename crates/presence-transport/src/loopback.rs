//! In-process loopback mesh.
//!
//! Every frame written by a source connection is delivered to every sink
//! connection of the same connector. Used when a relay runs without a
//! remote mesh, and in tests.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use presence_protocol::{codec, Role};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::io::DuplexStream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::traits::{MeshConnection, MeshConnector, TransportError};

/// Frames buffered per sink before it starts lagging.
const LOOPBACK_CAPACITY: usize = 4096;

/// In-memory pipe size per connection.
const DUPLEX_SIZE: usize = 64 * 1024;

/// Loopback mesh connector.
pub struct LoopbackConnector {
    frames: broadcast::Sender<Bytes>,
}

impl LoopbackConnector {
    /// Create a new loopback mesh.
    #[must_use]
    pub fn new() -> Self {
        let (frames, _) = broadcast::channel(LOOPBACK_CAPACITY);
        Self { frames }
    }

    /// Number of connected sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.frames.receiver_count()
    }
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeshConnector for LoopbackConnector {
    async fn connect(&self, _address: &str, role: Role) -> Result<MeshConnection, TransportError> {
        let (local, remote) = tokio::io::duplex(DUPLEX_SIZE);
        let (remote_read, remote_write) = tokio::io::split(remote);

        match role {
            Role::Source => {
                tokio::spawn(pump_source(remote_read, self.frames.clone()));
            }
            Role::Sink => {
                tokio::spawn(pump_sink(self.frames.subscribe(), remote_write));
            }
        }

        debug!(role = role.as_str(), "Loopback mesh connection opened");

        let (reader, writer) = tokio::io::split(local);
        Ok(MeshConnection::new(Box::new(reader), Box::new(writer)).with_peer("loopback"))
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

/// Re-frame bytes written by a source and publish whole frames.
async fn pump_source(mut reader: ReadHalf<DuplexStream>, frames: broadcast::Sender<Bytes>) {
    let mut buf = BytesMut::with_capacity(DUPLEX_SIZE);

    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Loopback source read failed");
                break;
            }
        }

        loop {
            match codec::split_frame(&mut buf) {
                Ok(Some(body)) => {
                    let mut frame = BytesMut::with_capacity(codec::LENGTH_PREFIX_SIZE + body.len());
                    frame.put_u32(body.len() as u32);
                    frame.extend_from_slice(&body);
                    // No sinks is fine
                    let _ = frames.send(frame.freeze());
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Loopback source sent an invalid frame");
                    return;
                }
            }
        }
    }

    debug!("Loopback source closed");
}

async fn pump_sink(mut frames: broadcast::Receiver<Bytes>, mut writer: WriteHalf<DuplexStream>) {
    loop {
        match frames.recv().await {
            Ok(frame) => {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Loopback sink lagged, frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    debug!("Loopback sink closed");
}
