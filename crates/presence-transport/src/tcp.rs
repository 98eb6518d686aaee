//! TCP mesh connector.
//!
//! Opens a plain TCP stream to the mesh node and sends the handshake frame
//! before handing the stream to the relay.

use async_trait::async_trait;
use presence_protocol::{codec, Handshake, Role};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::traits::{MeshConnection, MeshConnector, TransportError};

/// Default connect timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP connector configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Client name announced in the handshake.
    pub name: String,
    /// Application credential announced in the handshake.
    pub credential: Option<String>,
    /// Connect timeout.
    pub connect_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            name: "presence-relay".to_string(),
            credential: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// TCP mesh connector.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpConfig,
}

impl TcpConnector {
    /// Create a new TCP connector.
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }

    fn handshake(&self, role: Role) -> Handshake {
        let handshake = Handshake::new(role, self.config.name.clone());
        match &self.config.credential {
            Some(credential) => handshake.with_credential(credential.clone()),
            None => handshake,
        }
    }
}

#[async_trait]
impl MeshConnector for TcpConnector {
    async fn connect(&self, address: &str, role: Role) -> Result<MeshConnection, TransportError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| address.to_string());

        let (reader, mut writer) = stream.into_split();

        let handshake = codec::encode_handshake(&self.handshake(role))?;
        writer.write_all(&handshake).await?;
        debug!(peer = %peer, role = role.as_str(), "Mesh handshake sent");

        info!(peer = %peer, role = role.as_str(), "Connected to mesh");

        Ok(MeshConnection::new(Box::new(reader), Box::new(writer)).with_peer(peer))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
