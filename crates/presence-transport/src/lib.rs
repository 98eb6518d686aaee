//! # presence-transport
//!
//! Mesh transport layer for the presence relay.
//!
//! The relay talks to the stream-processing mesh over two long-lived byte
//! streams: a *source* stream carrying local events out, and a *sink*
//! stream carrying processed events back.
//!
//! - **TCP** - Plain TCP with a handshake frame, used in production
//! - **Loopback** - In-process mesh that echoes sources to sinks
//!
//! ## Transport Abstraction
//!
//! Connectors implement [`MeshConnector`]; the outbound side is consumed
//! through [`MeshSink`], implemented by the serialized [`MeshWriter`].
//!
//! ```rust,ignore
//! use presence_transport::{MeshReader, MeshWriter, TcpConnector};
//!
//! let connector = Arc::new(TcpConnector::default());
//! let writer = MeshWriter::spawn(connector.clone(), "mesh:9000", DEFAULT_RECONNECT_DELAY);
//! let mut reader = MeshReader::connect(connector.as_ref(), "mesh:9000").await?;
//! while let Some(chunk) = reader.next_chunk().await? {
//!     // Reassemble and process frames
//! }
//! ```

pub mod loopback;
pub mod reader;
pub mod tcp;
pub mod traits;
pub mod writer;

pub use loopback::LoopbackConnector;
pub use reader::MeshReader;
pub use tcp::{TcpConfig, TcpConnector};
pub use traits::{MeshConnection, MeshConnector, MeshSink, TransportError};
pub use writer::{
    MeshWriter, WriterConfig, WriterStats, DEFAULT_RECONNECT_DELAY, DEFAULT_WRITE_TIMEOUT,
};
