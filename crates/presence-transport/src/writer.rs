//! Serialized outbound writer for the mesh.
//!
//! All connection workers share one [`MeshWriter`]. Frames are queued on an
//! unbounded channel and written by a single task, one complete frame per
//! `write_all`, so frames from different workers never interleave.
//!
//! Delivery is at-most-once: a frame that fails or times out is dropped and
//! the connection is re-established in the background after the reconnect
//! delay. [`MeshSink::is_available`] reports `false` until it is back.

use bytes::Bytes;
use metrics::counter;
use presence_protocol::Role;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::traits::{MeshConnector, MeshSink, MeshWrite, TransportError};

/// Default delay before reconnecting after a failure.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Default limit for writing one frame.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Metric names exported by the writer.
pub mod names {
    /// Frames accepted by the writer but never written.
    pub const WRITE_FAILURES: &str = "presence_mesh_write_failures_total";
    /// Successful reconnects of the outbound stream.
    pub const WRITER_RECONNECTS: &str = "presence_mesh_writer_reconnects_total";
}

/// Writer configuration.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Minimum delay between connect attempts.
    pub reconnect_delay: Duration,
    /// Limit for writing and flushing one frame.
    pub write_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

enum Command {
    Frame(Bytes),
    Shutdown,
}

/// Counters for the outbound side.
#[derive(Debug, Default)]
pub struct WriterStats {
    written: AtomicU64,
    dropped: AtomicU64,
    reconnects: AtomicU64,
    unreachable: AtomicBool,
}

impl WriterStats {
    /// Frames fully written to the mesh.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Frames dropped because the mesh was unreachable or the write failed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Successful connects after the first one.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Whether the last connect or write failed.
    #[must_use]
    pub fn unreachable(&self) -> bool {
        self.unreachable.load(Ordering::Relaxed)
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        counter!(names::WRITE_FAILURES).increment(1);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        counter!(names::WRITER_RECONNECTS).increment(1);
    }
}

/// The shared, serialized mesh writer.
pub struct MeshWriter {
    tx: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<WriterStats>,
}

impl MeshWriter {
    /// Spawn the writer task for `address` with the default write timeout.
    #[must_use]
    pub fn spawn(
        connector: Arc<dyn MeshConnector>,
        address: impl Into<String>,
        reconnect_delay: Duration,
    ) -> Self {
        let config = WriterConfig {
            reconnect_delay,
            ..WriterConfig::default()
        };
        Self::spawn_with_config(connector, address, config)
    }

    /// Spawn the writer task for `address`.
    ///
    /// The task connects immediately and again after any failure, waiting
    /// at least `reconnect_delay` between attempts.
    #[must_use]
    pub fn spawn_with_config(
        connector: Arc<dyn MeshConnector>,
        address: impl Into<String>,
        config: WriterConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(WriterStats::default());

        let task = WriterTask {
            connector,
            address: address.into(),
            config,
            stats: stats.clone(),
            stream: None,
            retry_at: None,
            connected_once: false,
        };
        let handle = tokio::spawn(task.run(rx));

        Self {
            tx,
            task: Mutex::new(Some(handle)),
            stats,
        }
    }

    /// Get the writer counters.
    #[must_use]
    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Stop accepting frames and wait until everything queued so far has
    /// been written or dropped.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);

        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Mesh writer task failed");
            }
        }
    }
}

impl MeshSink for MeshWriter {
    fn write(&self, frame: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(Command::Frame(frame))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn is_available(&self) -> bool {
        !self.tx.is_closed() && !self.stats.unreachable()
    }
}

struct WriterTask {
    connector: Arc<dyn MeshConnector>,
    address: String,
    config: WriterConfig,
    stats: Arc<WriterStats>,
    stream: Option<MeshWrite>,
    retry_at: Option<Instant>,
    connected_once: bool,
}

impl WriterTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        self.ensure_connected().await;

        loop {
            let pending_retry = self.retry_at.filter(|_| self.stream.is_none());
            let command = match pending_retry {
                Some(retry_at) => tokio::select! {
                    biased;

                    command = rx.recv() => command,
                    () = tokio::time::sleep_until(retry_at) => {
                        self.ensure_connected().await;
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            match command {
                Some(Command::Frame(frame)) => self.write_frame(frame).await,
                Some(Command::Shutdown) | None => break,
            }
        }

        // Reject anything sent after shutdown
        rx.close();
        while let Ok(command) = rx.try_recv() {
            if let Command::Frame(_) = command {
                self.stats.record_drop();
            }
        }

        if let Some(mut stream) = self.stream.take() {
            match timeout(self.config.write_timeout, stream.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Mesh writer shutdown error"),
                Err(_) => debug!("Mesh writer shutdown timed out"),
            }
        }

        info!(
            written = self.stats.written(),
            dropped = self.stats.dropped(),
            "Mesh writer stopped"
        );
    }

    async fn ensure_connected(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }

        if let Some(retry_at) = self.retry_at {
            if Instant::now() < retry_at {
                return false;
            }
        }

        match self.connector.connect(&self.address, Role::Source).await {
            Ok(conn) => {
                if self.connected_once {
                    self.stats.record_reconnect();
                    info!(address = %self.address, "Mesh writer reconnected");
                }
                self.connected_once = true;
                self.retry_at = None;
                self.stream = Some(conn.writer);
                self.stats.unreachable.store(false, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(address = %self.address, error = %e, "Mesh connect failed");
                self.mark_unreachable();
                false
            }
        }
    }

    fn mark_unreachable(&mut self) {
        self.stream = None;
        self.retry_at = Some(Instant::now() + self.config.reconnect_delay);
        self.stats.unreachable.store(true, Ordering::Relaxed);
    }

    async fn write_frame(&mut self, frame: Bytes) {
        if !self.ensure_connected().await {
            self.stats.record_drop();
            debug!(bytes = frame.len(), "Mesh unreachable, frame dropped");
            return;
        }

        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        };

        match timeout(self.config.write_timeout, write).await {
            Ok(Ok(())) => {
                self.stats.written.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                warn!(error = %e, bytes = frame.len(), "Mesh write failed, frame dropped");
                self.stats.record_drop();
                self.mark_unreachable();
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.write_timeout.as_millis() as u64,
                    bytes = frame.len(),
                    "Mesh write timed out, frame dropped"
                );
                self.stats.record_drop();
                self.mark_unreachable();
            }
        }
    }
}
