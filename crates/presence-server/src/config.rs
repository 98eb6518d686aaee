//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (`presence.toml`)
//! - Environment variables (`PRESENCE__SECTION__KEY`)

use anyhow::{Context, Result};
use presence_core::{RelayConfig, DEFAULT_COUNTRY, DEFAULT_ROOM};
use presence_protocol::credential;
use presence_transport::WriterConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files searched, in order, by [`Config::load`].
const CONFIG_PATHS: [&str; 3] = [
    "presence.toml",
    "/etc/presence/presence.toml",
    "~/.config/presence/presence.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client-facing WebSocket gateway.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Mesh connection.
    #[serde(default)]
    pub mesh: MeshConfig,

    /// Relay defaults.
    #[serde(default)]
    pub relay: RelaySettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// WebSocket gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Maximum client message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum rooms a single connection may be in.
    #[serde(default = "default_max_rooms_per_connection")]
    pub max_rooms_per_connection: usize,
}

/// Mesh connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// `host:port` of the mesh node, or `loopback` for an in-process mesh.
    #[serde(default = "default_mesh_address")]
    pub address: String,

    /// Application id presented to the mesh.
    #[serde(default)]
    pub app_id: String,

    /// Application secret presented to the mesh.
    #[serde(default)]
    pub app_secret: String,

    /// Identity of this gateway in the mesh.
    #[serde(default = "default_mesh_id")]
    pub mesh_id: String,

    /// Delay between reconnect attempts in milliseconds.
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,

    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Limit for writing one frame to the mesh, in milliseconds.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

/// Relay defaults applied to client events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Room for clients that do not name one.
    #[serde(default = "default_room")]
    pub default_room: String,

    /// Country for clients that do not send one.
    #[serde(default = "default_country")]
    pub default_country: String,

    /// Deliver events to local rooms while the mesh is unreachable.
    #[serde(default = "default_true")]
    pub local_fallback: bool,

    /// How long shutdown waits for open connections to finish, in
    /// milliseconds.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_rooms_per_connection() -> usize {
    16
}

fn default_mesh_address() -> String {
    "127.0.0.1:7000".to_string()
}

fn default_mesh_id() -> String {
    std::env::var("MESH_ID")
        .ok()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

fn default_reconnect_ms() -> u64 {
    2_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_room() -> String {
    DEFAULT_ROOM.to_string()
}

fn default_country() -> String {
    DEFAULT_COUNTRY.to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            gateway: GatewayConfig::default(),
            mesh: MeshConfig::default(),
            relay: RelaySettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            max_message_size: default_max_message_size(),
            max_rooms_per_connection: default_max_rooms_per_connection(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            address: default_mesh_address(),
            app_id: String::new(),
            app_secret: String::new(),
            mesh_id: default_mesh_id(),
            reconnect_ms: default_reconnect_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            default_room: default_room(),
            default_country: default_country(),
            local_fallback: true,
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl MeshConfig {
    /// Whether the relay should use the in-process loopback mesh.
    #[must_use]
    pub fn is_loopback(&self) -> bool {
        self.address.eq_ignore_ascii_case("loopback")
    }

    /// Handshake credential, if an application id is configured.
    #[must_use]
    pub fn credential(&self) -> Option<String> {
        if self.app_id.is_empty() {
            None
        } else {
            Some(credential(&self.app_id, &self.app_secret))
        }
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Settings for the outbound writer.
    #[must_use]
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            reconnect_delay: self.reconnect_delay(),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

impl RelaySettings {
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Config {
    /// Load configuration from the first config file found, then apply
    /// `PRESENCE__*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = Self::find_file() {
            tracing::debug!(path = %path.display(), "Using config file");
            builder = builder.add_source(config::File::from(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("PRESENCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize::<Config>()
            .context("Invalid configuration")?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn find_file() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Settings for the relay core.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            mesh_id: self.mesh.mesh_id.clone(),
            default_room: self.relay.default_room.clone(),
            default_country: self.relay.default_country.clone(),
            local_fallback: self.relay.local_fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.gateway.path, "/ws");
        assert_eq!(config.mesh.reconnect_delay(), Duration::from_secs(2));
        assert_eq!(config.relay.default_room, "void");
        assert_eq!(config.relay.default_country, "US");
        assert!(config.relay.local_fallback);
        assert_eq!(config.mesh.writer_config().write_timeout, Duration::from_secs(5));
        assert!(!config.mesh.is_loopback());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [mesh]
            address = "loopback"
            app_id = "relay"
            app_secret = "s3cret"
            mesh_id = "eu-west"
            write_timeout_ms = 250

            [relay]
            default_room = "lobby"
            local_fallback = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert!(config.mesh.is_loopback());
        assert_eq!(config.mesh.credential().as_deref(), Some("app-key-secret:relay|s3cret"));

        let relay = config.relay_config();
        assert_eq!(relay.mesh_id, "eu-west");
        assert_eq!(relay.default_room, "lobby");
        assert_eq!(relay.default_country, "US");
        assert!(!relay.local_fallback);
        assert_eq!(config.mesh.writer_config().write_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_no_credential_without_app_id() {
        assert_eq!(MeshConfig::default().credential(), None);
    }

    #[test]
    fn test_config_from_file() {
        let path = std::env::temp_dir().join(format!("presence-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 7070\n[metrics]\nenabled = false\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7070);
        assert!(!config.metrics.enabled);
        assert!(Config::from_file(&path).is_err());
    }
}
