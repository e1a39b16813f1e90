//! Server configuration.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values set via builder methods (`workers(8)`)
//! 2. **Environment variables**: values from `WSRELAY_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: [`ServerConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `WSRELAY_HOST` | `String` | `host` |
//! | `WSRELAY_PORT` | `u16` | `port` |
//! | `WSRELAY_WORKERS` | `usize` | `workers` |
//! | `WSRELAY_CONNECTOR` | path (empty disables) | `connector` |
//! | `WSRELAY_MAX_OUTBOX` | `usize` | `connection.max_outbox_bytes` |
//! | `WSRELAY_MAX_PAYLOAD` | `u64` | `connection.max_payload_size` |
//! | `WSRELAY_TRACE_PAYLOADS` | `bool` | `connection.trace_payloads` |

use crate::error::{Error, Result};
use crate::net::websocket::DEFAULT_MAX_PAYLOAD_SIZE;
use std::path::PathBuf;

/// Environment variable name for the bind host.
pub const ENV_HOST: &str = "WSRELAY_HOST";
/// Environment variable name for the bind port.
pub const ENV_PORT: &str = "WSRELAY_PORT";
/// Environment variable name for the worker process count.
pub const ENV_WORKERS: &str = "WSRELAY_WORKERS";
/// Environment variable name for the connector socket path.
pub const ENV_CONNECTOR: &str = "WSRELAY_CONNECTOR";
/// Environment variable name for the per-client outbound queue limit in bytes.
pub const ENV_MAX_OUTBOX: &str = "WSRELAY_MAX_OUTBOX";
/// Environment variable name for the maximum frame payload.
pub const ENV_MAX_PAYLOAD: &str = "WSRELAY_MAX_PAYLOAD";
/// Environment variable name for payload logging.
pub const ENV_TRACE_PAYLOADS: &str = "WSRELAY_TRACE_PAYLOADS";

/// Default per-client outbound queue limit (4 MiB).
pub const DEFAULT_MAX_OUTBOX_BYTES: usize = 4 * 1024 * 1024;

/// Per-connection settings shared by workers and the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Bytes a client may have queued but unsent before it is dropped.
    ///
    /// Worker and master links are not limited.
    pub max_outbox_bytes: usize,
    /// Largest frame payload accepted.
    pub max_payload_size: u64,
    /// Bytes read for the opening handshake.
    pub handshake_buffer_size: usize,
    /// Include payload text in debug logs.
    pub trace_payloads: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_outbox_bytes: DEFAULT_MAX_OUTBOX_BYTES,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            handshake_buffer_size: 4096,
            trace_payloads: false,
        }
    }
}

impl ConnectionConfig {
    /// Sets the per-client outbound queue limit.
    #[must_use]
    pub fn max_outbox_bytes(mut self, max: usize) -> Self {
        self.max_outbox_bytes = max;
        self
    }

    /// Sets the maximum payload size.
    #[must_use]
    pub fn max_payload_size(mut self, max: u64) -> Self {
        self.max_payload_size = max;
        self
    }

    /// Sets the handshake buffer size.
    #[must_use]
    pub fn handshake_buffer_size(mut self, size: usize) -> Self {
        self.handshake_buffer_size = size;
        self
    }

    /// Enables payload logging.
    #[must_use]
    pub fn trace_payloads(mut self, enabled: bool) -> Self {
        self.trace_payloads = enabled;
        self
    }

    /// Checks the settings.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error for a zero outbox limit or zero buffer size.
    pub fn validate(&self) -> Result<()> {
        if self.max_outbox_bytes == 0 {
            return Err(Error::config("max_outbox_bytes must be greater than zero"));
        }
        if self.handshake_buffer_size == 0 {
            return Err(Error::config("handshake_buffer_size must be greater than zero"));
        }
        Ok(())
    }
}

/// Top-level server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// Number of worker processes.
    pub workers: usize,
    /// Path of the out-of-band connector socket, if enabled.
    pub connector: Option<PathBuf>,
    /// Connection settings.
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2083,
            workers: 4,
            connector: None,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults with environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if a variable holds an unparseable value.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Sets the bind host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the bind port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the worker process count.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Enables the connector socket at `path`.
    #[must_use]
    pub fn connector(mut self, path: impl Into<PathBuf>) -> Self {
        self.connector = Some(path.into());
        self
    }

    /// Replaces the connection settings.
    #[must_use]
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// `host:port` string for binding.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks the settings.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error for zero workers, an empty host, or invalid
    /// connection settings.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.host.trim().is_empty() {
            return Err(Error::config("host must not be empty"));
        }
        self.connection.validate()
    }
}

/// Apply environment variable overrides to a [`ServerConfig`].
///
/// Only variables that are set in the environment are applied.
///
/// # Errors
///
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut ServerConfig) -> Result<()> {
    if let Some(val) = read_env(ENV_HOST) {
        config.host = val.trim().to_string();
    }
    if let Some(val) = read_env(ENV_PORT) {
        config.port = parse_u16(ENV_PORT, &val)?;
    }
    if let Some(val) = read_env(ENV_WORKERS) {
        config.workers = parse_usize(ENV_WORKERS, &val)?;
    }
    if let Some(val) = read_env(ENV_CONNECTOR) {
        let val = val.trim();
        config.connector = if val.is_empty() {
            None
        } else {
            Some(PathBuf::from(val))
        };
    }
    if let Some(val) = read_env(ENV_MAX_OUTBOX) {
        config.connection.max_outbox_bytes = parse_usize(ENV_MAX_OUTBOX, &val)?;
    }
    if let Some(val) = read_env(ENV_MAX_PAYLOAD) {
        config.connection.max_payload_size = parse_u64(ENV_MAX_PAYLOAD, &val)?;
    }
    if let Some(val) = read_env(ENV_TRACE_PAYLOADS) {
        config.connection.trace_payloads = parse_bool(ENV_TRACE_PAYLOADS, &val)?;
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var_name: &str, val: &str) -> Result<usize> {
    val.trim().parse::<usize>().map_err(|e| {
        Error::config(format!(
            "invalid value for {var_name}: expected unsigned integer, got {val:?} ({e})"
        ))
    })
}

fn parse_u64(var_name: &str, val: &str) -> Result<u64> {
    val.trim().parse::<u64>().map_err(|e| {
        Error::config(format!(
            "invalid value for {var_name}: expected u64, got {val:?} ({e})"
        ))
    })
}

fn parse_u16(var_name: &str, val: &str) -> Result<u16> {
    val.trim().parse::<u16>().map_err(|e| {
        Error::config(format!(
            "invalid value for {var_name}: expected port number, got {val:?} ({e})"
        ))
    })
}

fn parse_bool(var_name: &str, val: &str) -> Result<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!(
            "invalid value for {var_name}: expected bool (true/false/1/0/yes/no), got {val:?}"
        ))),
    }
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable server configuration.
///
/// ```toml
/// [server]
/// host = "0.0.0.0"
/// port = 2083
/// workers = 4
/// connector = "/var/run/wsc.sock"
///
/// [connection]
/// max_outbox_bytes = 4194304
/// max_payload_size = 16777216
/// handshake_buffer_size = 4096
/// trace_payloads = false
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct ServerTomlConfig {
    /// Listener and topology settings.
    #[serde(default)]
    pub server: ServerToml,
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionToml,
}

/// `[server]` section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct ServerToml {
    /// Interface to bind.
    pub host: Option<String>,
    /// Port to bind.
    pub port: Option<u16>,
    /// Number of worker processes.
    pub workers: Option<usize>,
    /// Connector socket path.
    pub connector: Option<PathBuf>,
}

/// `[connection]` section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct ConnectionToml {
    /// Per-client outbound queue limit in bytes.
    pub max_outbox_bytes: Option<usize>,
    /// Largest frame payload accepted.
    pub max_payload_size: Option<u64>,
    /// Bytes read for the opening handshake.
    pub handshake_buffer_size: Option<usize>,
    /// Include payload text in debug logs.
    pub trace_payloads: Option<bool>,
}

/// Apply a parsed TOML config to a [`ServerConfig`].
///
/// Only fields that are `Some` in the TOML struct override the config.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut ServerConfig, toml: &ServerTomlConfig) {
    if let Some(ref v) = toml.server.host {
        config.host.clone_from(v);
    }
    if let Some(v) = toml.server.port {
        config.port = v;
    }
    if let Some(v) = toml.server.workers {
        config.workers = v;
    }
    if let Some(ref v) = toml.server.connector {
        config.connector = Some(v.clone());
    }
    if let Some(v) = toml.connection.max_outbox_bytes {
        config.connection.max_outbox_bytes = v;
    }
    if let Some(v) = toml.connection.max_payload_size {
        config.connection.max_payload_size = v;
    }
    if let Some(v) = toml.connection.handshake_buffer_size {
        config.connection.handshake_buffer_size = v;
    }
    if let Some(v) = toml.connection.trace_payloads {
        config.connection.trace_payloads = v;
    }
}

/// Parse a TOML string into a [`ServerTomlConfig`].
///
/// # Errors
///
/// Returns a `Config` error on malformed TOML.
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<ServerTomlConfig> {
    toml::from_str(toml_str)
        .map_err(|e| Error::config(format!("failed to parse TOML config: {e}")))
}

/// Read and parse a TOML file into a [`ServerTomlConfig`].
///
/// # Errors
///
/// Returns a `Config` error if the file cannot be read or parsed.
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<ServerTomlConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!("failed to read config file {}", path.display())).with_source(e)
    })?;
    parse_toml_str(&content)
}
