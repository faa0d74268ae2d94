//! TOML-based configuration for the gateway.
//!
//! The file is optional.  Every field has a default, and a missing file is
//! the same as an empty one.  Command-line flags override what is loaded
//! here (see `main.rs`).
//!
//! # Example file
//!
//! ```toml
//! [gateway]
//! log_level = "debug"
//! request_timeout_ms = 5000
//! queue_capacity = 100
//! transaction_id_policy = "warn"
//!
//! [http]
//! bind_address = "0.0.0.0"
//! port = 8080
//!
//! [mqtt]
//! enabled = true
//! broker_host = "localhost"
//! broker_port = 1883
//!
//! [uplink]
//! enabled = true
//! topic = "application/+/device/+/event/up"
//!
//! [[devices]]
//! id = 1
//! host = "127.0.0.1"
//! port = 5021
//! ```
//!
//! `[[devices]]` entries are connected at startup, exactly as if
//! `/connect` had been called for each.
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return value
//! of `some_fn()` when the field is absent, so partial files are valid.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::session::{SessionConfig, TransactionIdPolicy};
use crate::DeviceId;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid bind address {0:?}")]
    InvalidAddress(String),

    #[error("device {0} is listed more than once")]
    DuplicateDevice(DeviceId),

    #[error("invalid MQTT topic filter {0:?}")]
    InvalidTopicFilter(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub uplink: UplinkConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// Core request-handling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// How long a caller waits for a device reply.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Per-device queue capacity, clamped to 100..=1000.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub transaction_id_policy: TransactionIdPolicy,
}

/// HTTP front-end settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// IP address to bind to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

/// MQTT bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_request_topic")]
    pub request_topic: String,
    #[serde(default = "default_response_topic")]
    pub response_topic: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Pause after a broker connection error before polling again.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

/// LoRaWAN uplink forwarding.
///
/// Uplink messages ride on the `[mqtt]` broker connection.  Each payload is
/// a `/modbus` JSON document; it is routed to the device and the reply is
/// only logged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UplinkConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Subscription filter; MQTT wildcards allowed.
    #[serde(default = "default_uplink_topic")]
    pub topic: String,
}

/// A device connected at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEntry {
    pub id: DeviceId,
    #[serde(default = "default_device_host")]
    pub host: String,
    pub port: u16,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_queue_capacity() -> usize {
    100
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_broker_host() -> String {
    "localhost".to_string()
}
fn default_broker_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "modbus-master".to_string()
}
fn default_request_topic() -> String {
    "modbus/request".to_string()
}
fn default_response_topic() -> String {
    "modbus/response".to_string()
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_reconnect_delay_secs() -> u64 {
    3
}
fn default_uplink_topic() -> String {
    "application/+/device/+/event/up".to_string()
}
fn default_device_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            request_timeout_ms: default_request_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            transaction_id_policy: TransactionIdPolicy::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            client_id: default_client_id(),
            request_topic: default_request_topic(),
            response_topic: default_response_topic(),
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            topic: default_uplink_topic(),
        }
    }
}

// ── Derived settings ──────────────────────────────────────────────────────────

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway.request_timeout_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            queue_capacity: self.gateway.queue_capacity,
            transaction_id_policy: self.gateway.transaction_id_policy,
        }
    }

    /// Checks cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidAddress`] for an unparsable HTTP bind address.
    /// - [`ConfigError::DuplicateDevice`] if a device id appears twice.
    /// - [`ConfigError::InvalidTopicFilter`] for a malformed MQTT filter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.http.socket_addr()?;
        for filter in [&self.mqtt.request_topic, &self.uplink.topic] {
            if !rumqttc::valid_filter(filter) {
                return Err(ConfigError::InvalidTopicFilter(filter.clone()));
            }
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id) {
                return Err(ConfigError::DuplicateDevice(device.id));
            }
        }
        Ok(())
    }
}

impl HttpConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if `bind_address` is not an IP.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads and validates `GatewayConfig` from `path`, returning
/// `GatewayConfig::default()` if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed, or a validation error.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let cfg = match std::fs::read_to_string(path) {
        Ok(content) => parse_config(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => GatewayConfig::default(),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Parses TOML text into a config (without validation).
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] if the TOML is malformed.
pub fn parse_config(content: &str) -> Result<GatewayConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Renders `config` as TOML, e.g. for `--print-config`.
///
/// # Errors
///
/// Returns [`ConfigError::Serialize`] if serialization fails.
pub fn render_config(config: &GatewayConfig) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(config)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
