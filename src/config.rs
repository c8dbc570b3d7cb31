//! # Configuration Management
//!
//! Centralized configuration for a mesh node.
//!
//! One [`MeshConfig`] carries everything a node needs: its identity and
//! capability list, liveness and gossip timing, forwarding limits, transport
//! limits and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()` (`MESH_*`)
//! - Direct instantiation with defaults
//!
//! Durations are written as integer milliseconds.
//!
//! ```toml
//! [node]
//! capabilities = ["mesh/2", "mesh/1"]
//! auth_method = "token"
//! auth_token = "s3cret"
//!
//! [liveness]
//! ping_interval = 5000
//! pong_timeout = 10000
//! ```

use crate::core::node_id::NodeId;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Capability advertised when none is configured
pub const DEFAULT_CAPABILITY: &str = "mesh/1";

/// Largest single encoded message accepted from or written to a peer (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Per-peer outbound queue depth
pub const OUTBOUND_QUEUE: usize = 256;

/// Upper bound on in-flight deliveries tracked by one node
pub const MAX_PENDING: usize = 10_000;

/// Authentication method names understood by `auth::from_config`
pub const AUTH_NONE: &str = "none";
pub const AUTH_TOKEN: &str = "token";

/// Main mesh node configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MeshConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub liveness: LivenessConfig,

    #[serde(default)]
    pub gossip: GossipConfig,

    #[serde(default)]
    pub forwarding: ForwardingConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MeshConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `MESH_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = var("MESH_NODE_ID") {
            self.node.id = Some(id);
        }

        if let Some(caps) = var("MESH_CAPABILITIES") {
            self.node.capabilities = caps
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
        }

        let millis = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());

        if let Some(ms) = millis("MESH_PING_INTERVAL_MS") {
            self.liveness.ping_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("MESH_PONG_TIMEOUT_MS") {
            self.liveness.pong_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("MESH_GOSSIP_INTERVAL_MS") {
            self.gossip.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("MESH_DELIVERY_TIMEOUT_MS") {
            self.forwarding.delivery_timeout = Duration::from_millis(ms);
        }
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.node.validate());
        errors.extend(self.liveness.validate());
        errors.extend(self.gossip.validate());
        errors.extend(self.forwarding.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Identity and negotiation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hex-encoded node id; a random one is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Supported capabilities, most preferred first
    pub capabilities: Vec<String>,

    /// Authentication method offered and accepted ("none" or "token")
    pub auth_method: String,

    /// Pre-shared token for the "token" method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            capabilities: vec![DEFAULT_CAPABILITY.to_string()],
            auth_method: AUTH_NONE.to_string(),
            auth_token: None,
        }
    }
}

impl NodeConfig {
    /// The configured id, or a freshly generated one
    pub fn node_id(&self) -> Result<NodeId> {
        match &self.id {
            Some(hex) => hex
                .parse()
                .map_err(|e| ProtocolError::ConfigError(format!("node.id: {e}"))),
            None => Ok(NodeId::generate()),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(id) = &self.id {
            if let Err(e) = id.parse::<NodeId>() {
                errors.push(format!("Invalid node id '{id}': {e}"));
            }
        }

        if self.capabilities.is_empty() {
            errors.push("At least one capability must be configured".to_string());
        }
        let mut seen = HashSet::new();
        for cap in &self.capabilities {
            if cap.is_empty() {
                errors.push("Capability names cannot be empty".to_string());
            } else if !seen.insert(cap.as_str()) {
                errors.push(format!("Duplicate capability: {cap}"));
            }
        }

        match self.auth_method.as_str() {
            AUTH_NONE => {}
            AUTH_TOKEN => {
                if self.auth_token.as_deref().map_or(true, str::is_empty) {
                    errors.push("auth_token must be set when auth_method is 'token'".to_string());
                }
            }
            other => errors.push(format!(
                "Unknown auth method: '{other}' (expected 'none' or 'token')"
            )),
        }

        errors
    }
}

/// Handshake and keep-alive timing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Bound on the whole Hello..Begin exchange
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Idle time before a Ping is sent
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// Time a Ping may stay unanswered before the connection is dropped
    #[serde(with = "duration_serde")]
    pub pong_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: timeout::DEFAULT_TIMEOUT,
            ping_interval: timeout::KEEPALIVE_INTERVAL,
            pong_timeout: timeout::PONG_TIMEOUT,
        }
    }
}

impl LivenessConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        if self.ping_interval.as_millis() < 10 {
            errors.push("Ping interval too short (minimum: 10ms)".to_string());
        } else if self.ping_interval.as_secs() > 3600 {
            errors.push("Ping interval too long (maximum: 1 hour)".to_string());
        }

        if self.pong_timeout < self.ping_interval {
            errors.push("Pong timeout must be at least the ping interval".to_string());
        }

        errors
    }
}

/// Routing gossip timing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Period of full NodeSummary rounds; also the window during which
    /// re-offers of an already-offered entry are suppressed
    #[serde(with = "duration_serde")]
    pub interval: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval: timeout::GOSSIP_INTERVAL,
        }
    }
}

impl GossipConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.interval.as_millis() < 10 {
            errors.push("Gossip interval too short (minimum: 10ms)".to_string());
        } else if self.interval.as_secs() > 3600 {
            errors.push("Gossip interval too long (maximum: 1 hour)".to_string());
        }
        errors
    }
}

/// Data forwarding limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Deadline for a DataAck/DataReject to come back
    #[serde(with = "duration_serde")]
    pub delivery_timeout: Duration,

    /// How often expired deliveries are swept
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// Maximum in-flight deliveries
    pub max_pending: usize,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: timeout::DELIVERY_TIMEOUT,
            sweep_interval: timeout::SWEEP_INTERVAL,
            max_pending: MAX_PENDING,
        }
    }
}

impl ForwardingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.delivery_timeout.as_millis() < 10 {
            errors.push("Delivery timeout too short (minimum: 10ms)".to_string());
        }

        if self.sweep_interval.is_zero() {
            errors.push("Sweep interval must be greater than 0".to_string());
        } else if self.sweep_interval > self.delivery_timeout {
            errors.push("Sweep interval should not exceed the delivery timeout".to_string());
        }

        if self.max_pending == 0 {
            errors.push("Max pending deliveries must be greater than 0".to_string());
        } else if self.max_pending > i32::MAX as usize {
            errors.push(format!(
                "Max pending deliveries too large: {} (correlation ids are int32)",
                self.max_pending
            ));
        }

        errors
    }
}

/// Transport limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum encoded size of one message
    pub max_message_size: usize,

    /// Messages queued per peer before sends report backpressure
    pub outbound_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            outbound_queue: OUTBOUND_QUEUE,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_message_size < 1024 {
            errors.push("Max message size too small (minimum: 1 KB)".to_string());
        } else if self.max_message_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max message size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_message_size
            ));
        }

        if self.outbound_queue == 0 {
            errors.push("Outbound queue must be greater than 0".to_string());
        } else if self.outbound_queue > 1_000_000 {
            errors.push(format!(
                "Outbound queue too large: {} (max recommended: 1,000,000)",
                self.outbound_queue
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub log_to_console: bool,

    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("mesh-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MESH_NODE_ID", "0a0b"),
            ("MESH_CAPABILITIES", "mesh/2, mesh/1"),
            ("MESH_PING_INTERVAL_MS", "250"),
            ("MESH_GOSSIP_INTERVAL_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = MeshConfig::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.node.id.as_deref(), Some("0a0b"));
        assert_eq!(config.node.capabilities, vec!["mesh/2", "mesh/1"]);
        assert_eq!(config.liveness.ping_interval, Duration::from_millis(250));
        assert_eq!(config.gossip.interval, timeout::GOSSIP_INTERVAL);
    }

    #[test]
    fn test_node_id_from_config() {
        let node = NodeConfig {
            id: Some("ff00".into()),
            ..NodeConfig::default()
        };
        assert_eq!(node.node_id().unwrap().as_bytes(), &[0xff, 0x00]);

        let generated = NodeConfig::default().node_id().unwrap();
        assert_eq!(generated.len(), crate::core::node_id::GENERATED_ID_LEN);
    }
}
