//! Engine configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via SYNCWIRE_CONFIG)
//! 3. Environment variables
//!
//! Secrets files are read separately with [`Config::load_secrets`].

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use syncwire_broker::config::socket_addr_serde;
use syncwire_broker::{BrokerConfig, BrokerError};
use syncwire_protocol::topic::validate_topic;
use syncwire_protocol::{QoS, TopicLayout, DEFAULT_TOPIC_PREFIX};
use thiserror::Error;

/// Default port of the metrics HTTP endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 9091;

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub broker: BrokerConfig,
    pub auth: AuthConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SYNCWIRE_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.engine.apply_env_overrides();
        self.broker.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Appends token hashes from `auth.secrets_file`, if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.broker.validate()?;
        self.auth.validate()?;
        Ok(())
    }

    /// Writes the configuration as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Topic naming, delivery levels and dispatch queueing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub topic_prefix: String,
    pub request_qos: QoS,
    pub response_qos: QoS,
    pub notification_qos: QoS,
    /// Capacity of the queue between the broker callback and the dispatcher.
    pub inbound_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            request_qos: QoS::AtLeastOnce,
            response_qos: QoS::AtLeastOnce,
            notification_qos: QoS::AtMostOnce,
            inbound_queue: 1024,
        }
    }
}

impl EngineConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    pub fn topics(&self) -> TopicLayout {
        TopicLayout::new(self.topic_prefix.clone())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(prefix) = std::env::var("SYNCWIRE_TOPIC_PREFIX") {
            if !prefix.is_empty() {
                self.topic_prefix = prefix;
            }
        }
        if let Ok(size) = std::env::var("SYNCWIRE_INBOUND_QUEUE") {
            if let Ok(n) = size.parse() {
                self.inbound_queue = n;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_topic(&self.topic_prefix).map_err(|e| {
            ConfigError::Validation(format!("invalid topic_prefix '{}': {}", self.topic_prefix, e))
        })?;
        if self.inbound_queue == 0 {
            return Err(ConfigError::Validation(
                "inbound_queue must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Token authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Reject connections whose credential does not validate.
    pub required: bool,
    /// Valid token hashes (SHA-256 hex strings).
    /// Generate hashes with: `syncwire-cli hash-token <your-token>`
    pub token_hashes: Vec<String>,
    /// File of token hashes, one per line.
    pub secrets_file: Option<PathBuf>,
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(required) = std::env::var("SYNCWIRE_AUTH_REQUIRED") {
            self.required = parse_bool(&required);
        }
        if let Ok(hash) = std::env::var("SYNCWIRE_AUTH_TOKEN_HASH") {
            if !hash.is_empty() {
                self.token_hashes.push(hash);
            }
        }
        if let Ok(path) = std::env::var("SYNCWIRE_AUTH_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }
    }

    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        let Some(path) = &self.secrets_file else {
            return Ok(());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let hashes = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string);
        self.token_hashes.extend(hashes);
        Ok(())
    }

    pub fn is_disabled(&self) -> bool {
        !self.required
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.required && self.token_hashes.is_empty() {
            return Err(ConfigError::Validation(
                "auth required but no token hashes configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_METRICS_PORT)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("SYNCWIRE_METRICS_ENABLED") {
            self.enabled = parse_bool(&enabled);
        }
        if let Ok(addr) = std::env::var("SYNCWIRE_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),

    #[error("configuration validation failed: {0}")]
    Broker(#[from] BrokerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use syncwire_broker::BrokerMode;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.topic_prefix, "syncwire");
        assert_eq!(config.engine.request_qos, QoS::AtLeastOnce);
        assert_eq!(config.engine.response_qos, QoS::AtLeastOnce);
        assert_eq!(config.engine.notification_qos, QoS::AtMostOnce);
        assert_eq!(config.engine.inbound_queue, 1024);
        assert_eq!(config.broker.mode, BrokerMode::Embedded);
        assert_eq!(config.metrics.bind_addr.port(), 9091);
        assert!(config.auth.is_disabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_sections() {
        let yaml = r#"
engine:
  topic_prefix: app/rt
  notification_qos: 1
broker:
  mode: remote
  remote:
    addr: "broker.internal:7411"
    client_id: engine-a
    max_reconnect_attempts: 5
auth:
  required: true
  token_hashes: ["abc"]
metrics:
  enabled: true
  bind_addr: "127.0.0.1:9999"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.engine.topic_prefix, "app/rt");
        assert_eq!(config.engine.notification_qos, QoS::AtLeastOnce);
        assert_eq!(config.engine.request_qos, QoS::AtLeastOnce);
        assert_eq!(config.broker.mode, BrokerMode::Remote);
        assert_eq!(config.broker.remote.addr, "broker.internal:7411");
        assert_eq!(config.broker.remote.max_reconnect_attempts, 5);
        assert!(config.auth.required);
        assert_eq!(config.metrics.bind_addr.port(), 9999);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.engine.topics().request("c1"),
            "app/rt/c1/request"
        );
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let err = Config::from_yaml("engine:\n  request_qos: 7\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.auth.required = true;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
        config.auth.token_hashes.push("deadbeef".into());
        assert!(config.validate().is_ok());

        config.engine.topic_prefix = "app/+".into();
        assert!(config.validate().is_err());
        config.engine.topic_prefix = "app".into();

        config.broker.mode = BrokerMode::Remote;
        assert!(matches!(config.validate(), Err(ConfigError::Broker(_))));
    }

    #[test]
    fn test_load_secrets_skips_comments() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# engine tokens").unwrap();
        writeln!(file, "hash-one").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  hash-two  ").unwrap();

        let mut config = Config::default();
        config.auth.token_hashes.push("inline".into());
        config.auth.secrets_file = Some(file.path().to_path_buf());
        config.load_secrets().unwrap();
        assert_eq!(config.auth.token_hashes, vec!["inline", "hash-one", "hash-two"]);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/syncwire.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_save_and_reload() {
        let file = NamedTempFile::new().unwrap();
        let mut config = Config::default();
        config.engine.topic_prefix = "saved".into();
        config.save(file.path()).unwrap();

        let loaded = Config::from_file(file.path()).unwrap();
        assert_eq!(loaded.engine.topic_prefix, "saved");
        assert_eq!(loaded.broker.embedded.bind_addr, config.broker.embedded.bind_addr);
    }
}
