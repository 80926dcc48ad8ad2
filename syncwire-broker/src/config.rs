//! Broker configuration.

use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use syncwire_protocol::DEFAULT_BROKER_PORT;

/// Which broker implementation the engine runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMode {
    #[default]
    Embedded,
    Remote,
}

/// Broker section of the engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub mode: BrokerMode,
    pub embedded: EmbeddedBrokerConfig,
    pub remote: RemoteBrokerConfig,
}

impl BrokerConfig {
    pub fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("SYNCWIRE_BROKER_MODE") {
            match mode.to_lowercase().as_str() {
                "embedded" => self.mode = BrokerMode::Embedded,
                "remote" => self.mode = BrokerMode::Remote,
                other => tracing::warn!("ignoring unknown SYNCWIRE_BROKER_MODE '{}'", other),
            }
        }
        self.embedded.apply_env_overrides();
        self.remote.apply_env_overrides();
    }

    /// Validates the section for the selected mode.
    pub fn validate(&self) -> Result<(), BrokerError> {
        match self.mode {
            BrokerMode::Embedded => self.embedded.validate(),
            BrokerMode::Remote => self.remote.validate(),
        }
    }
}

/// In-process broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedBrokerConfig {
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Sessions beyond this count are refused.
    pub max_connections: usize,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    pub tls: ServerTlsConfig,
}

impl Default for EmbeddedBrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_BROKER_PORT)),
            max_connections: 1000,
            keep_alive_secs: 60,
            tls: ServerTlsConfig::default(),
        }
    }
}

impl EmbeddedBrokerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive_secs = keep_alive.as_secs().max(1);
        self
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }

    /// Sessions silent for longer than this are closed (1.5 × keep-alive).
    pub fn idle_timeout(&self) -> Duration {
        self.keep_alive() * 3 / 2
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SYNCWIRE_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
        if let Ok(max) = std::env::var("SYNCWIRE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
        if let Ok(secs) = std::env::var("SYNCWIRE_KEEP_ALIVE") {
            if let Ok(n) = secs.parse() {
                self.keep_alive_secs = n;
            }
        }
        self.tls.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.max_connections == 0 {
            return Err(BrokerError::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        self.tls.validate()
    }
}

/// Settings for connecting to an external broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBrokerConfig {
    /// `host:port` of the remote broker.
    pub addr: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    /// Time to wait for an acknowledgement.
    pub ack_timeout_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// 0 = unlimited.
    pub max_reconnect_attempts: u32,
    pub tls: ClientTlsConfig,
}

impl Default for RemoteBrokerConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            client_id: "syncwire-engine".to_string(),
            username: None,
            password: None,
            clean_session: true,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            ack_timeout_secs: 10,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: 0,
            tls: ClientTlsConfig::default(),
        }
    }
}

impl RemoteBrokerConfig {
    pub fn new(addr: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive_secs = keep_alive.as_secs();
        self
    }

    pub fn with_reconnect(mut self, initial: Duration, max: Duration, attempts: u32) -> Self {
        self.reconnect_initial_ms = initial.as_millis() as u64;
        self.reconnect_max_ms = max.as_millis() as u64;
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// `None` disables pings.
    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs.max(1))
    }

    /// Backoff before reconnect attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial = self.reconnect_initial_ms.max(1);
        let max = self.reconnect_max_ms.max(initial);
        let delay = initial.saturating_mul(1u64 << attempt.min(20));
        Duration::from_millis(delay.min(max))
    }

    /// Host part of `addr`, used for TLS server name.
    pub fn host(&self) -> &str {
        match self.addr.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
            None => &self.addr,
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SYNCWIRE_REMOTE_ADDR") {
            self.addr = addr;
        }
        if let Ok(id) = std::env::var("SYNCWIRE_REMOTE_CLIENT_ID") {
            self.client_id = id;
        }
        if let Ok(user) = std::env::var("SYNCWIRE_REMOTE_USERNAME") {
            self.username = Some(user);
        }
        if let Ok(pass) = std::env::var("SYNCWIRE_REMOTE_PASSWORD") {
            self.password = Some(pass);
        }
        self.tls.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.addr.is_empty() {
            return Err(BrokerError::Config("remote broker addr not set".into()));
        }
        if self.client_id.is_empty() {
            return Err(BrokerError::Config("remote client_id not set".into()));
        }
        Ok(())
    }
}

/// TLS for the embedded broker listener.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerTlsConfig {
    pub enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// Required if `require_client_cert` is set.
    pub client_ca_path: Option<PathBuf>,
}

impl ServerTlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("SYNCWIRE_TLS_ENABLED") {
            self.enabled = parse_bool(&enabled);
        }
        if let Ok(path) = std::env::var("SYNCWIRE_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("SYNCWIRE_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Ok(require) = std::env::var("SYNCWIRE_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = parse_bool(&require);
        }
        if let Ok(path) = std::env::var("SYNCWIRE_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if !self.enabled {
            return Ok(());
        }
        if self.cert_path.is_none() {
            return Err(BrokerError::Config(
                "TLS enabled but cert_path not set".into(),
            ));
        }
        if self.key_path.is_none() {
            return Err(BrokerError::Config("TLS enabled but key_path not set".into()));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(BrokerError::Config(
                "mTLS enabled but client_ca_path not set".into(),
            ));
        }
        Ok(())
    }
}

/// TLS for outbound broker connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTlsConfig {
    pub enabled: bool,
    /// CA bundle for verifying the broker; webpki roots when unset.
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// SNI name; defaults to the host of `addr`.
    pub server_name: Option<String>,
}

impl ClientTlsConfig {
    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self.enabled = true;
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self.enabled = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("SYNCWIRE_REMOTE_TLS") {
            self.enabled = parse_bool(&enabled);
        }
        if let Ok(path) = std::env::var("SYNCWIRE_TLS_CA") {
            self.ca_cert_path = Some(PathBuf::from(path));
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Serializes `SocketAddr` as a plain string.
pub mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
