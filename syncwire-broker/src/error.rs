//! Broker error types.

use syncwire_protocol::ProtocolError;
use thiserror::Error;

/// Broker adapter errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("already_started")]
    AlreadyStarted,

    #[error("broker not started")]
    NotStarted,

    #[error("broker connection unavailable")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection refused by broker: {0}")]
    ConnectionRefused(String),

    #[error("unexpected packet: {0}")]
    UnexpectedPacket(String),

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl BrokerError {
    /// Short machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::AlreadyStarted => "already_started",
            BrokerError::NotStarted => "not_started",
            BrokerError::NotConnected => "not_connected",
            BrokerError::Io(_) => "io_error",
            BrokerError::Protocol(_) => "protocol_error",
            BrokerError::ConnectionRefused(_) => "connection_refused",
            BrokerError::UnexpectedPacket(_) => "protocol_error",
            BrokerError::Timeout => "timeout",
            BrokerError::ConnectionClosed => "connection_closed",
            BrokerError::InvalidTopic(_) => "invalid_topic",
            BrokerError::Config(_) => "invalid_config",
            BrokerError::TlsConfig(_) | BrokerError::TlsHandshake(_) => "tls_error",
        }
    }

    /// Whether reconnecting may clear the error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Io(_)
                | BrokerError::Timeout
                | BrokerError::ConnectionClosed
                | BrokerError::NotConnected
                | BrokerError::TlsHandshake(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_error_display() {
        assert_eq!(BrokerError::AlreadyStarted.to_string(), "already_started");
        assert_eq!(BrokerError::NotStarted.to_string(), "broker not started");
        assert_eq!(BrokerError::NotStarted.code(), "not_started");
    }

    #[test]
    fn test_transient() {
        assert!(BrokerError::Timeout.is_transient());
        assert!(BrokerError::ConnectionClosed.is_transient());
        assert!(!BrokerError::NotStarted.is_transient());
        assert!(!BrokerError::ConnectionRefused("bad".into()).is_transient());
    }
}
