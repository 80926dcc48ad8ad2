//! Client error types.

use syncwire_broker::BrokerError;
use syncwire_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    /// Error envelope returned by the engine.
    #[error("server error: {code} - {message}")]
    Server { code: ErrorCode, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Timeout | ClientError::ConnectionClosed => true,
            ClientError::Broker(e) => e.is_transient(),
            ClientError::Server { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    /// Error code of a server-side failure.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}
