//! Server error types.

use crate::config::ConfigError;
use syncwire_broker::BrokerError;
use syncwire_core::{CatalogError, HookError, StorageError};
use syncwire_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Engine and dispatcher errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    /// Hook messages are reported verbatim.
    #[error("{0}")]
    Hook(#[from] HookError),

    #[error("{0}")]
    Catalog(#[from] CatalogError),

    /// Storage failure tagged with the operation that hit it.
    #[error("{source}")]
    Storage {
        code: ErrorCode,
        #[source]
        source: StorageError,
    },

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine not running")]
    NotRunning,

    #[error("metrics error: {0}")]
    Metrics(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn storage(code: ErrorCode, source: StorageError) -> Self {
        ServerError::Storage { code, source }
    }

    /// Code carried in the error envelope.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Protocol(e) => e.error_code(),
            ServerError::Hook(e) => e.code,
            ServerError::Catalog(e) => e.error_code(),
            ServerError::Storage { code, .. } => *code,
            ServerError::ConnectionRejected(_) => ErrorCode::ConnectionRejected,
            ServerError::Subscribe(_) => ErrorCode::SubscribeError,
            ServerError::Broker(_)
            | ServerError::Config(_)
            | ServerError::AlreadyStarted
            | ServerError::NotRunning
            | ServerError::Metrics(_)
            | ServerError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Broker(e) => e.is_transient(),
            other => other.error_code().is_retryable(),
        }
    }
}
