//! Protocol error types and wire error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while framing, decoding or validating messages and packets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'SWFR', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("frame header extension too large: {0} bytes")]
    HeaderTooLarge(usize),

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("subscription_id is required")]
    MissingSubscriptionId,

    #[error("invalid packet: {0}")]
    InvalidPacket(String),
}

impl ProtocolError {
    /// Maps the error onto the code reported to the peer.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::Json(_) | ProtocolError::InvalidUtf8 => ErrorCode::DecodeError,
            ProtocolError::MissingSubscriptionId => ErrorCode::MissingSubscriptionId,
            ProtocolError::MissingField(_) | ProtocolError::InvalidMessage(_) => {
                ErrorCode::InvalidMessage
            }
            ProtocolError::Io(_) => ErrorCode::InternalError,
            _ => ErrorCode::DecodeError,
        }
    }
}

/// Stable error codes carried in error envelopes.
///
/// The serialized form is part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Protocol
    DecodeError,
    InvalidMessage,
    MissingSubscriptionId,

    // Connection and hooks
    ConnectionRejected,
    HookError,
    Unauthorized,

    // Catalog
    ModelNotFound,
    InvalidModel,

    // Storage
    ReadError,
    CreateError,
    UpdateError,
    DeleteError,
    MetaError,

    // Subscriptions
    SubscribeError,

    InternalError,
}

impl ErrorCode {
    /// Returns whether resending the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::InternalError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DecodeError => "decode_error",
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::MissingSubscriptionId => "missing_subscription_id",
            ErrorCode::ConnectionRejected => "connection_rejected",
            ErrorCode::HookError => "hook_error",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::ModelNotFound => "model_not_found",
            ErrorCode::InvalidModel => "invalid_model",
            ErrorCode::ReadError => "read_error",
            ErrorCode::CreateError => "create_error",
            ErrorCode::UpdateError => "update_error",
            ErrorCode::DeleteError => "delete_error",
            ErrorCode::MetaError => "meta_error",
            ErrorCode::SubscribeError => "subscribe_error",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
