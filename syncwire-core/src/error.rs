//! Core error types.

use syncwire_protocol::ErrorCode;
use thiserror::Error;

/// Error returned by a hook to abort the current operation.
///
/// The message is reported to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HookError {
    pub code: ErrorCode,
    pub message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::HookError,
            message: message.into(),
        }
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::Unauthorized, message)
    }
}

/// Errors from a storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {table}/{id}")]
    NotFound { table: String, id: String },

    #[error("record already exists: {table}/{id}")]
    Conflict { table: String, id: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Errors resolving an entity through the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("model not found: {schema}.{entity}")]
    ModelNotFound { schema: String, entity: String },

    #[error("invalid model {schema}.{entity}: {reason}")]
    InvalidModel {
        schema: String,
        entity: String,
        reason: String,
    },
}

impl CatalogError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CatalogError::ModelNotFound { .. } => ErrorCode::ModelNotFound,
            CatalogError::InvalidModel { .. } => ErrorCode::InvalidModel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_error_defaults() {
        let err = HookError::new("tenant mismatch");
        assert_eq!(err.code, ErrorCode::HookError);
        assert_eq!(err.to_string(), "tenant mismatch");

        let err = HookError::unauthorized("bad token");
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[test]
    fn test_catalog_error_codes() {
        let err = CatalogError::ModelNotFound {
            schema: "public".into(),
            entity: "orders".into(),
        };
        assert_eq!(err.error_code(), ErrorCode::ModelNotFound);
        assert!(err.to_string().contains("public.orders"));
    }

    #[test]
    fn test_storage_not_found() {
        let err = StorageError::NotFound {
            table: "orders".into(),
            id: "7".into(),
        };
        assert!(err.is_not_found());
        assert!(!StorageError::Cancelled.is_not_found());
    }
}
