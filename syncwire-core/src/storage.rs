//! Storage collaborator contract.
//!
//! The engine hands the storage layer a table, a primary-key column and the
//! abstract query options from the request. How those become a concrete
//! query is up to the implementation.

use crate::error::StorageError;
use serde_json::Value;
use syncwire_protocol::{FilterOption, QueryOptions};
use tokio_util::sync::CancellationToken;

/// A stored record (a JSON object).
pub type Record = Value;

/// Target of a storage call.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub table: &'a str,
    pub primary_key: &'a str,
    /// Cancelled when the owning connection closes.
    pub cancel: &'a CancellationToken,
}

impl<'a> Scope<'a> {
    pub fn new(table: &'a str, primary_key: &'a str, cancel: &'a CancellationToken) -> Self {
        Self {
            table,
            primary_key,
            cancel,
        }
    }

    /// Fails with [`StorageError::Cancelled`] once the token fires.
    pub fn check_cancelled(&self) -> Result<(), StorageError> {
        if self.cancel.is_cancelled() {
            Err(StorageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Data operations the engine delegates.
///
/// Calls are synchronous within the handling task. Implementations should
/// honour `scope.cancel` where they can.
pub trait Storage: Send + Sync {
    /// Filtered, sorted, paginated read.
    fn find(&self, scope: Scope<'_>, options: &QueryOptions) -> Result<Vec<Record>, StorageError>;

    /// Single record by primary key.
    fn find_by_id(&self, scope: Scope<'_>, id: &str, columns: &[String])
        -> Result<Record, StorageError>;

    fn insert(&self, scope: Scope<'_>, data: Record) -> Result<Record, StorageError>;

    /// Applies `data` to the record with `id` and returns the new state.
    fn update(&self, scope: Scope<'_>, id: &str, data: Record) -> Result<Record, StorageError>;

    /// Removes the record with `id` and returns what was removed.
    fn delete(&self, scope: Scope<'_>, id: &str) -> Result<Record, StorageError>;

    fn count(&self, scope: Scope<'_>, filters: &[FilterOption]) -> Result<u64, StorageError>;
}

/// Renders a primary-key value as the string form used for lookups.
pub fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_cancellation() {
        let token = CancellationToken::new();
        let scope = Scope::new("orders", "id", &token);
        assert!(scope.check_cancelled().is_ok());
        token.cancel();
        assert!(matches!(scope.check_cancelled(), Err(StorageError::Cancelled)));
    }

    #[test]
    fn test_key_string() {
        assert_eq!(key_string(&json!(7)), Some("7".to_string()));
        assert_eq!(key_string(&json!("abc")), Some("abc".to_string()));
        assert_eq!(key_string(&json!(null)), None);
    }
}
