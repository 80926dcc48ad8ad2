//! Per-operation hook context and typed extension data.

use crate::connection::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use syncwire_protocol::{Message, Operation, QueryOptions};

/// Cross-cutting data shared between hooks.
///
/// Well-known fields are typed; anything else goes in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionContext {
    /// Authenticated identity, when an auth hook has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

impl ExtensionContext {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.extra.insert(key.into(), value.into());
    }
}

/// Mutable state threaded through one operation.
///
/// Owned by the dispatcher for the lifetime of a single message.
#[derive(Debug)]
pub struct HookContext {
    pub message: Message,
    pub connection: Arc<Connection>,
    pub operation: Option<Operation>,
    pub schema: String,
    pub entity: String,
    /// Storage table resolved through the catalog.
    pub table: String,
    pub primary_key: String,
    pub record_id: Option<String>,
    pub options: QueryOptions,
    /// Inbound payload; hooks may rewrite it before storage sees it.
    pub data: Option<Value>,
    /// Record as it was before an update or delete.
    pub before: Option<Value>,
    /// Operation result, available to `After*` hooks.
    pub result: Option<Value>,
    /// Copy of the connection's metadata. Changes made by connect hooks are
    /// stored back on the connection; during any other operation they last
    /// for this message only.
    pub extensions: ExtensionContext,
}

impl HookContext {
    pub fn new(message: Message, connection: Arc<Connection>) -> Self {
        let extensions = connection.metadata();
        Self {
            operation: message.operation.clone(),
            schema: message.schema.clone(),
            entity: message.entity.clone(),
            table: String::new(),
            primary_key: String::new(),
            record_id: message.record_id.clone(),
            options: message.options_or_default(),
            data: message.data.clone(),
            before: None,
            result: None,
            extensions,
            message,
            connection,
        }
    }

    /// Context for lifecycle hooks with no inbound message behind them
    /// (disconnect and shutdown). Carries an empty ping envelope.
    pub fn for_connection(connection: Arc<Connection>) -> Self {
        Self::new(Message::ping(String::new()), connection)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection.id
    }

    /// Replaces the connection's metadata with `extensions`.
    pub fn persist_extensions(&self) {
        let extensions = self.extensions.clone();
        self.connection.with_metadata(|meta| *meta = extensions);
    }

    /// Credential presented on the inbound message, if any.
    pub fn credential(&self) -> Option<&str> {
        self.message.auth.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DeliveryRoute;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_context_snapshot_of_message() {
        let conn = Arc::new(Connection::new(
            "c1",
            "c1",
            DeliveryRoute::Broker,
            CancellationToken::new(),
        ));
        conn.with_metadata(|m| m.roles.push("admin".into()));

        let msg = Message::request("1", Operation::Update, "public", "orders")
            .with_record_id("9")
            .with_data(json!({"status": "closed"}))
            .with_auth("secret");
        let ctx = HookContext::new(msg, conn);

        assert_eq!(ctx.operation, Some(Operation::Update));
        assert_eq!(ctx.record_id.as_deref(), Some("9"));
        assert_eq!(ctx.credential(), Some("secret"));
        assert!(ctx.extensions.has_role("admin"));
        assert_eq!(ctx.connection_id(), "c1");
    }

    #[test]
    fn test_lifecycle_context() {
        let conn = Arc::new(Connection::new(
            "c2",
            "c2",
            DeliveryRoute::Broker,
            CancellationToken::new(),
        ));
        let ctx = HookContext::for_connection(conn);
        assert_eq!(ctx.operation, None);
        assert_eq!(ctx.credential(), None);
        assert_eq!(ctx.connection_id(), "c2");
    }

    #[test]
    fn test_extensions_are_a_copy_until_persisted() {
        let conn = Arc::new(Connection::new(
            "c3",
            "c3",
            DeliveryRoute::Broker,
            CancellationToken::new(),
        ));
        let mut ctx = HookContext::for_connection(Arc::clone(&conn));
        ctx.extensions.tenant_id = Some("acme".into());
        assert!(conn.metadata().tenant_id.is_none());

        ctx.persist_extensions();
        assert_eq!(conn.metadata().tenant_id.as_deref(), Some("acme"));
        let next = HookContext::for_connection(conn);
        assert_eq!(next.extensions.tenant_id.as_deref(), Some("acme"));
    }

    #[test]
    fn test_extension_extra() {
        let mut ext = ExtensionContext::default();
        ext.insert("trace", "abc");
        assert_eq!(ext.get("trace"), Some(&json!("abc")));
    }
}
