//! Connections and the connection registry.

use crate::context::ExtensionContext;
use crate::subscription::SubscriptionRegistry;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How responses and notifications reach a connection.
#[derive(Debug, Clone)]
pub enum DeliveryRoute {
    /// Published on the connection's broker topics.
    Broker,
    /// Pushed onto a direct channel.
    Channel(mpsc::Sender<Bytes>),
}

/// One logical client session.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    identity: RwLock<String>,
    subscriptions: Mutex<HashSet<String>>,
    metadata: Mutex<ExtensionContext>,
    cancel: CancellationToken,
    route: DeliveryRoute,
    created_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        identity: impl Into<String>,
        route: DeliveryRoute,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            identity: RwLock::new(identity.into()),
            subscriptions: Mutex::new(HashSet::new()),
            metadata: Mutex::new(ExtensionContext::default()),
            cancel,
            route,
            created_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> String {
        self.identity.read().clone()
    }

    /// Replaces the identity (typically from a `BeforeConnect` hook).
    pub fn set_identity(&self, identity: impl Into<String>) {
        *self.identity.write() = identity.into();
    }

    pub fn route(&self) -> &DeliveryRoute {
        &self.route
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Token cancelled when the connection closes.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn add_subscription(&self, id: impl Into<String>) {
        self.subscriptions.lock().insert(id.into());
    }

    pub fn remove_subscription(&self, id: &str) -> bool {
        self.subscriptions.lock().remove(id)
    }

    pub fn owns_subscription(&self, id: &str) -> bool {
        self.subscriptions.lock().contains(id)
    }

    pub fn subscription_ids(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Runs `f` with the metadata locked.
    pub fn with_metadata<R>(&self, f: impl FnOnce(&mut ExtensionContext) -> R) -> R {
        f(&mut self.metadata.lock())
    }

    /// Clone of the current metadata.
    pub fn metadata(&self) -> ExtensionContext {
        self.metadata.lock().clone()
    }
}

/// Concurrent table of live connections.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    subscriptions: Arc<SubscriptionRegistry>,
    root: CancellationToken,
}

impl ConnectionRegistry {
    pub fn new(subscriptions: Arc<SubscriptionRegistry>) -> Self {
        Self::with_root(subscriptions, CancellationToken::new())
    }

    /// Connection tokens are children of `root`.
    pub fn with_root(subscriptions: Arc<SubscriptionRegistry>, root: CancellationToken) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            subscriptions,
            root,
        }
    }

    /// Returns the existing connection or creates a broker-routed one.
    pub fn register(&self, id: &str, identity: &str) -> Arc<Connection> {
        self.register_with_route(id, identity, DeliveryRoute::Broker)
            .0
    }

    /// Returns `(connection, created)`.
    pub fn register_with_route(
        &self,
        id: &str,
        identity: &str,
        route: DeliveryRoute,
    ) -> (Arc<Connection>, bool) {
        if let Some(existing) = self.connections.read().get(id) {
            return (Arc::clone(existing), false);
        }
        let conn = Arc::new(Connection::new(
            id,
            identity,
            route,
            self.root.child_token(),
        ));
        self.insert(conn)
    }

    /// Inserts a pre-built connection unless one with the same id exists.
    ///
    /// Returns the connection stored under the id and whether `conn` won.
    pub fn insert(&self, conn: Arc<Connection>) -> (Arc<Connection>, bool) {
        let mut connections = self.connections.write();
        if let Some(existing) = connections.get(&conn.id) {
            return (Arc::clone(existing), false);
        }
        connections.insert(conn.id.clone(), Arc::clone(&conn));
        (conn, true)
    }

    /// Builds a connection that shares this registry's root token, without
    /// inserting it.
    pub fn build(&self, id: &str, identity: &str, route: DeliveryRoute) -> Arc<Connection> {
        Arc::new(Connection::new(
            id,
            identity,
            route,
            self.root.child_token(),
        ))
    }

    /// Removes a connection and every subscription it owns.
    ///
    /// Unknown ids are a no-op.
    pub fn unregister(&self, id: &str) -> Option<Arc<Connection>> {
        let conn = self.connections.write().remove(id)?;
        let owned = conn.subscription_ids();
        self.subscriptions.remove_all(owned.iter());
        self.subscriptions.remove_connection(id);
        conn.cancel.cancel();
        Some(conn)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(id).cloned()
    }

    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }
}
