//! Operation dispatcher.
//!
//! Every inbound payload goes through the same pipeline: decode and
//! validate, resolve (or register) the connection, run `BeforeHandle`, then
//! the operation with its `Before*`/`After*` hooks around the storage call.
//! The response goes back where the request came from; mutations are then
//! fanned out to matching subscriptions.
//!
//! Hooks and storage calls are synchronous and may block, so that part runs
//! on the blocking pool. Delivery stays on the async runtime.

use crate::config::EngineConfig;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::stats::EngineStats;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use syncwire_broker::BrokerAdapter;
use syncwire_core::{
    Catalog, Connection, ConnectionRegistry, DeliveryRoute, HookContext, HookPoint, HookRegistry,
    ModelDescriptor, Scope, Storage, StorageError, SubscriptionRegistry,
};
use syncwire_protocol::{
    ErrorCode, Message, MessageCodec, MessageType, Operation, ProtocolError, QoS, ResponseMeta,
    TopicLayout,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Where an inbound payload came from and how to answer it.
#[derive(Debug, Clone)]
pub struct Origin {
    pub connection_id: String,
    /// Identity asserted by the transport. Broker connections fall back to
    /// the message credential, then to the connection id.
    pub identity: Option<String>,
    pub route: DeliveryRoute,
}

impl Origin {
    pub fn broker(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            identity: None,
            route: DeliveryRoute::Broker,
        }
    }

    pub fn channel(
        connection_id: impl Into<String>,
        identity: impl Into<String>,
        tx: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            identity: Some(identity.into()),
            route: DeliveryRoute::Channel(tx),
        }
    }
}

/// A mutation to fan out.
#[derive(Debug)]
struct Change {
    operation: Operation,
    schema: String,
    entity: String,
    record: Value,
}

#[derive(Debug, Default)]
struct Outcome {
    data: Option<Value>,
    metadata: Option<ResponseMeta>,
    change: Option<Change>,
}

enum Failure {
    /// Refused before the connection became active.
    Rejected(ServerError),
    Failed(ServerError),
}

/// Owned storage target, so the hook context stays free to mutate.
struct Target {
    table: String,
    primary_key: String,
    cancel: CancellationToken,
}

impl Target {
    fn of(ctx: &HookContext) -> Self {
        Self {
            table: ctx.table.clone(),
            primary_key: ctx.primary_key.clone(),
            cancel: ctx.connection.cancellation_token().clone(),
        }
    }

    fn scope(&self) -> Scope<'_> {
        Scope::new(&self.table, &self.primary_key, &self.cancel)
    }

    fn fail(&self, code: ErrorCode, e: StorageError) -> ServerError {
        tracing::warn!("Storage call failed on {} ({}): {}", self.table, code, e);
        ServerError::storage(code, e)
    }

    /// Results of calls that finish after the connection closed are dropped.
    fn ensure_live(&self, code: ErrorCode) -> Result<(), ServerError> {
        if self.cancel.is_cancelled() {
            return Err(ServerError::storage(code, StorageError::Cancelled));
        }
        Ok(())
    }
}

/// Routes messages to handlers and owns the broker adapter.
pub struct Dispatcher {
    topics: TopicLayout,
    response_qos: QoS,
    notification_qos: QoS,
    hooks: Arc<HookRegistry>,
    connections: ConnectionRegistry,
    subscriptions: Arc<SubscriptionRegistry>,
    storage: Arc<dyn Storage>,
    catalog: Catalog,
    broker: BrokerAdapter,
    stats: EngineStats,
    metrics: Option<Arc<Metrics>>,
    root: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        config: &EngineConfig,
        broker: BrokerAdapter,
        storage: Arc<dyn Storage>,
        catalog: Catalog,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let root = CancellationToken::new();
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        Self {
            topics: config.topics(),
            response_qos: config.response_qos,
            notification_qos: config.notification_qos,
            hooks,
            connections: ConnectionRegistry::with_root(Arc::clone(&subscriptions), root.clone()),
            subscriptions,
            storage,
            catalog,
            broker,
            stats: EngineStats::default(),
            metrics: None,
            root,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn broker(&self) -> &BrokerAdapter {
        &self.broker
    }

    pub fn topics(&self) -> &TopicLayout {
        &self.topics
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Parent of every connection token. Cancelled on shutdown.
    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Handles one inbound payload end to end.
    pub async fn dispatch(self: &Arc<Self>, origin: Origin, payload: Bytes) {
        if self.root.is_cancelled() {
            tracing::debug!(
                "Dropping message from {}: engine shutting down",
                origin.connection_id
            );
            return;
        }
        self.stats.received();

        let msg = match decode(&payload) {
            Ok(msg) => msg,
            Err((id, e)) => {
                tracing::debug!("Rejected message from {}: {}", origin.connection_id, e);
                self.stats.rejected();
                self.count_error(e.error_code());
                self.reply_error(&origin.route, &origin.connection_id, &id, &e.into())
                    .await;
                return;
            }
        };
        if let Some(ref metrics) = self.metrics {
            metrics
                .messages_total
                .with_label_values(&[msg.msg_type.as_str()])
                .inc();
        }

        if msg.msg_type == MessageType::Ping {
            match MessageCodec::encode_pong(&msg.id) {
                Ok(pong) => self.reply(&origin.route, &origin.connection_id, pong).await,
                Err(e) => tracing::error!("Failed to encode pong: {}", e),
            }
            return;
        }

        let id = msg.id.clone();
        let op_name = msg
            .operation
            .as_ref()
            .map_or_else(|| "unknown".to_string(), |op| op.as_str().to_string());
        let route = origin.route.clone();
        let connection_id = origin.connection_id.clone();

        let timer = self.metrics.as_ref().map(|m| {
            m.operation_duration
                .with_label_values(&[op_name.as_str()])
                .start_timer()
        });
        let started = Instant::now();
        let this = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || this.process(&origin, msg))
            .await
            .unwrap_or_else(|e| Err(Failure::Failed(ServerError::Internal(e.to_string()))));
        drop(timer);

        if let Some(ref metrics) = self.metrics {
            metrics
                .operations_total
                .with_label_values(&[op_name.as_str()])
                .inc();
        }

        match result {
            Ok(outcome) => {
                self.stats.operation(true);
                tracing::debug!(
                    "{} for {} completed in {:?}",
                    op_name,
                    connection_id,
                    started.elapsed()
                );
                match MessageCodec::encode_response(&id, outcome.data, outcome.metadata) {
                    Ok(payload) => self.reply(&route, &connection_id, payload).await,
                    Err(e) => tracing::error!("Failed to encode response {}: {}", id, e),
                }
                if let Some(change) = outcome.change {
                    self.fan_out(change).await;
                }
            }
            Err(Failure::Rejected(e)) => {
                tracing::debug!("Connection {} rejected: {}", connection_id, e);
                self.stats.rejected();
                self.count_error(e.error_code());
                self.reply_error(&route, &connection_id, &id, &e).await;
            }
            Err(Failure::Failed(e)) => {
                self.stats.operation(false);
                self.count_error(e.error_code());
                self.reply_error(&route, &connection_id, &id, &e).await;
            }
        }
    }

    /// Synchronous half of [`Dispatcher::dispatch`].
    fn process(&self, origin: &Origin, msg: Message) -> Result<Outcome, Failure> {
        let conn = self
            .resolve_connection(origin, &msg)
            .map_err(Failure::Rejected)?;
        self.execute(conn, msg).map_err(Failure::Failed)
    }

    /// Returns the registered connection, registering it on first contact.
    ///
    /// `BeforeConnect` runs against a connection that is not yet visible; an
    /// error leaves nothing registered. Two first messages racing on the same
    /// id may both run `BeforeConnect`, but only the winner is registered and
    /// fires `AfterConnect`. An `AfterConnect` error unregisters the
    /// connection again without running the disconnect hooks, so the next
    /// message starts over from `BeforeConnect`.
    ///
    /// Changes the connect hooks make to `ctx.extensions` are stored as the
    /// connection's metadata.
    fn resolve_connection(&self, origin: &Origin, msg: &Message) -> Result<Arc<Connection>, ServerError> {
        if let Some(conn) = self.connections.get(&origin.connection_id) {
            return Ok(conn);
        }

        let identity = origin
            .identity
            .clone()
            .or_else(|| msg.auth.clone())
            .unwrap_or_else(|| origin.connection_id.clone());
        let candidate = self
            .connections
            .build(&origin.connection_id, &identity, origin.route.clone());

        let mut ctx = HookContext::new(msg.clone(), Arc::clone(&candidate));
        let initial = ctx.extensions.clone();
        self.hooks.execute(HookPoint::BeforeConnect, &mut ctx)?;
        if ctx.extensions != initial {
            ctx.persist_extensions();
        }

        let (conn, inserted) = self.connections.insert(candidate);
        if inserted {
            tracing::info!(
                "Connection {} registered (identity {})",
                conn.id,
                conn.identity()
            );
            if let Some(ref metrics) = self.metrics {
                metrics.connections_total.inc();
                metrics.connections_active.set(self.connections.count() as f64);
            }

            let snapshot = ctx.extensions.clone();
            if let Err(e) = self.hooks.execute(HookPoint::AfterConnect, &mut ctx) {
                self.release_failed_connect(&conn);
                return Err(e.into());
            }
            if ctx.extensions != snapshot {
                ctx.persist_extensions();
            }
        }
        Ok(conn)
    }

    fn release_failed_connect(&self, conn: &Arc<Connection>) {
        let current = self.connections.get(&conn.id);
        if current.is_some_and(|current| Arc::ptr_eq(&current, conn)) {
            self.connections.unregister(&conn.id);
            tracing::info!("Connection {} unregistered: AfterConnect failed", conn.id);
            if let Some(ref metrics) = self.metrics {
                metrics.connections_active.set(self.connections.count() as f64);
            }
            self.update_subscription_gauge();
        }
    }

    fn execute(&self, conn: Arc<Connection>, msg: Message) -> Result<Outcome, ServerError> {
        let mut ctx = HookContext::new(msg, conn);
        self.hooks.execute(HookPoint::BeforeHandle, &mut ctx)?;

        let operation = ctx
            .operation
            .clone()
            .ok_or(ProtocolError::MissingField("operation"))?;
        let (before, after) = HookPoint::for_operation(&operation).ok_or_else(|| {
            ProtocolError::InvalidMessage(format!("unknown operation '{}'", operation))
        })?;

        match operation {
            Operation::Read => self.read(&mut ctx, before, after),
            Operation::Create => self.create(&mut ctx, before, after),
            Operation::Update => self.update(&mut ctx, before, after),
            Operation::Delete => self.delete(&mut ctx, before, after),
            Operation::Meta => self.meta(&mut ctx, before, after),
            Operation::Subscribe => self.subscribe(&mut ctx, before, after),
            Operation::Unsubscribe => self.unsubscribe(&mut ctx, before, after),
            Operation::Unknown(name) => Err(ProtocolError::InvalidMessage(format!(
                "unknown operation '{}'",
                name
            ))
            .into()),
        }
    }

    /// Resolves the entity and records table and primary key on the context.
    fn prepare(&self, ctx: &mut HookContext) -> Result<ModelDescriptor, ServerError> {
        let model = self.catalog.resolve(&ctx.schema, &ctx.entity)?;
        ctx.table = model.table.clone();
        ctx.primary_key = model.primary_key.clone();
        Ok(model)
    }

    fn read(&self, ctx: &mut HookContext, before: HookPoint, after: HookPoint) -> Result<Outcome, ServerError> {
        self.prepare(ctx)?;
        self.hooks.execute(before, ctx)?;

        let target = Target::of(ctx);
        let code = ErrorCode::ReadError;
        let (data, metadata) = match ctx.record_id.clone() {
            Some(id) => {
                let record = self
                    .storage
                    .find_by_id(target.scope(), &id, &ctx.options.columns)
                    .map_err(|e| target.fail(code, e))?;
                (record, None)
            }
            None => {
                let rows = self
                    .storage
                    .find(target.scope(), &ctx.options)
                    .map_err(|e| target.fail(code, e))?;
                let total = self
                    .storage
                    .count(target.scope(), &ctx.options.filters)
                    .map_err(|e| target.fail(code, e))?;
                let metadata = ResponseMeta {
                    total: Some(total),
                    count: Some(rows.len() as u64),
                    limit: ctx.options.limit,
                    offset: ctx.options.offset,
                    ..Default::default()
                };
                (Value::Array(rows), Some(metadata))
            }
        };
        target.ensure_live(code)?;

        ctx.result = Some(data);
        self.hooks.execute(after, ctx)?;
        Ok(Outcome {
            data: ctx.result.take(),
            metadata,
            change: None,
        })
    }

    fn create(&self, ctx: &mut HookContext, before: HookPoint, after: HookPoint) -> Result<Outcome, ServerError> {
        self.prepare(ctx)?;
        self.hooks.execute(before, ctx)?;

        let target = Target::of(ctx);
        let code = ErrorCode::CreateError;
        let data = ctx.data.clone().unwrap_or_else(|| Value::Object(Map::new()));
        let record = self
            .storage
            .insert(target.scope(), data)
            .map_err(|e| target.fail(code, e))?;
        target.ensure_live(code)?;

        ctx.result = Some(record.clone());
        self.hooks.execute(after, ctx)?;
        Ok(Outcome {
            data: ctx.result.take(),
            metadata: None,
            change: Some(change(ctx, Operation::Create, record)),
        })
    }

    fn update(&self, ctx: &mut HookContext, before: HookPoint, after: HookPoint) -> Result<Outcome, ServerError> {
        self.prepare(ctx)?;
        let id = required_record_id(ctx)?;
        ctx.before = self.load_current(ctx, &id);
        self.hooks.execute(before, ctx)?;

        let target = Target::of(ctx);
        let code = ErrorCode::UpdateError;
        let data = ctx.data.clone().unwrap_or_else(|| Value::Object(Map::new()));
        let record = self
            .storage
            .update(target.scope(), &id, data)
            .map_err(|e| target.fail(code, e))?;
        target.ensure_live(code)?;

        ctx.result = Some(record.clone());
        self.hooks.execute(after, ctx)?;
        Ok(Outcome {
            data: ctx.result.take(),
            metadata: None,
            change: Some(change(ctx, Operation::Update, record)),
        })
    }

    fn delete(&self, ctx: &mut HookContext, before: HookPoint, after: HookPoint) -> Result<Outcome, ServerError> {
        self.prepare(ctx)?;
        let id = required_record_id(ctx)?;
        ctx.before = self.load_current(ctx, &id);
        self.hooks.execute(before, ctx)?;

        let target = Target::of(ctx);
        let code = ErrorCode::DeleteError;
        let removed = self
            .storage
            .delete(target.scope(), &id)
            .map_err(|e| target.fail(code, e))?;
        target.ensure_live(code)?;

        let record = match (ctx.before.clone(), removed.is_null()) {
            (Some(before), _) => before,
            (None, false) => removed.clone(),
            (None, true) => {
                let mut key = Map::new();
                key.insert(target.primary_key.clone(), Value::String(id));
                Value::Object(key)
            }
        };
        ctx.result = Some(removed);
        self.hooks.execute(after, ctx)?;
        Ok(Outcome {
            data: ctx.result.take(),
            metadata: None,
            change: Some(change(ctx, Operation::Delete, record)),
        })
    }

    fn meta(&self, ctx: &mut HookContext, before: HookPoint, after: HookPoint) -> Result<Outcome, ServerError> {
        let model = self.prepare(ctx)?;
        self.hooks.execute(before, ctx)?;

        let target = Target::of(ctx);
        let code = ErrorCode::MetaError;
        let total = self
            .storage
            .count(target.scope(), &ctx.options.filters)
            .map_err(|e| target.fail(code, e))?;
        target.ensure_live(code)?;

        let descriptor =
            serde_json::to_value(&model).map_err(|e| ServerError::Internal(e.to_string()))?;
        ctx.result = Some(descriptor);
        self.hooks.execute(after, ctx)?;
        Ok(Outcome {
            data: ctx.result.take(),
            metadata: Some(ResponseMeta {
                total: Some(total),
                ..Default::default()
            }),
            change: None,
        })
    }

    fn subscribe(&self, ctx: &mut HookContext, before: HookPoint, after: HookPoint) -> Result<Outcome, ServerError> {
        self.prepare(ctx)?;
        self.hooks.execute(before, ctx)?;

        let conn = Arc::clone(&ctx.connection);
        let sub = self.subscriptions.subscribe(
            self.subscriptions.next_id(),
            conn.id.clone(),
            ctx.schema.clone(),
            ctx.entity.clone(),
            ctx.options.filters.clone(),
        );
        conn.add_subscription(sub.id.clone());

        // A disconnect that swept the connection before the line above
        // would leave this subscription orphaned.
        let still_registered = self
            .connections
            .get(&conn.id)
            .is_some_and(|current| Arc::ptr_eq(&current, &conn));
        if !still_registered {
            self.subscriptions.unsubscribe(&sub.id);
            conn.remove_subscription(&sub.id);
            return Err(ServerError::Subscribe(format!(
                "connection {} closed",
                conn.id
            )));
        }

        tracing::debug!(
            "Subscription {} on {}.{} for {} ({} filters)",
            sub.id,
            sub.schema,
            sub.entity,
            conn.id,
            sub.filters.len()
        );
        self.update_subscription_gauge();

        ctx.result = Some(json!({
            "subscription_id": sub.id,
            "schema": sub.schema,
            "entity": sub.entity,
        }));
        self.hooks.execute(after, ctx)?;
        Ok(Outcome {
            data: ctx.result.take(),
            ..Default::default()
        })
    }

    /// Unknown ids and ids owned by other connections are a successful no-op.
    fn unsubscribe(&self, ctx: &mut HookContext, before: HookPoint, after: HookPoint) -> Result<Outcome, ServerError> {
        let sub_id = ctx
            .message
            .subscription_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or(ProtocolError::MissingSubscriptionId)?;
        self.hooks.execute(before, ctx)?;

        let conn = &ctx.connection;
        let removed = conn.remove_subscription(&sub_id)
            && self.subscriptions.unsubscribe(&sub_id).is_some();
        if removed {
            tracing::debug!("Subscription {} removed by {}", sub_id, conn.id);
            self.update_subscription_gauge();
        }

        ctx.result = Some(json!({
            "subscription_id": sub_id,
            "removed": removed,
        }));
        self.hooks.execute(after, ctx)?;
        Ok(Outcome {
            data: ctx.result.take(),
            ..Default::default()
        })
    }

    /// Current state of a record, when the storage can provide it.
    fn load_current(&self, ctx: &HookContext, id: &str) -> Option<Value> {
        let target = Target::of(ctx);
        self.storage.find_by_id(target.scope(), id, &[]).ok()
    }

    /// Publishes a notification to every matching subscription.
    ///
    /// Matches are collected before any delivery; a failed delivery is
    /// logged and the remaining subscribers still get theirs.
    async fn fan_out(&self, change: Change) -> usize {
        let matches = self
            .subscriptions
            .matching(&change.schema, &change.entity, &change.record);
        let mut delivered = 0;

        for sub in matches {
            let Some(conn) = self.connections.get(&sub.connection_id) else {
                tracing::debug!(
                    "Skipping subscription {}: connection {} is gone",
                    sub.id,
                    sub.connection_id
                );
                continue;
            };
            let payload = match MessageCodec::encode_notification(
                &sub.id,
                change.operation.clone(),
                &change.schema,
                &change.entity,
                change.record.clone(),
            ) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!("Failed to encode notification for {}: {}", sub.id, e);
                    continue;
                }
            };

            let result = match conn.route() {
                DeliveryRoute::Broker => {
                    let topic = self.topics.notify(&conn.id, &sub.id);
                    self.broker
                        .publish(&topic, self.notification_qos, payload)
                        .await
                        .map_err(|e| e.to_string())
                }
                DeliveryRoute::Channel(tx) => tx.try_send(payload).map_err(|e| e.to_string()),
            };

            let ok = result.is_ok();
            if let Err(e) = result {
                tracing::warn!(
                    "Notification {} to {} failed: {}",
                    sub.id,
                    conn.id,
                    e
                );
            } else {
                delivered += 1;
            }
            self.stats.notification(ok);
            if let Some(ref metrics) = self.metrics {
                let outcome = if ok { "sent" } else { "failed" };
                metrics.notifications_total.with_label_values(&[outcome]).inc();
            }
        }
        delivered
    }

    /// Runs the disconnect sequence. Returns false for unknown ids.
    ///
    /// `BeforeDisconnect` errors are logged; they cannot keep a connection
    /// alive.
    pub fn disconnect(&self, connection_id: &str) -> bool {
        let Some(conn) = self.connections.get(connection_id) else {
            return false;
        };
        let mut ctx = HookContext::for_connection(conn);
        if let Err(e) = self.hooks.execute(HookPoint::BeforeDisconnect, &mut ctx) {
            tracing::warn!("BeforeDisconnect hook failed for {}: {}", connection_id, e);
        }

        let Some(conn) = self.connections.unregister(connection_id) else {
            return false;
        };
        tracing::info!(
            "Connection {} unregistered (open since {})",
            connection_id,
            conn.created_at()
        );
        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.set(self.connections.count() as f64);
        }
        self.update_subscription_gauge();

        if let Err(e) = self.hooks.execute(HookPoint::AfterDisconnect, &mut ctx) {
            tracing::warn!("AfterDisconnect hook failed for {}: {}", connection_id, e);
        }
        true
    }

    /// Disconnects every live connection, returning how many were closed.
    pub fn disconnect_all(&self) -> usize {
        self.connections
            .ids()
            .iter()
            .filter(|id| self.disconnect(id))
            .count()
    }

    async fn reply(&self, route: &DeliveryRoute, connection_id: &str, payload: Bytes) {
        match route {
            DeliveryRoute::Broker => {
                let topic = self.topics.response(connection_id);
                if let Err(e) = self.broker.publish(&topic, self.response_qos, payload).await {
                    tracing::warn!("Failed to publish response on {}: {}", topic, e);
                }
            }
            DeliveryRoute::Channel(tx) => {
                if tx.send(payload).await.is_err() {
                    tracing::debug!("Channel for {} closed, response dropped", connection_id);
                }
            }
        }
    }

    async fn reply_error(&self, route: &DeliveryRoute, connection_id: &str, id: &str, e: &ServerError) {
        match MessageCodec::encode_error(id, e.error_code(), &e.to_string()) {
            Ok(payload) => self.reply(route, connection_id, payload).await,
            Err(err) => tracing::error!("Failed to encode error response {}: {}", id, err),
        }
    }

    fn count_error(&self, code: ErrorCode) {
        if let Some(ref metrics) = self.metrics {
            metrics.errors_total.with_label_values(&[code.as_str()]).inc();
        }
    }

    fn update_subscription_gauge(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .subscriptions_active
                .set(self.subscriptions.count() as f64);
        }
    }
}

/// Decodes and validates a payload. On failure returns the message id, if
/// one could be read, alongside the error.
fn decode(payload: &[u8]) -> Result<Message, (String, ProtocolError)> {
    let msg = MessageCodec::decode(payload).map_err(|e| (String::new(), e))?;
    let checked = MessageCodec::validate(&msg).and_then(|()| match msg.operation {
        Some(Operation::Update) | Some(Operation::Delete)
            if msg.record_id.as_deref().map_or(true, str::is_empty) =>
        {
            Err(ProtocolError::MissingField("record_id"))
        }
        _ => Ok(()),
    });
    match checked {
        Ok(()) => Ok(msg),
        Err(e) => Err((msg.id, e)),
    }
}

fn required_record_id(ctx: &HookContext) -> Result<String, ServerError> {
    ctx.record_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProtocolError::MissingField("record_id").into())
}

fn change(ctx: &HookContext, operation: Operation, record: Value) -> Change {
    Change {
        operation,
        schema: ctx.schema.clone(),
        entity: ctx.entity.clone(),
        record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use syncwire_broker::BrokerConfig;
    use syncwire_core::{HookError, MemoryStore, ModelRegistry};
    use syncwire_protocol::{FilterOption, QueryOptions, Response};

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        store: Arc<MemoryStore>,
    }

    fn harness_with(catalog: Catalog) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let broker = BrokerAdapter::from_config(&BrokerConfig::default()).unwrap();
        let dispatcher = Dispatcher::new(
            &EngineConfig::default(),
            broker,
            store.clone(),
            catalog,
            Arc::new(HookRegistry::new()),
        );
        Harness {
            dispatcher: Arc::new(dispatcher),
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(Catalog::permissive())
    }

    struct Peer {
        origin: Origin,
        rx: mpsc::Receiver<Bytes>,
    }

    fn peer(id: &str) -> Peer {
        let (tx, rx) = mpsc::channel(64);
        Peer {
            origin: Origin::channel(id, id, tx),
            rx,
        }
    }

    impl Peer {
        async fn call(&mut self, dispatcher: &Arc<Dispatcher>, msg: &Message) -> Response {
            let payload = MessageCodec::encode(msg).unwrap();
            dispatcher.dispatch(self.origin.clone(), payload).await;
            self.response().await
        }

        async fn response(&mut self) -> Response {
            let bytes = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .unwrap()
                .unwrap();
            serde_json::from_slice(&bytes).unwrap()
        }

        fn pending(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(bytes) = self.rx.try_recv() {
                out.push(serde_json::from_slice(&bytes).unwrap());
            }
            out
        }
    }

    fn create(id: &str, data: Value) -> Message {
        Message::request(id, Operation::Create, "public", "orders").with_data(data)
    }

    fn subscribe_open(id: &str) -> Message {
        Message::subscribe(id, "public", "orders").with_options(
            QueryOptions::default().with_filter(FilterOption::eq("status", "open")),
        )
    }

    #[tokio::test]
    async fn test_invalid_messages_rejected_before_registration() {
        let h = harness();
        let mut c = peer("c1");

        h.dispatcher
            .dispatch(c.origin.clone(), Bytes::from_static(b"{not json"))
            .await;
        let resp = c.response().await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, ErrorCode::DecodeError);

        let resp = c
            .call(&h.dispatcher, &Message::request("m1", Operation::Read, "", "orders"))
            .await;
        assert_eq!(resp.id, "m1");
        assert_eq!(resp.error.unwrap().code, ErrorCode::InvalidMessage);

        let resp = c
            .call(&h.dispatcher, &Message::request("m2", Operation::Update, "public", "orders"))
            .await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::InvalidMessage);

        let resp = c.call(&h.dispatcher, &Message::unsubscribe("m3", "")).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::MissingSubscriptionId);

        assert_eq!(h.dispatcher.connections().count(), 0);
        assert_eq!(h.dispatcher.stats().snapshot().messages_rejected, 4);
    }

    #[tokio::test]
    async fn test_ping_does_not_register() {
        let h = harness();
        let mut c = peer("c1");
        let resp = c.call(&h.dispatcher, &Message::ping("p1")).await;
        assert_eq!(resp.id, "p1");
        assert_eq!(resp.msg_type, MessageType::Pong);
        assert!(resp.success);
        assert_eq!(h.dispatcher.connections().count(), 0);
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let h = harness();
        let mut c = peer("c1");

        let resp = c
            .call(&h.dispatcher, &create("1", json!({"status": "open", "total": 10})))
            .await;
        assert!(resp.success);
        assert_eq!(resp.data.as_ref().unwrap()["id"], json!(1));
        c.call(&h.dispatcher, &create("2", json!({"status": "closed"})))
            .await;
        assert_eq!(h.store.len("public.orders"), 2);
        assert_eq!(h.dispatcher.connections().count(), 1);

        let read = Message::request("3", Operation::Read, "public", "orders").with_options(
            QueryOptions::default()
                .with_filter(FilterOption::eq("status", "open"))
                .with_limit(5),
        );
        let resp = c.call(&h.dispatcher, &read).await;
        assert_eq!(resp.data.unwrap().as_array().unwrap().len(), 1);
        let meta = resp.metadata.unwrap();
        assert_eq!(meta.total, Some(1));
        assert_eq!(meta.count, Some(1));
        assert_eq!(meta.limit, Some(5));

        let single = Message::request("4", Operation::Read, "public", "orders").with_record_id("2");
        let resp = c.call(&h.dispatcher, &single).await;
        assert_eq!(resp.data.unwrap()["status"], json!("closed"));

        let missing = Message::request("5", Operation::Read, "public", "orders").with_record_id("99");
        let resp = c.call(&h.dispatcher, &missing).await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, ErrorCode::ReadError);
        assert!(err.message.contains("not found"));
    }

    #[tokio::test]
    async fn test_hook_short_circuit() {
        let h = harness();
        let ran = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        h.dispatcher
            .hooks()
            .register(HookPoint::BeforeCreate, move |_: &mut HookContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        let counter = ran.clone();
        h.dispatcher
            .hooks()
            .register(HookPoint::BeforeCreate, move |_: &mut HookContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HookError::new("orders are frozen"))
            });
        let counter = third.clone();
        h.dispatcher
            .hooks()
            .register(HookPoint::BeforeCreate, move |_: &mut HookContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let mut c = peer("c1");
        let resp = c
            .call(&h.dispatcher, &create("1", json!({"status": "open"})))
            .await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, ErrorCode::HookError);
        assert_eq!(err.message, "orders are frozen");
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(third.load(Ordering::SeqCst), 0);
        assert!(h.store.is_empty("public.orders"));
        assert_eq!(h.dispatcher.stats().snapshot().operations_failed, 1);
    }

    #[tokio::test]
    async fn test_after_hook_error_keeps_mutation() {
        let h = harness();
        h.dispatcher
            .hooks()
            .register(HookPoint::AfterCreate, |_: &mut HookContext| {
                Err(HookError::new("audit log unavailable"))
            });

        let mut c = peer("c1");
        let resp = c
            .call(&h.dispatcher, &create("1", json!({"status": "open"})))
            .await;
        assert_eq!(resp.error.unwrap().message, "audit log unavailable");
        assert_eq!(h.store.len("public.orders"), 1);
    }

    #[tokio::test]
    async fn test_before_handle_sees_every_operation() {
        let h = harness();
        h.dispatcher
            .hooks()
            .register(HookPoint::BeforeHandle, |ctx: &mut HookContext| {
                if ctx.entity == "secrets" {
                    return Err(HookError::unauthorized("no access to secrets"));
                }
                Ok(())
            });

        let mut c = peer("c1");
        let read = Message::request("1", Operation::Read, "public", "secrets");
        let resp = c.call(&h.dispatcher, &read).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::Unauthorized);

        let resp = c.call(&h.dispatcher, &Message::subscribe("2", "public", "secrets")).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::Unauthorized);
        assert_eq!(h.dispatcher.subscriptions().count(), 0);
    }

    #[tokio::test]
    async fn test_before_connect_rejection_registers_nothing() {
        let h = harness();
        let after = Arc::new(AtomicUsize::new(0));
        h.dispatcher
            .hooks()
            .register(HookPoint::BeforeConnect, |ctx: &mut HookContext| {
                match ctx.credential() {
                    Some("letmein") => {
                        ctx.connection
                            .with_metadata(|m| m.tenant_id = Some("acme".into()));
                        Ok(())
                    }
                    _ => Err(HookError::unauthorized("bad credential")),
                }
            });
        let counter = after.clone();
        h.dispatcher
            .hooks()
            .register(HookPoint::AfterConnect, move |_: &mut HookContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let mut c = peer("c1");
        let resp = c.call(&h.dispatcher, &create("1", json!({}))).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::Unauthorized);
        assert_eq!(h.dispatcher.connections().count(), 0);
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert!(h.store.is_empty("public.orders"));

        let resp = c
            .call(&h.dispatcher, &create("2", json!({})).with_auth("letmein"))
            .await;
        assert!(resp.success);
        let conn = h.dispatcher.connections().get("c1").unwrap();
        assert_eq!(conn.metadata().tenant_id.as_deref(), Some("acme"));

        c.call(&h.dispatcher, &create("3", json!({}))).await;
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fan_out_matches_filters() {
        let h = harness();
        let mut c = peer("client-42");

        let resp = c.call(&h.dispatcher, &subscribe_open("s")).await;
        let data = resp.data.unwrap();
        assert_eq!(data["subscription_id"], json!("sub-1"));
        assert_eq!(data["entity"], json!("orders"));

        c.call(&h.dispatcher, &create("1", json!({"status": "open"})))
            .await;
        let notes = c.pending();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0]["type"], json!("notification"));
        assert_eq!(notes[0]["subscription_id"], json!("sub-1"));
        assert_eq!(notes[0]["operation"], json!("create"));
        assert_eq!(notes[0]["data"]["status"], json!("open"));

        c.call(&h.dispatcher, &create("2", json!({"status": "closed"})))
            .await;
        assert!(c.pending().is_empty());

        let snapshot = h.dispatcher.stats().snapshot();
        assert_eq!(snapshot.notifications_sent, 1);
        assert_eq!(snapshot.notification_failures, 0);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_other_connections() {
        let h = harness();
        let mut watcher = peer("watcher");
        let mut writer = peer("writer");

        watcher
            .call(&h.dispatcher, &Message::subscribe("s", "public", "orders"))
            .await;
        writer
            .call(&h.dispatcher, &create("1", json!({"status": "open"})))
            .await;
        writer
            .call(
                &h.dispatcher,
                &Message::request("2", Operation::Update, "public", "orders")
                    .with_record_id("1")
                    .with_data(json!({"status": "closed"})),
            )
            .await;
        writer
            .call(
                &h.dispatcher,
                &Message::request("3", Operation::Delete, "public", "orders").with_record_id("1"),
            )
            .await;

        assert!(writer.pending().is_empty());
        let notes = watcher.pending();
        let ops: Vec<_> = notes.iter().map(|n| n["operation"].clone()).collect();
        assert_eq!(ops, vec![json!("create"), json!("update"), json!("delete")]);
        assert_eq!(notes[1]["data"]["status"], json!("closed"));
        // The deleted record is the state prior to deletion.
        assert_eq!(notes[2]["data"]["status"], json!("closed"));
    }

    #[tokio::test]
    async fn test_update_exposes_previous_state_to_hooks() {
        let h = harness();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let slot = seen.clone();
        h.dispatcher
            .hooks()
            .register(HookPoint::BeforeUpdate, move |ctx: &mut HookContext| {
                *slot.lock() = ctx.before.clone();
                Ok(())
            });

        let mut c = peer("c1");
        c.call(&h.dispatcher, &create("1", json!({"status": "open"})))
            .await;
        let resp = c
            .call(
                &h.dispatcher,
                &Message::request("2", Operation::Update, "public", "orders")
                    .with_record_id("1")
                    .with_data(json!({"status": "shipped"})),
            )
            .await;
        assert_eq!(resp.data.unwrap()["status"], json!("shipped"));
        assert_eq!(seen.lock().clone().unwrap()["status"], json!("open"));

        let resp = c
            .call(
                &h.dispatcher,
                &Message::request("3", Operation::Update, "public", "orders")
                    .with_record_id("77")
                    .with_data(json!({"status": "x"})),
            )
            .await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::UpdateError);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_owner_scoped() {
        let h = harness();
        let mut owner = peer("owner");
        let mut other = peer("other");

        owner.call(&h.dispatcher, &subscribe_open("s")).await;

        let resp = other.call(&h.dispatcher, &Message::unsubscribe("u0", "sub-1")).await;
        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["removed"], json!(false));
        assert_eq!(h.dispatcher.subscriptions().count(), 1);

        let resp = owner.call(&h.dispatcher, &Message::unsubscribe("u1", "sub-1")).await;
        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["removed"], json!(true));

        let resp = owner.call(&h.dispatcher, &Message::unsubscribe("u2", "sub-1")).await;
        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["removed"], json!(false));
        assert_eq!(h.dispatcher.subscriptions().count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_subscriptions() {
        let h = harness();
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for point in [HookPoint::BeforeDisconnect, HookPoint::AfterDisconnect] {
            let events = events.clone();
            h.dispatcher.hooks().register(point, move |ctx: &mut HookContext| {
                events.lock().push(format!("{}:{}", point, ctx.connection_id()));
                Ok(())
            });
        }

        let mut c = peer("c1");
        c.call(&h.dispatcher, &subscribe_open("s1")).await;
        c.call(&h.dispatcher, &Message::subscribe("s2", "public", "orders"))
            .await;
        assert_eq!(h.dispatcher.subscriptions().list_by_entity("public", "orders").len(), 2);

        let conn = h.dispatcher.connections().get("c1").unwrap();
        assert!(h.dispatcher.disconnect("c1"));
        assert!(conn.is_closed());
        assert!(h
            .dispatcher
            .subscriptions()
            .list_by_entity("public", "orders")
            .is_empty());
        assert_eq!(h.dispatcher.connections().count(), 0);
        assert_eq!(
            *events.lock(),
            vec!["BeforeDisconnect:c1", "AfterDisconnect:c1"]
        );

        assert!(!h.dispatcher.disconnect("c1"));
        assert_eq!(events.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_meta_and_strict_catalog() {
        let registry = Arc::new(ModelRegistry::new());
        registry.register(
            ModelDescriptor::new("public", "orders")
                .with_table("orders")
                .with_primary_key("order_id"),
        );
        let h = harness_with(Catalog::new(vec![registry]));
        let mut c = peer("c1");

        let resp = c
            .call(&h.dispatcher, &create("1", json!({"status": "open"})))
            .await;
        assert_eq!(resp.data.unwrap()["order_id"], json!(1));
        assert_eq!(h.store.len("orders"), 1);

        let resp = c
            .call(&h.dispatcher, &Message::request("2", Operation::Meta, "public", "orders"))
            .await;
        assert_eq!(resp.data.unwrap()["primary_key"], json!("order_id"));
        assert_eq!(resp.metadata.unwrap().total, Some(1));

        let resp = c
            .call(&h.dispatcher, &Message::request("3", Operation::Read, "public", "users"))
            .await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::ModelNotFound);
    }

    #[tokio::test]
    async fn test_shutdown_drops_new_messages() {
        let h = harness();
        let mut c = peer("c1");
        c.call(&h.dispatcher, &create("1", json!({}))).await;

        h.dispatcher.root_token().cancel();
        assert_eq!(h.dispatcher.disconnect_all(), 1);

        let payload = MessageCodec::encode(&create("2", json!({}))).unwrap();
        h.dispatcher.dispatch(c.origin.clone(), payload).await;
        assert!(c.pending().is_empty());
        assert_eq!(h.store.len("public.orders"), 1);
    }

    #[tokio::test]
    async fn test_connect_hook_extensions_reach_later_operations() {
        let h = harness();
        h.dispatcher
            .hooks()
            .register(HookPoint::BeforeConnect, |ctx: &mut HookContext| {
                ctx.extensions.tenant_id = Some("acme".into());
                ctx.extensions.roles.push("reader".into());
                Ok(())
            });
        h.dispatcher
            .hooks()
            .register(HookPoint::AfterConnect, |ctx: &mut HookContext| {
                ctx.extensions.insert("region", "eu");
                Ok(())
            });
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        h.dispatcher
            .hooks()
            .register(HookPoint::BeforeRead, move |ctx: &mut HookContext| {
                sink.lock().push(ctx.extensions.clone());
                // Not kept past this message.
                ctx.extensions.tenant_id = Some("other".into());
                Ok(())
            });

        let mut c = peer("c1");
        let read = Message::request("1", Operation::Read, "public", "orders");
        assert!(c.call(&h.dispatcher, &read).await.success);
        assert!(c.call(&h.dispatcher, &read).await.success);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        for ext in seen.iter() {
            assert_eq!(ext.tenant_id.as_deref(), Some("acme"));
            assert!(ext.has_role("reader"));
            assert_eq!(ext.get("region"), Some(&json!("eu")));
        }
        let conn = h.dispatcher.connections().get("c1").unwrap();
        assert_eq!(conn.metadata().tenant_id.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_after_connect_failure_unregisters() {
        let h = harness();
        let refuse = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let flag = refuse.clone();
        h.dispatcher
            .hooks()
            .register(HookPoint::AfterConnect, move |_: &mut HookContext| {
                if flag.load(Ordering::SeqCst) {
                    Err(HookError::new("session store unavailable"))
                } else {
                    Ok(())
                }
            });
        let counter = disconnects.clone();
        h.dispatcher
            .hooks()
            .register(HookPoint::AfterDisconnect, move |_: &mut HookContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let mut c = peer("c1");
        let resp = c.call(&h.dispatcher, &create("1", json!({}))).await;
        assert_eq!(resp.error.unwrap().message, "session store unavailable");
        assert_eq!(h.dispatcher.connections().count(), 0);
        assert!(h.store.is_empty("public.orders"));
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(h.dispatcher.stats().snapshot().messages_rejected, 1);

        refuse.store(false, Ordering::SeqCst);
        let resp = c.call(&h.dispatcher, &create("2", json!({}))).await;
        assert!(resp.success);
        assert_eq!(h.dispatcher.connections().count(), 1);
        assert_eq!(h.store.len("public.orders"), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_stop_fan_out() {
        let h = harness();
        let mut gone = peer("gone");
        let mut live = peer("live");
        let mut writer = peer("writer");

        gone.call(&h.dispatcher, &Message::subscribe("s", "public", "orders"))
            .await;
        live.call(&h.dispatcher, &Message::subscribe("s", "public", "orders"))
            .await;
        drop(gone.rx);

        let resp = writer
            .call(&h.dispatcher, &create("1", json!({"status": "open"})))
            .await;
        assert!(resp.success);

        let notes = live.pending();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0]["data"]["status"], json!("open"));

        let snapshot = h.dispatcher.stats().snapshot();
        assert_eq!(snapshot.notifications_sent, 1);
        assert_eq!(snapshot.notification_failures, 1);
    }

    /// Delegates to a [`MemoryStore`], then cancels the caller's token as if
    /// the connection closed while the call was in flight.
    struct ClosesDuringWrite(MemoryStore);

    impl Storage for ClosesDuringWrite {
        fn find(&self, scope: Scope<'_>, options: &QueryOptions) -> Result<Vec<Value>, StorageError> {
            self.0.find(scope, options)
        }

        fn find_by_id(&self, scope: Scope<'_>, id: &str, columns: &[String]) -> Result<Value, StorageError> {
            self.0.find_by_id(scope, id, columns)
        }

        fn insert(&self, scope: Scope<'_>, data: Value) -> Result<Value, StorageError> {
            let record = self.0.insert(scope, data);
            scope.cancel.cancel();
            record
        }

        fn update(&self, scope: Scope<'_>, id: &str, data: Value) -> Result<Value, StorageError> {
            self.0.update(scope, id, data)
        }

        fn delete(&self, scope: Scope<'_>, id: &str) -> Result<Value, StorageError> {
            self.0.delete(scope, id)
        }

        fn count(&self, scope: Scope<'_>, filters: &[FilterOption]) -> Result<u64, StorageError> {
            self.0.count(scope, filters)
        }
    }

    #[tokio::test]
    async fn test_result_after_connection_closed_is_discarded() {
        let broker = BrokerAdapter::from_config(&BrokerConfig::default()).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            &EngineConfig::default(),
            broker,
            Arc::new(ClosesDuringWrite(MemoryStore::new())),
            Catalog::permissive(),
            Arc::new(HookRegistry::new()),
        ));
        let after = Arc::new(AtomicUsize::new(0));
        let counter = after.clone();
        dispatcher
            .hooks()
            .register(HookPoint::AfterCreate, move |_: &mut HookContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let mut watcher = peer("watcher");
        let mut writer = peer("writer");
        watcher
            .call(&dispatcher, &Message::subscribe("s", "public", "orders"))
            .await;

        let resp = writer
            .call(&dispatcher, &create("1", json!({"status": "open"})))
            .await;
        assert!(!resp.success);
        assert!(resp.data.is_none());
        assert_eq!(resp.error.unwrap().code, ErrorCode::CreateError);

        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert!(watcher.pending().is_empty());
        let snapshot = dispatcher.stats().snapshot();
        assert_eq!(snapshot.notifications_sent, 0);
        assert_eq!(snapshot.operations_failed, 1);
    }
}
