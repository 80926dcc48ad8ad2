//! High-level client API.

use crate::error::ClientError;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use syncwire_broker::{ClientTlsConfig, MessageCallback, RemoteBroker, RemoteBrokerConfig};
use syncwire_protocol::{
    FilterOption, Message, MessageCodec, Notification, Operation, QoS, QueryOptions, Response,
    ResponseMeta, TopicLayout, DEFAULT_TOPIC_PREFIX,
};
use tokio::sync::{broadcast, oneshot};

/// Default capacity for the notification channel.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker connection settings. The broker client id doubles as the
    /// syncwire connection id.
    pub broker: RemoteBrokerConfig,
    pub topic_prefix: String,
    pub request_qos: QoS,
    pub request_timeout: Duration,
    /// Credential attached to every request.
    pub auth_token: Option<String>,
}

impl ClientConfig {
    /// Configuration with a generated connection id.
    pub fn new(addr: impl Into<String>) -> Self {
        let id = format!("client-{}", uuid::Uuid::new_v4().simple());
        Self::with_connection_id(addr, id)
    }

    pub fn with_connection_id(addr: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            broker: RemoteBrokerConfig::new(addr, connection_id),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            request_qos: QoS::AtLeastOnce,
            request_timeout: Duration::from_secs(30),
            auth_token: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.broker = self.broker.with_tls(tls);
        self
    }

    pub fn connection_id(&self) -> &str {
        &self.broker.client_id
    }
}

/// One page of a list read.
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<Value>,
    pub meta: ResponseMeta,
}

/// State shared with the broker callbacks.
struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    notifications: broadcast::Sender<Notification>,
}

/// High-level client for a syncwire engine.
pub struct Client {
    config: ClientConfig,
    topics: TopicLayout,
    broker: RemoteBroker,
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl Client {
    /// Creates a new client (not yet connected).
    pub fn new(config: ClientConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            topics: TopicLayout::new(config.topic_prefix.clone()),
            broker: RemoteBroker::new(config.broker.clone()),
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                notifications,
            }),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    pub fn connection_id(&self) -> &str {
        self.config.connection_id()
    }

    /// Connects to the broker and subscribes to this connection's response
    /// and notification topics.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.broker.start().await?;

        let shared = self.shared.clone();
        let on_response: MessageCallback = Arc::new(move |topic: &str, payload: Bytes| {
            match serde_json::from_slice::<Response>(&payload) {
                Ok(response) => match shared.pending.lock().remove(&response.id) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => tracing::debug!("No pending request for id={}", response.id),
                },
                Err(e) => tracing::warn!("Undecodable response on {}: {}", topic, e),
            }
        });

        let shared = self.shared.clone();
        let on_notify: MessageCallback = Arc::new(move |topic: &str, payload: Bytes| {
            match serde_json::from_slice::<Notification>(&payload) {
                // No receivers is fine.
                Ok(note) => {
                    let _ = shared.notifications.send(note);
                }
                Err(e) => tracing::warn!("Undecodable notification on {}: {}", topic, e),
            }
        });

        let id = self.connection_id();
        let subscribed = async {
            self.broker
                .subscribe(&self.topics.response(id), QoS::AtLeastOnce, on_response)
                .await?;
            self.broker
                .subscribe(&self.topics.notify_wildcard(id), QoS::AtLeastOnce, on_notify)
                .await
        };
        if let Err(e) = subscribed.await {
            let _ = self.broker.stop().await;
            return Err(e.into());
        }

        tracing::debug!("Client {} connected", id);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Closes the broker connection. Requests still in flight fail with
    /// [`ClientError::ConnectionClosed`].
    pub async fn close(&self) -> Result<(), ClientError> {
        self.broker.stop().await?;
        self.shared.pending.lock().clear();
        Ok(())
    }

    /// Receives change notifications for this connection's subscriptions.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.shared.notifications.subscribe()
    }

    /// Sends `msg` under a fresh id and waits for the matching response.
    /// Error envelopes are returned as [`ClientError::Server`].
    pub async fn request(&self, mut msg: Message) -> Result<Response, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        msg.id = id.clone();
        if msg.auth.is_none() {
            msg.auth = self.config.auth_token.clone();
        }
        let payload = MessageCodec::encode(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id.clone(), tx);

        let topic = self.topics.request(self.connection_id());
        if let Err(e) = self
            .broker
            .publish(&topic, self.config.request_qos, payload)
            .await
        {
            self.shared.pending.lock().remove(&id);
            return Err(e.into());
        }

        let response = match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ClientError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("Request id={} timed out", id);
                self.shared.pending.lock().remove(&id);
                return Err(ClientError::Timeout);
            }
        };

        if let Some(err) = response.error {
            return Err(ClientError::Server {
                code: err.code,
                message: err.message,
            });
        }
        Ok(response)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Round-trips a ping and returns the elapsed time.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let started = Instant::now();
        self.request(Message::ping("")).await?;
        Ok(started.elapsed())
    }

    /// Lists records matching `options`.
    pub async fn read(
        &self,
        schema: &str,
        entity: &str,
        options: QueryOptions,
    ) -> Result<Page, ClientError> {
        let msg = Message::request("", Operation::Read, schema, entity).with_options(options);
        let response = self.request(msg).await?;
        let records = match response.data {
            Some(Value::Array(records)) => records,
            None => Vec::new(),
            Some(other) => {
                return Err(ClientError::UnexpectedResponse(format!(
                    "expected a list of records, got {}",
                    other
                )))
            }
        };
        Ok(Page {
            records,
            meta: response.metadata.unwrap_or_default(),
        })
    }

    /// Reads one record by primary key.
    pub async fn get(&self, schema: &str, entity: &str, id: &str) -> Result<Value, ClientError> {
        let msg = Message::request("", Operation::Read, schema, entity).with_record_id(id);
        self.data(msg).await
    }

    pub async fn create(&self, schema: &str, entity: &str, data: Value) -> Result<Value, ClientError> {
        let msg = Message::request("", Operation::Create, schema, entity).with_data(data);
        self.data(msg).await
    }

    pub async fn update(
        &self,
        schema: &str,
        entity: &str,
        id: &str,
        data: Value,
    ) -> Result<Value, ClientError> {
        let msg = Message::request("", Operation::Update, schema, entity)
            .with_record_id(id)
            .with_data(data);
        self.data(msg).await
    }

    pub async fn delete(&self, schema: &str, entity: &str, id: &str) -> Result<Value, ClientError> {
        let msg = Message::request("", Operation::Delete, schema, entity).with_record_id(id);
        self.data(msg).await
    }

    /// Returns the entity descriptor and the row count.
    pub async fn meta(&self, schema: &str, entity: &str) -> Result<(Value, u64), ClientError> {
        let msg = Message::request("", Operation::Meta, schema, entity);
        let response = self.request(msg).await?;
        let total = response.metadata.and_then(|m| m.total).unwrap_or(0);
        Ok((response.data.unwrap_or(Value::Null), total))
    }

    /// Subscribes to changes and returns the subscription id.
    pub async fn subscribe(
        &self,
        schema: &str,
        entity: &str,
        filters: Vec<FilterOption>,
    ) -> Result<String, ClientError> {
        let options = QueryOptions {
            filters,
            ..Default::default()
        };
        let msg = Message::subscribe("", schema, entity).with_options(options);
        let data = self.data(msg).await?;
        data.get("subscription_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::UnexpectedResponse("missing subscription_id".into()))
    }

    /// Returns whether a subscription was removed.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<bool, ClientError> {
        let data = self.data(Message::unsubscribe("", subscription_id)).await?;
        Ok(data.get("removed").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn data(&self, msg: Message) -> Result<Value, ClientError> {
        Ok(self.request(msg).await?.data.unwrap_or(Value::Null))
    }
}
