//! Engine lifecycle.
//!
//! The engine wires the dispatcher to its transports: it starts the broker,
//! listens on `{prefix}/+/request` and feeds every inbound payload through a
//! bounded queue into one task per message. Direct channels bypass the
//! broker entirely.

use crate::auth::{install_token_auth, TokenValidator};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, Origin};
use crate::error::ServerError;
use crate::metrics::{bind_metrics_server, serve_metrics, Metrics};
use crate::stats::StatsSnapshot;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use syncwire_broker::{BrokerAdapter, MessageCallback, SessionClosedCallback};
use syncwire_core::{Catalog, DeliveryRoute, HookRegistry, Storage};
use syncwire_protocol::{QoS, TopicLayout};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outbound buffer of a direct channel.
const CHANNEL_CAPACITY: usize = 256;

/// A running syncwire engine.
pub struct Engine {
    dispatcher: Arc<Dispatcher>,
    request_qos: QoS,
    inbound_queue: usize,
    metrics: Option<Arc<Metrics>>,
    metrics_addr: SocketAddr,
    metrics_shutdown: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Builds an engine from configuration. Nothing is bound until
    /// [`Engine::start`].
    pub fn new(
        config: &Config,
        storage: Arc<dyn Storage>,
        catalog: Catalog,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let broker = BrokerAdapter::from_config(&config.broker)?;

        let hooks = Arc::new(HookRegistry::new());
        if config.auth.required {
            let validator = TokenValidator::new(config.auth.token_hashes.iter().cloned());
            tracing::info!(
                "Token authentication enabled ({} tokens)",
                validator.token_count()
            );
            install_token_auth(&hooks, Arc::new(validator));
        }

        let metrics = if config.metrics.enabled {
            let metrics = Metrics::new().map_err(|e| ServerError::Metrics(e.to_string()))?;
            Some(Arc::new(metrics))
        } else {
            None
        };

        let dispatcher = Dispatcher::new(&config.engine, broker, storage, catalog, hooks)
            .with_metrics(metrics.clone());

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            request_qos: config.engine.request_qos,
            inbound_queue: config.engine.inbound_queue,
            metrics,
            metrics_addr: config.metrics.bind_addr,
            metrics_shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the broker, subscribes to the request wildcard and begins
    /// dispatching.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ServerError::NotRunning);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }

        if let Err(e) = self.start_transports().await {
            self.started.store(false, Ordering::SeqCst);
            if let Err(stop_err) = self.broker().stop().await {
                tracing::warn!("Failed to stop broker after start failure: {}", stop_err);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn start_transports(&self) -> Result<(), ServerError> {
        let metrics_listener = match self.metrics {
            Some(_) => Some(
                bind_metrics_server(self.metrics_addr)
                    .await
                    .map_err(|e| ServerError::Metrics(e.to_string()))?,
            ),
            None => None,
        };

        let broker = self.broker();
        if let Some(embedded) = broker.as_embedded() {
            embedded.on_session_closed(release_on_session_close(&self.dispatcher));
        }
        broker.start().await?;

        let (tx, rx) = mpsc::channel(self.inbound_queue);
        let topics = self.topics().clone();
        let callback: MessageCallback = Arc::new(move |topic: &str, payload: Bytes| {
            let Some(connection_id) = topics.connection_from_request_topic(topic) else {
                tracing::debug!("Ignoring payload on unexpected topic {}", topic);
                return;
            };
            match tx.try_send((connection_id.to_string(), payload)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Inbound queue full, dropping request from {}", connection_id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("Dispatch loop gone, dropping request from {}", connection_id);
                }
            }
        });

        let wildcard = self.topics().request_wildcard();
        broker.subscribe(&wildcard, self.request_qos, callback).await?;
        self.tasks
            .lock()
            .push(tokio::spawn(dispatch_loop(self.dispatcher.clone(), rx)));

        if let (Some(metrics), Some(listener)) = (&self.metrics, metrics_listener) {
            self.tasks.lock().push(tokio::spawn(serve_metrics(
                listener,
                metrics.clone(),
                self.metrics_shutdown.clone(),
            )));
        }

        tracing::info!(
            "Engine started ({:?} broker, listening on {})",
            broker.mode(),
            wildcard
        );
        Ok(())
    }

    /// Stops the engine. Calling it again is a no-op.
    ///
    /// Every live connection goes through the disconnect sequence before the
    /// broker is torn down. A broker that fails to stop is logged and the
    /// rest of the shutdown still runs.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Engine shutting down");

        self.dispatcher.root_token().cancel();
        let closed = self.dispatcher.disconnect_all();

        if self.started.load(Ordering::SeqCst) {
            let broker = self.broker();
            let wildcard = self.topics().request_wildcard();
            if let Err(e) = broker.unsubscribe(&wildcard).await {
                tracing::warn!("Failed to unsubscribe {}: {}", wildcard, e);
            }
            if let Err(e) = broker.stop().await {
                tracing::error!("Failed to stop broker: {}", e);
            }
        }

        self.metrics_shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Engine task ended abnormally: {}", e);
            }
        }
        tracing::info!("Engine stopped ({} connections closed)", closed);
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    /// Opens a direct channel for `connection_id`. Responses and
    /// notifications for the connection arrive on the returned handle.
    pub fn open_channel(
        &self,
        connection_id: impl Into<String>,
        identity: impl Into<String>,
    ) -> ChannelHandle {
        let (tx, outbound) = mpsc::channel(CHANNEL_CAPACITY);
        ChannelHandle {
            sender: ChannelSender {
                dispatcher: self.dispatcher.clone(),
                origin: Origin::channel(connection_id, identity, tx),
            },
            outbound,
        }
    }

    /// Runs the disconnect sequence for one connection, whichever transport
    /// it arrived on. Hooks run inline.
    pub fn disconnect(&self, connection_id: &str) -> bool {
        self.dispatcher.disconnect(connection_id)
    }

    /// Registry for application hooks. Register before traffic arrives.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        self.dispatcher.hooks()
    }

    pub fn connection_count(&self) -> usize {
        self.dispatcher.connections().count()
    }

    pub fn subscription_count(&self) -> usize {
        self.dispatcher.subscriptions().count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats().snapshot()
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn broker(&self) -> &BrokerAdapter {
        self.dispatcher.broker()
    }

    pub fn topics(&self) -> &TopicLayout {
        self.dispatcher.topics()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

/// Releases the broker-routed connection of a client whose broker session
/// ended. Channel connections with the same id are left alone.
fn release_on_session_close(dispatcher: &Arc<Dispatcher>) -> SessionClosedCallback {
    let dispatcher = Arc::downgrade(dispatcher);
    Arc::new(move |client_id: &str| {
        let Some(dispatcher) = dispatcher.upgrade() else {
            return;
        };
        let broker_routed = dispatcher
            .connections()
            .get(client_id)
            .is_some_and(|conn| matches!(conn.route(), DeliveryRoute::Broker));
        if broker_routed && dispatcher.disconnect(client_id) {
            tracing::debug!("Released connection {} after its broker session closed", client_id);
        }
    })
}

/// Drains the inbound queue, one task per message. Ordering across tasks is
/// not preserved.
async fn dispatch_loop(dispatcher: Arc<Dispatcher>, mut rx: mpsc::Receiver<(String, Bytes)>) {
    let shutdown = dispatcher.root_token().clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => {
                let Some((connection_id, payload)) = next else {
                    break;
                };
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.dispatch(Origin::broker(connection_id), payload).await;
                });
            }
        }
    }
    tracing::debug!("Dispatch loop stopped");
}

/// Inbound half of a direct channel.
#[derive(Clone)]
pub struct ChannelSender {
    dispatcher: Arc<Dispatcher>,
    origin: Origin,
}

impl ChannelSender {
    pub fn connection_id(&self) -> &str {
        &self.origin.connection_id
    }

    /// Dispatches one payload. Returns once the response has been queued on
    /// the channel, so messages sent from a single task are handled in order.
    pub async fn send(&self, payload: impl Into<Bytes>) {
        self.dispatcher
            .dispatch(self.origin.clone(), payload.into())
            .await;
    }

    /// Runs the disconnect sequence. Returns false if the connection was
    /// never registered or is already closed.
    pub fn close(&self) -> bool {
        self.dispatcher.disconnect(&self.origin.connection_id)
    }
}

/// A direct, in-order transport for one connection.
pub struct ChannelHandle {
    sender: ChannelSender,
    outbound: mpsc::Receiver<Bytes>,
}

impl ChannelHandle {
    pub fn connection_id(&self) -> &str {
        self.sender.connection_id()
    }

    pub async fn send(&self, payload: impl Into<Bytes>) {
        self.sender.send(payload).await;
    }

    /// Next response or notification.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.outbound.try_recv().ok()
    }

    /// A cloneable sender for use from other tasks.
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn close(self) -> bool {
        self.sender.close()
    }
}
