//! In-process publish/subscribe broker.
//!
//! The broker listens for external clients and also serves in-process
//! subscribers through [`EmbeddedBroker::subscribe`]. Publishes from
//! either side reach every matching subscriber on either side.

use crate::config::EmbeddedBrokerConfig;
use crate::error::BrokerError;
use crate::router::{MessageCallback, RouteOutcome};
use crate::session::{self, Shared};
pub use crate::session::SessionClosedCallback;
use crate::stream::BrokerStream;
use crate::tls::create_tls_acceptor;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncwire_protocol::topic::{validate_filter, validate_topic};
use syncwire_protocol::QoS;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Embedded broker statistics.
#[derive(Debug, Default)]
pub struct BrokerStats {
    pub sessions_total: AtomicU64,
    pub sessions_active: AtomicUsize,
    pub sessions_refused: AtomicU64,
}

struct Running {
    token: CancellationToken,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

pub struct EmbeddedBroker {
    config: EmbeddedBrokerConfig,
    shared: Arc<Shared>,
    stats: Arc<BrokerStats>,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl EmbeddedBroker {
    pub fn new(config: EmbeddedBrokerConfig) -> Self {
        let shared = Arc::new(Shared::new(config.keep_alive()));
        Self {
            config,
            shared,
            stats: Arc::new(BrokerStats::default()),
            started: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EmbeddedBrokerConfig {
        &self.config
    }

    /// Binds the listener and starts accepting sessions.
    pub async fn start(&self) -> Result<(), BrokerError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BrokerError::AlreadyStarted);
        }

        let bound = self.bind().await;
        let (listener, acceptor) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;

        tracing::info!(
            "Embedded broker listening on {} ({})",
            local_addr,
            if acceptor.is_some() { "TLS" } else { "plain" }
        );

        let token = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            acceptor.map(Arc::new),
            self.shared.clone(),
            self.stats.clone(),
            self.config.max_connections,
            token.clone(),
        ));

        *self.running.lock() = Some(Running {
            token,
            local_addr,
            task,
        });
        Ok(())
    }

    async fn bind(&self) -> Result<(TcpListener, Option<TlsAcceptor>), BrokerError> {
        self.config.validate()?;
        let acceptor = if self.config.tls.enabled {
            Some(create_tls_acceptor(&self.config.tls)?)
        } else {
            None
        };
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        Ok((listener, acceptor))
    }

    /// Stops accepting and closes every session. In-process subscribers are
    /// kept for a later restart. A broker that never started stops without
    /// error.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };

        running.token.cancel();
        if tokio::time::timeout(Duration::from_secs(5), running.task)
            .await
            .is_err()
        {
            tracing::warn!("Embedded broker accept loop did not stop in time");
        }
        self.shared.sessions.clear();
        self.started.store(false, Ordering::SeqCst);
        tracing::info!("Embedded broker on {} stopped", running.local_addr);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.running.lock().is_some()
    }

    fn ensure_running(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::NotStarted)
        }
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<RouteOutcome, BrokerError> {
        self.ensure_running()?;
        validate_topic(topic).map_err(|_| BrokerError::InvalidTopic(topic.to_string()))?;
        Ok(self.shared.router.route(topic, qos, payload))
    }

    /// Registers an in-process subscriber for `filter`.
    pub fn subscribe(&self, filter: &str, callback: MessageCallback) -> Result<(), BrokerError> {
        self.ensure_running()?;
        validate_filter(filter).map_err(|_| BrokerError::InvalidTopic(filter.to_string()))?;
        self.shared.router.add_local(filter, callback);
        tracing::debug!("Embedded broker: local subscriber on {}", filter);
        Ok(())
    }

    /// Removing an unknown filter is a no-op.
    pub fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        self.ensure_running()?;
        self.shared.router.remove_local(filter);
        Ok(())
    }

    /// Forcibly closes the session of `client_id`.
    pub fn disconnect_client(&self, client_id: &str) -> bool {
        match self.shared.sessions.get(client_id) {
            Some(handle) => {
                tracing::info!("Disconnecting broker client '{}'", client_id);
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Registers the callback run when a client's session ends. A session
    /// replaced by a newer connection with the same client id does not
    /// trigger it. Replaces any earlier callback.
    pub fn on_session_closed(&self, callback: SessionClosedCallback) {
        *self.shared.on_closed.write() = Some(callback);
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Filters held by the live session of `client_id`, sorted.
    pub fn client_filters(&self, client_id: &str) -> Vec<String> {
        self.shared.router.client_filters(client_id)
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<Arc<TlsAcceptor>>,
    shared: Arc<Shared>,
    stats: Arc<BrokerStats>,
    max_connections: usize,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (tcp_stream, addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!("Broker accept error: {}", e);
                        continue;
                    }
                };

                if stats.sessions_active.load(Ordering::Relaxed) >= max_connections {
                    tracing::warn!("Broker connection limit reached, refusing {}", addr);
                    stats.sessions_refused.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                stats.sessions_total.fetch_add(1, Ordering::Relaxed);
                stats.sessions_active.fetch_add(1, Ordering::Relaxed);
                let _ = tcp_stream.set_nodelay(true);

                let acceptor = acceptor.clone();
                let shared = shared.clone();
                let stats = stats.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    match maybe_tls_accept(tcp_stream, acceptor.as_deref(), addr).await {
                        Ok(stream) => {
                            if let Err(e) = session::run(stream, addr, shared, token).await {
                                tracing::debug!("[{}] Broker session ended: {}", addr, e);
                            }
                        }
                        Err(e) => tracing::warn!("[{}] {}", addr, e),
                    }
                    stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
                });
            }
            _ = token.cancelled() => {
                tracing::debug!("Broker accept loop shutting down");
                break;
            }
        }
    }
}

async fn maybe_tls_accept(
    tcp_stream: TcpStream,
    acceptor: Option<&TlsAcceptor>,
    addr: SocketAddr,
) -> Result<BrokerStream, BrokerError> {
    match acceptor {
        Some(acceptor) => {
            tracing::debug!("[{}] Performing TLS handshake", addr);
            let stream = acceptor
                .accept(tcp_stream)
                .await
                .map_err(|e| BrokerError::TlsHandshake(e.to_string()))?;
            Ok(BrokerStream::ServerTls { stream })
        }
        None => Ok(BrokerStream::Plain { stream: tcp_stream }),
    }
}
