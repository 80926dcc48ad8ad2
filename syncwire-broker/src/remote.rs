//! Client for an external broker.
//!
//! Topic filters passed to [`RemoteBroker::subscribe`] are stored
//! independently of the socket. When the connection drops, a supervisor
//! task reconnects with exponential backoff and re-issues every stored
//! filter, so callers never resubscribe by hand.

use crate::config::RemoteBrokerConfig;
use crate::error::BrokerError;
use crate::router::MessageCallback;
use crate::stream::BrokerStream;
use crate::tls::create_tls_connector;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use syncwire_protocol::topic::{topic_matches, validate_filter, validate_topic};
use syncwire_protocol::{Packet, PacketDecoder, PacketHeader, QoS};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Connection state of the external broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting,
}

#[derive(Clone)]
struct StoredFilter {
    qos: QoS,
    callback: MessageCallback,
}

struct Reader {
    half: ReadHalf<BrokerStream>,
    decoder: PacketDecoder,
}

struct Inner {
    config: RemoteBrokerConfig,
    started: AtomicBool,
    state: Mutex<ConnectionState>,
    filters: RwLock<HashMap<String, StoredFilter>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BrokerStream>>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    next_packet_id: AtomicU32,
    reconnects: AtomicU64,
    supervisor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

pub struct RemoteBroker {
    inner: Arc<Inner>,
}

impl RemoteBroker {
    pub fn new(config: RemoteBrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                started: AtomicBool::new(false),
                state: Mutex::new(ConnectionState::Disconnected),
                filters: RwLock::new(HashMap::new()),
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_packet_id: AtomicU32::new(1),
                reconnects: AtomicU64::new(0),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RemoteBrokerConfig {
        &self.inner.config
    }

    /// Connects and completes the handshake. Errors of the first connect are
    /// returned here; later losses are handled by reconnecting.
    pub async fn start(&self) -> Result<(), BrokerError> {
        let inner = &self.inner;
        if inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BrokerError::AlreadyStarted);
        }

        let reader = match inner.connect().await {
            Ok(reader) => reader,
            Err(e) => {
                inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        inner.set_state(ConnectionState::Connected);
        inner.resubscribe().await;

        let token = CancellationToken::new();
        let task = tokio::spawn(supervise(inner.clone(), reader, token.clone()));
        *inner.supervisor.lock() = Some((token, task));
        tracing::info!(
            "Connected to broker {} as '{}'",
            inner.config.addr,
            inner.config.client_id
        );
        Ok(())
    }

    /// Disconnects. Stored filters are kept for a later start.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        let inner = &self.inner;
        let supervisor = inner.supervisor.lock().take();
        let Some((token, task)) = supervisor else {
            return Ok(());
        };

        let _ = inner
            .write(&Packet::new(PacketHeader::Disconnect { reason: None }))
            .await;
        token.cancel();
        if let Some(mut writer) = inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            tracing::warn!("Broker supervisor did not stop in time");
        }
        inner.fail_pending();
        inner.set_state(ConnectionState::Disconnected);
        inner.started.store(false, Ordering::SeqCst);
        tracing::info!("Disconnected from broker {}", inner.config.addr);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Number of successful reconnects since creation.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::Relaxed)
    }

    /// Stored topic filters, sorted.
    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.inner.filters.read().keys().cloned().collect();
        filters.sort();
        filters
    }

    /// Publishes `payload`. At QoS 1 and above, waits for the broker's
    /// acknowledgement.
    pub async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), BrokerError> {
        let inner = &self.inner;
        inner.ensure_started()?;
        validate_topic(topic).map_err(|_| BrokerError::InvalidTopic(topic.to_string()))?;
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        if !qos.requires_ack() {
            return inner.write(&Packet::publish(topic, qos, None, payload)).await;
        }
        let packet_id = inner.packet_id();
        let packet = Packet::publish(topic, qos, Some(packet_id), payload);
        inner.request(packet_id, &packet).await
    }

    /// Stores `filter` and subscribes to it. While reconnecting the filter
    /// is only stored and takes effect once the connection is back.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        callback: MessageCallback,
    ) -> Result<(), BrokerError> {
        let inner = &self.inner;
        inner.ensure_started()?;
        validate_filter(filter).map_err(|_| BrokerError::InvalidTopic(filter.to_string()))?;
        inner
            .filters
            .write()
            .insert(filter.to_string(), StoredFilter { qos, callback });

        if !self.is_connected() {
            tracing::debug!("Stored filter {} until the broker connection is back", filter);
            return Ok(());
        }
        let packet_id = inner.packet_id();
        let packet = Packet::new(PacketHeader::Subscribe {
            packet_id,
            filter: filter.to_string(),
            qos,
        });
        inner.request(packet_id, &packet).await
    }

    /// Forgets `filter` so it is not re-issued after a reconnect.
    pub async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        let inner = &self.inner;
        inner.ensure_started()?;
        let removed = inner.filters.write().remove(filter).is_some();
        if !removed || !self.is_connected() {
            return Ok(());
        }
        let packet_id = inner.packet_id();
        let packet = Packet::new(PacketHeader::Unsubscribe {
            packet_id,
            filter: filter.to_string(),
        });
        inner.request(packet_id, &packet).await
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn ensure_started(&self) -> Result<(), BrokerError> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotStarted)
        }
    }

    fn packet_id(&self) -> u32 {
        self.next_packet_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn write(&self, packet: &Packet) -> Result<(), BrokerError> {
        let bytes = packet.encode()?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BrokerError::NotConnected)?;
        writer.write_all(&bytes).await?;
        Ok(())
    }

    /// Writes `packet` and waits for the acknowledgement carrying `packet_id`.
    async fn request(&self, packet_id: u32, packet: &Packet) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(packet_id, tx);
        if let Err(e) = self.write(packet).await {
            self.pending.lock().remove(&packet_id);
            return Err(e);
        }
        match tokio::time::timeout(self.config.ack_timeout(), rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BrokerError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&packet_id);
                Err(BrokerError::Timeout)
            }
        }
    }

    fn complete(&self, packet_id: u32) {
        if let Some(tx) = self.pending.lock().remove(&packet_id) {
            let _ = tx.send(());
        }
    }

    /// Drops every waiter; they observe `ConnectionClosed`.
    fn fail_pending(&self) {
        self.pending.lock().clear();
    }

    async fn connect(&self) -> Result<Reader, BrokerError> {
        let config = &self.config;
        let timeout = config.connect_timeout();

        let tcp_stream = tokio::time::timeout(timeout, TcpStream::connect(config.addr.as_str()))
            .await
            .map_err(|_| BrokerError::Timeout)??;
        let _ = tcp_stream.set_nodelay(true);

        let stream = if config.tls.enabled {
            let (connector, server_name) = create_tls_connector(&config.tls, config.host())?;
            let tls_stream = connector
                .connect(server_name, tcp_stream)
                .await
                .map_err(|e| BrokerError::TlsHandshake(e.to_string()))?;
            BrokerStream::ClientTls { stream: tls_stream }
        } else {
            BrokerStream::Plain { stream: tcp_stream }
        };

        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = Reader {
            half: read_half,
            decoder: PacketDecoder::new(),
        };

        let connect = Packet::new(PacketHeader::Connect {
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            clean_session: config.clean_session,
            keep_alive_secs: config.keep_alive_secs.min(u64::from(u16::MAX)) as u16,
        });
        write_half.write_all(&connect.encode()?).await?;

        let ack = tokio::time::timeout(timeout, read_one(&mut reader))
            .await
            .map_err(|_| BrokerError::Timeout)??;
        match ack.header {
            PacketHeader::ConnAck { accepted: true, .. } => {}
            PacketHeader::ConnAck { reason, .. } => {
                return Err(BrokerError::ConnectionRefused(
                    reason.unwrap_or_else(|| "no reason given".to_string()),
                ))
            }
            other => return Err(BrokerError::UnexpectedPacket(other.kind().to_string())),
        }

        *self.writer.lock().await = Some(write_half);
        Ok(reader)
    }

    /// Re-issues every stored filter without waiting for acknowledgements;
    /// acks arrive on the read loop which is not running yet.
    async fn resubscribe(&self) {
        let filters: Vec<(String, QoS)> = self
            .filters
            .read()
            .iter()
            .map(|(filter, stored)| (filter.clone(), stored.qos))
            .collect();
        if filters.is_empty() {
            return;
        }

        let mut buf = BytesMut::new();
        for (filter, qos) in &filters {
            let packet = Packet::new(PacketHeader::Subscribe {
                packet_id: self.packet_id(),
                filter: filter.clone(),
                qos: *qos,
            });
            if let Err(e) = packet.encode_into(&mut buf) {
                tracing::error!("Failed to encode subscribe for {}: {}", filter, e);
            }
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return;
        };
        match writer.write_all(&buf).await {
            Ok(()) => tracing::info!("Resubscribed {} topic filter(s)", filters.len()),
            Err(e) => tracing::warn!("Resubscribe failed: {}", e),
        }
    }

    fn dispatch(&self, topic: &str, payload: Bytes) {
        let callbacks: Vec<MessageCallback> = self
            .filters
            .read()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, stored)| stored.callback.clone())
            .collect();
        if callbacks.is_empty() {
            tracing::debug!("No subscriber for {}", topic);
        }
        for callback in callbacks {
            callback(topic, payload.clone());
        }
    }

    /// Reads until the connection fails or `token` is cancelled.
    async fn read_loop(&self, reader: &mut Reader, token: &CancellationToken) -> Result<(), BrokerError> {
        let mut buf = vec![0u8; 8192];
        let keep_alive = self.config.keep_alive();
        let period = keep_alive.unwrap_or(Duration::from_secs(3600));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),

                result = reader.half.read(&mut buf) => {
                    let n = result?;
                    if n == 0 {
                        return Err(BrokerError::ConnectionClosed);
                    }
                    last_seen = Instant::now();
                    reader.decoder.extend(&buf[..n]);
                }

                _ = ticker.tick() => {
                    if let Some(keep_alive) = keep_alive {
                        if last_seen.elapsed() > keep_alive * 3 / 2 {
                            return Err(BrokerError::Timeout);
                        }
                        self.write(&Packet::new(PacketHeader::PingReq)).await?;
                    }
                }
            }

            while let Some(packet) = reader.decoder.decode()? {
                self.handle(packet).await?;
            }
        }
    }

    async fn handle(&self, packet: Packet) -> Result<(), BrokerError> {
        match packet.header {
            PacketHeader::Publish {
                packet_id,
                topic,
                qos,
            } => {
                if let (Some(packet_id), true) = (packet_id, qos.requires_ack()) {
                    self.write(&Packet::new(PacketHeader::PubAck { packet_id }))
                        .await?;
                }
                self.dispatch(&topic, packet.payload);
            }
            PacketHeader::PubAck { packet_id }
            | PacketHeader::SubAck { packet_id, .. }
            | PacketHeader::UnsubAck { packet_id } => self.complete(packet_id),
            PacketHeader::PingResp => {}
            PacketHeader::Disconnect { reason } => {
                tracing::warn!(
                    "Broker closed the connection: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                return Err(BrokerError::ConnectionClosed);
            }
            other => tracing::warn!("Ignoring unexpected {} from broker", other.kind()),
        }
        Ok(())
    }

    /// Reconnects with exponential backoff. `None` when cancelled or out of
    /// attempts.
    async fn reconnect(&self, token: &CancellationToken) -> Option<Reader> {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut attempt: u32 = 0;
        loop {
            if max_attempts > 0 && attempt >= max_attempts {
                tracing::error!(
                    "Giving up on broker {} after {} attempt(s)",
                    self.config.addr,
                    attempt
                );
                return None;
            }
            let delay = self.config.backoff(attempt);
            attempt += 1;
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            tracing::info!(
                "Reconnecting to broker {} (attempt {})",
                self.config.addr,
                attempt
            );
            let result = tokio::select! {
                _ = token.cancelled() => return None,
                result = self.connect() => result,
            };
            match result {
                Ok(reader) => {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    return Some(reader);
                }
                Err(e) => tracing::warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }
}

async fn read_one(reader: &mut Reader) -> Result<Packet, BrokerError> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(packet) = reader.decoder.decode()? {
            return Ok(packet);
        }
        let n = reader.half.read(&mut buf).await?;
        if n == 0 {
            return Err(BrokerError::ConnectionClosed);
        }
        reader.decoder.extend(&buf[..n]);
    }
}

async fn supervise(inner: Arc<Inner>, mut reader: Reader, token: CancellationToken) {
    loop {
        let result = inner.read_loop(&mut reader, &token).await;
        inner.writer.lock().await.take();
        inner.fail_pending();

        match result {
            Ok(()) => return,
            Err(e) => tracing::warn!("Lost connection to broker {}: {}", inner.config.addr, e),
        }
        if token.is_cancelled() {
            return;
        }

        inner.set_state(ConnectionState::Reconnecting);
        match inner.reconnect(&token).await {
            Some(next) => {
                reader = next;
                inner.set_state(ConnectionState::Connected);
                inner.resubscribe().await;
            }
            None => {
                inner.set_state(ConnectionState::Disconnected);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddedBrokerConfig;
    use crate::embedded::EmbeddedBroker;
    use parking_lot::Mutex as SyncMutex;

    async fn embedded() -> EmbeddedBroker {
        let broker = EmbeddedBroker::new(EmbeddedBrokerConfig::new("127.0.0.1:0".parse().unwrap()));
        broker.start().await.unwrap();
        broker
    }

    fn remote_config(broker: &EmbeddedBroker, client_id: &str) -> RemoteBrokerConfig {
        RemoteBrokerConfig::new(broker.local_addr().unwrap().to_string(), client_id).with_reconnect(
            Duration::from_millis(20),
            Duration::from_millis(200),
            0,
        )
    }

    fn recorder() -> (MessageCallback, Arc<SyncMutex<Vec<(String, Bytes)>>>) {
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: MessageCallback = Arc::new(move |topic: &str, payload: Bytes| {
            sink.lock().push((topic.to_string(), payload));
        });
        (cb, seen)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let broker = embedded().await;
        let remote = RemoteBroker::new(remote_config(&broker, "engine"));

        let err = remote.publish("t", QoS::AtMostOnce, Bytes::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "broker not started");
        let (cb, _) = recorder();
        assert!(matches!(
            remote.subscribe("t", QoS::AtMostOnce, cb).await,
            Err(BrokerError::NotStarted)
        ));
        remote.stop().await.unwrap();

        remote.start().await.unwrap();
        assert!(matches!(remote.start().await, Err(BrokerError::AlreadyStarted)));
        assert!(remote.is_connected());
        remote.stop().await.unwrap();
        assert!(!remote.is_connected());
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned_from_start() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let remote = RemoteBroker::new(RemoteBrokerConfig::new(addr.to_string(), "engine"));
        assert!(remote.start().await.is_err());
        assert_eq!(remote.state(), ConnectionState::Disconnected);
        // A failed start can be retried.
        assert!(remote.start().await.is_err());
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let broker = embedded().await;
        let remote = RemoteBroker::new(remote_config(&broker, ""));
        match remote.start().await {
            Err(BrokerError::ConnectionRefused(reason)) => assert!(reason.contains("client_id")),
            other => panic!("unexpected result: {:?}", other.err()),
        }
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_subscribe_through_broker() {
        let broker = embedded().await;
        let subscriber = RemoteBroker::new(remote_config(&broker, "sub"));
        let publisher = RemoteBroker::new(remote_config(&broker, "pub"));
        subscriber.start().await.unwrap();
        publisher.start().await.unwrap();

        let (cb, seen) = recorder();
        subscriber
            .subscribe("syncwire/+/response", QoS::AtLeastOnce, cb)
            .await
            .unwrap();

        publisher
            .publish("syncwire/c1/response", QoS::AtLeastOnce, Bytes::from_static(b"one"))
            .await
            .unwrap();
        publisher
            .publish("syncwire/c1/request", QoS::AtMostOnce, Bytes::from_static(b"skip"))
            .await
            .unwrap();

        assert!(eventually(|| !seen.lock().is_empty()).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "syncwire/c1/response");
        assert_eq!(&seen[0].1[..], b"one");

        subscriber.stop().await.unwrap();
        publisher.stop().await.unwrap();
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_stored_filters() {
        let broker = embedded().await;
        let remote = RemoteBroker::new(remote_config(&broker, "engine"));
        remote.start().await.unwrap();

        let (cb1, seen) = recorder();
        let (cb2, _) = recorder();
        remote.subscribe("f1/#", QoS::AtLeastOnce, cb1).await.unwrap();
        remote.subscribe("f2/+", QoS::AtMostOnce, cb2).await.unwrap();
        assert_eq!(broker.client_filters("engine"), vec!["f1/#", "f2/+"]);

        assert!(broker.disconnect_client("engine"));
        assert!(eventually(|| remote.reconnect_count() >= 1 && remote.is_connected()).await);
        assert!(eventually(|| broker.client_filters("engine") == vec!["f1/#", "f2/+"]).await);
        assert_eq!(remote.filters(), vec!["f1/#", "f2/+"]);

        broker
            .publish("f1/x", QoS::AtMostOnce, Bytes::from_static(b"after"))
            .unwrap();
        assert!(eventually(|| !seen.lock().is_empty()).await);

        remote.stop().await.unwrap();
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribed_filter_not_restored() {
        let broker = embedded().await;
        let remote = RemoteBroker::new(remote_config(&broker, "engine"));
        remote.start().await.unwrap();

        let (cb1, _) = recorder();
        let (cb2, _) = recorder();
        remote.subscribe("keep", QoS::AtMostOnce, cb1).await.unwrap();
        remote.subscribe("drop", QoS::AtMostOnce, cb2).await.unwrap();
        remote.unsubscribe("drop").await.unwrap();
        remote.unsubscribe("drop").await.unwrap();

        broker.disconnect_client("engine");
        assert!(eventually(|| remote.reconnect_count() >= 1).await);
        assert!(eventually(|| broker.client_filters("engine") == vec!["keep"]).await);

        remote.stop().await.unwrap();
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let broker = embedded().await;
        let config = remote_config(&broker, "engine").with_reconnect(
            Duration::from_millis(10),
            Duration::from_millis(20),
            2,
        );
        let remote = RemoteBroker::new(config);
        remote.start().await.unwrap();
        let (cb, _) = recorder();
        remote.subscribe("kept", QoS::AtMostOnce, cb).await.unwrap();

        broker.stop().await.unwrap();
        assert!(eventually(|| remote.state() == ConnectionState::Disconnected).await);
        assert_eq!(remote.filters(), vec!["kept"]);
        assert!(matches!(
            remote.publish("t", QoS::AtMostOnce, Bytes::new()).await,
            Err(BrokerError::NotConnected)
        ));
        remote.stop().await.unwrap();
    }
}
