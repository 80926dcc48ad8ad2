//! One client session of the embedded broker.

use crate::error::BrokerError;
use crate::router::{Delivery, Router};
use crate::stream::BrokerStream;
use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use syncwire_protocol::topic::{validate_filter, validate_topic};
use syncwire_protocol::{Packet, PacketDecoder, PacketHeader, QoS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound queue depth per session.
const SESSION_QUEUE_CAPACITY: usize = 1024;

/// Called with the client id when a session ends without being taken over
/// by a newer session for the same id.
pub type SessionClosedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle kept in the broker's session table, keyed by client id.
pub(crate) struct SessionHandle {
    pub session_id: u64,
    pub addr: SocketAddr,
    pub cancel: CancellationToken,
}

/// State shared by the accept loop, every session and the broker facade.
pub(crate) struct Shared {
    pub router: Router,
    pub sessions: DashMap<String, SessionHandle>,
    pub keep_alive: Duration,
    pub on_closed: RwLock<Option<SessionClosedCallback>>,
    next_session: AtomicU64,
}

impl Shared {
    pub fn new(keep_alive: Duration) -> Self {
        Self {
            router: Router::new(),
            sessions: DashMap::new(),
            keep_alive,
            on_closed: RwLock::new(None),
            next_session: AtomicU64::new(1),
        }
    }
}

struct SessionIo {
    stream: BrokerStream,
    decoder: PacketDecoder,
    out: BytesMut,
    next_packet_id: AtomicU32,
}

impl SessionIo {
    async fn send(&mut self, packet: Packet) -> Result<(), BrokerError> {
        self.out.clear();
        packet.encode_into(&mut self.out)?;
        self.stream.write_all(&self.out).await?;
        Ok(())
    }

    fn packet_id(&self) -> u32 {
        self.next_packet_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Runs a session to completion. `parent` is the broker's shutdown token.
pub(crate) async fn run(
    stream: BrokerStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    parent: CancellationToken,
) -> Result<(), BrokerError> {
    let mut io = SessionIo {
        stream,
        decoder: PacketDecoder::new(),
        out: BytesMut::with_capacity(4096),
        next_packet_id: AtomicU32::new(1),
    };

    let connect = tokio::select! {
        result = tokio::time::timeout(shared.keep_alive, read_packet(&mut io)) => {
            result.map_err(|_| BrokerError::Timeout)??
        }
        _ = parent.cancelled() => return Ok(()),
    };

    let (client_id, keep_alive_secs) = match connect.header {
        PacketHeader::Connect {
            client_id,
            keep_alive_secs,
            ..
        } if !client_id.is_empty() => (client_id, keep_alive_secs),
        PacketHeader::Connect { .. } => {
            reject(&mut io, "client_id must not be empty").await;
            return Err(BrokerError::ConnectionRefused("empty client_id".into()));
        }
        other => {
            reject(&mut io, "expected connect").await;
            return Err(BrokerError::UnexpectedPacket(other.kind().to_string()));
        }
    };

    let session_id = shared.next_session.fetch_add(1, Ordering::Relaxed);
    let cancel = parent.child_token();
    let (tx, mut rx) = mpsc::channel::<Delivery>(SESSION_QUEUE_CAPACITY);
    shared.router.add_session(session_id, &client_id, tx);

    let previous = shared.sessions.insert(
        client_id.clone(),
        SessionHandle {
            session_id,
            addr,
            cancel: cancel.clone(),
        },
    );
    if let Some(previous) = previous {
        tracing::info!(
            "[{}] Client '{}' took over session from {}",
            addr,
            client_id,
            previous.addr
        );
        previous.cancel.cancel();
    }

    let keep_alive = match keep_alive_secs {
        0 => shared.keep_alive,
        secs => Duration::from_secs(u64::from(secs)),
    };
    let idle_timeout = keep_alive * 3 / 2;

    let result = async {
        io.send(Packet::new(PacketHeader::ConnAck {
            accepted: true,
            session_present: false,
            reason: None,
        }))
        .await?;
        tracing::info!(
            "[{}] Broker session {} opened for '{}'{}",
            addr,
            session_id,
            client_id,
            if io.stream.is_tls() { " (TLS)" } else { "" }
        );
        session_loop(&mut io, &shared, session_id, &cancel, &mut rx, idle_timeout).await
    }
    .await;

    shared.router.remove_session(session_id);
    let released = shared
        .sessions
        .remove_if(&client_id, |_, handle| handle.session_id == session_id)
        .is_some();
    let _ = io.stream.shutdown().await;
    tracing::info!("[{}] Broker session {} closed for '{}'", addr, session_id, client_id);

    if released {
        let on_closed = shared.on_closed.read().clone();
        if let Some(on_closed) = on_closed {
            on_closed(&client_id);
        }
    }
    result
}

async fn session_loop(
    io: &mut SessionIo,
    shared: &Shared,
    session_id: u64,
    cancel: &CancellationToken,
    rx: &mut mpsc::Receiver<Delivery>,
    idle_timeout: Duration,
) -> Result<(), BrokerError> {
    let mut buf = [0u8; 8192];
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let _ = io
                    .send(Packet::new(PacketHeader::Disconnect {
                        reason: Some("session closed by broker".into()),
                    }))
                    .await;
                return Ok(());
            }

            Some(delivery) = rx.recv() => {
                let packet_id = delivery.qos.requires_ack().then(|| io.packet_id());
                io.send(Packet::publish(delivery.topic, delivery.qos, packet_id, delivery.payload))
                    .await?;
            }

            result = io.stream.read(&mut buf) => {
                match result? {
                    0 => return Ok(()),
                    n => {
                        last_seen = Instant::now();
                        io.decoder.extend(&buf[..n]);
                    }
                }
            }

            _ = tokio::time::sleep(idle_timeout) => {
                if last_seen.elapsed() >= idle_timeout {
                    tracing::debug!("Broker session {} idle timeout", session_id);
                    return Ok(());
                }
            }
        }

        loop {
            let packet = match io.decoder.decode() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    let _ = io
                        .send(Packet::new(PacketHeader::Disconnect {
                            reason: Some(e.to_string()),
                        }))
                        .await;
                    return Err(e.into());
                }
            };
            if !handle_packet(io, shared, session_id, packet).await? {
                return Ok(());
            }
        }
    }
}

/// Returns `false` when the client asked to disconnect.
async fn handle_packet(
    io: &mut SessionIo,
    shared: &Shared,
    session_id: u64,
    packet: Packet,
) -> Result<bool, BrokerError> {
    match packet.header {
        PacketHeader::Subscribe {
            packet_id,
            filter,
            qos,
        } => {
            if let Err(e) = validate_filter(&filter) {
                protocol_violation(io, &e.to_string()).await;
                return Err(BrokerError::InvalidTopic(filter));
            }
            shared.router.add_session_filter(session_id, &filter, qos);
            tracing::debug!("Broker session {} subscribed to {}", session_id, filter);
            io.send(Packet::new(PacketHeader::SubAck { packet_id, qos }))
                .await?;
        }
        PacketHeader::Unsubscribe { packet_id, filter } => {
            shared.router.remove_session_filter(session_id, &filter);
            io.send(Packet::new(PacketHeader::UnsubAck { packet_id }))
                .await?;
        }
        PacketHeader::Publish {
            packet_id,
            topic,
            qos,
        } => {
            if let Err(e) = validate_topic(&topic) {
                protocol_violation(io, &e.to_string()).await;
                return Err(BrokerError::InvalidTopic(topic));
            }
            shared.router.route(&topic, qos, packet.payload);
            if let (Some(packet_id), true) = (packet_id, qos >= QoS::AtLeastOnce) {
                io.send(Packet::new(PacketHeader::PubAck { packet_id }))
                    .await?;
            }
        }
        // Acknowledgements of broker-to-client deliveries; no redelivery.
        PacketHeader::PubAck { .. } => {}
        PacketHeader::PingReq => {
            io.send(Packet::new(PacketHeader::PingResp)).await?;
        }
        PacketHeader::Disconnect { reason } => {
            tracing::debug!(
                "Broker session {} disconnect requested: {}",
                session_id,
                reason.as_deref().unwrap_or("none")
            );
            return Ok(false);
        }
        other => {
            protocol_violation(io, &format!("unexpected {}", other.kind())).await;
            return Err(BrokerError::UnexpectedPacket(other.kind().to_string()));
        }
    }
    Ok(true)
}

async fn read_packet(io: &mut SessionIo) -> Result<Packet, BrokerError> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(packet) = io.decoder.decode()? {
            return Ok(packet);
        }
        let n = io.stream.read(&mut buf).await?;
        if n == 0 {
            return Err(BrokerError::ConnectionClosed);
        }
        io.decoder.extend(&buf[..n]);
    }
}

async fn reject(io: &mut SessionIo, reason: &str) {
    let _ = io
        .send(Packet::new(PacketHeader::ConnAck {
            accepted: false,
            session_present: false,
            reason: Some(reason.to_string()),
        }))
        .await;
}

async fn protocol_violation(io: &mut SessionIo, reason: &str) {
    let _ = io
        .send(Packet::new(PacketHeader::Disconnect {
            reason: Some(reason.to_string()),
        }))
        .await;
}
