//! Topic router shared by the embedded broker's sessions and its in-process
//! subscribers.
//!
//! Matching targets are collected under the read lock; callbacks run and
//! session queues are fed only after the lock is released.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use syncwire_protocol::{topic_matches, QoS};
use tokio::sync::mpsc;

/// Callback invoked with `(topic, payload)` for every matching publish.
pub type MessageCallback = Arc<dyn Fn(&str, Bytes) + Send + Sync>;

/// A publish queued for one broker session.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
}

struct SessionRoutes {
    client_id: String,
    tx: mpsc::Sender<Delivery>,
    filters: HashMap<String, QoS>,
}

#[derive(Default)]
struct Routes {
    local: HashMap<String, MessageCallback>,
    sessions: HashMap<u64, SessionRoutes>,
}

/// Result of routing one publish.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Default)]
pub struct Router {
    routes: RwLock<Routes>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an in-process subscriber. A second call for the same filter
    /// replaces the callback. In-process delivery is immediate so no QoS
    /// is kept.
    pub fn add_local(&self, filter: &str, callback: MessageCallback) {
        self.routes
            .write()
            .local
            .insert(filter.to_string(), callback);
    }

    pub fn remove_local(&self, filter: &str) -> bool {
        self.routes.write().local.remove(filter).is_some()
    }

    /// Registers the outbound queue of a session. Must precede
    /// [`Router::add_session_filter`].
    pub fn add_session(&self, session_id: u64, client_id: &str, tx: mpsc::Sender<Delivery>) {
        self.routes.write().sessions.insert(
            session_id,
            SessionRoutes {
                client_id: client_id.to_string(),
                tx,
                filters: HashMap::new(),
            },
        );
    }

    /// Returns false if the session is gone.
    pub fn add_session_filter(&self, session_id: u64, filter: &str, qos: QoS) -> bool {
        match self.routes.write().sessions.get_mut(&session_id) {
            Some(session) => {
                session.filters.insert(filter.to_string(), qos);
                true
            }
            None => false,
        }
    }

    pub fn remove_session_filter(&self, session_id: u64, filter: &str) -> bool {
        self.routes
            .write()
            .sessions
            .get_mut(&session_id)
            .is_some_and(|s| s.filters.remove(filter).is_some())
    }

    /// Drops a session and every filter it holds.
    pub fn remove_session(&self, session_id: u64) -> usize {
        self.routes
            .write()
            .sessions
            .remove(&session_id)
            .map_or(0, |s| s.filters.len())
    }

    /// Filters currently held by any session of `client_id`.
    pub fn client_filters(&self, client_id: &str) -> Vec<String> {
        let routes = self.routes.read();
        let mut filters: Vec<String> = routes
            .sessions
            .values()
            .filter(|s| s.client_id == client_id)
            .flat_map(|s| s.filters.keys().cloned())
            .collect();
        filters.sort();
        filters
    }

    pub fn local_count(&self) -> usize {
        self.routes.read().local.len()
    }

    /// Delivers `payload` to every subscriber whose filter matches `topic`.
    ///
    /// Delivery QoS is the lower of the publish and subscription levels.
    /// A session whose queue is full misses the message.
    pub fn route(&self, topic: &str, qos: QoS, payload: Bytes) -> RouteOutcome {
        let (callbacks, deliveries) = {
            let routes = self.routes.read();
            let callbacks: Vec<MessageCallback> = routes
                .local
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, callback)| callback.clone())
                .collect();

            let deliveries: Vec<(String, mpsc::Sender<Delivery>, QoS)> = routes
                .sessions
                .values()
                .filter_map(|session| {
                    session
                        .filters
                        .iter()
                        .filter(|(filter, _)| topic_matches(filter, topic))
                        .map(|(_, sub_qos)| *sub_qos)
                        .max()
                        .map(|sub_qos| (session.client_id.clone(), session.tx.clone(), sub_qos))
                })
                .collect();
            (callbacks, deliveries)
        };

        let mut outcome = RouteOutcome::default();
        for callback in callbacks {
            callback(topic, payload.clone());
            outcome.delivered += 1;
        }
        for (client_id, tx, sub_qos) in deliveries {
            let delivery = Delivery {
                topic: topic.to_string(),
                qos: qos.min(sub_qos),
                payload: payload.clone(),
            };
            match tx.try_send(delivery) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    tracing::warn!("Dropping delivery on {} for {}: {}", topic, client_id, e);
                    outcome.dropped += 1;
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording() -> (MessageCallback, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: MessageCallback = Arc::new(move |topic: &str, _payload: Bytes| {
            sink.lock().push(topic.to_string());
        });
        (cb, seen)
    }

    #[test]
    fn test_local_wildcard_delivery() {
        let router = Router::new();
        let (cb, seen) = recording();
        router.add_local("syncwire/+/request", cb);

        let outcome = router.route("syncwire/c1/request", QoS::AtLeastOnce, Bytes::from_static(b"{}"));
        assert_eq!(outcome.delivered, 1);
        router.route("syncwire/c1/response", QoS::AtLeastOnce, Bytes::new());
        assert_eq!(*seen.lock(), vec!["syncwire/c1/request".to_string()]);

        assert!(router.remove_local("syncwire/+/request"));
        assert!(!router.remove_local("syncwire/+/request"));
        assert_eq!(router.route("syncwire/c1/request", QoS::AtMostOnce, Bytes::new()).delivered, 0);
    }

    #[tokio::test]
    async fn test_session_delivery_downgrades_qos() {
        let router = Router::new();
        let (tx, mut rx) = mpsc::channel(4);
        router.add_session(7, "client-a", tx);
        assert!(router.add_session_filter(7, "syncwire/c1/#", QoS::AtMostOnce));

        router.route("syncwire/c1/notify/sub-1", QoS::AtLeastOnce, Bytes::from_static(b"x"));
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.topic, "syncwire/c1/notify/sub-1");
        assert_eq!(delivery.qos, QoS::AtMostOnce);
        assert_eq!(&delivery.payload[..], b"x");
    }

    #[test]
    fn test_overlapping_filters_deliver_once_per_session() {
        let router = Router::new();
        let (tx, mut rx) = mpsc::channel(4);
        router.add_session(1, "a", tx);
        router.add_session_filter(1, "t/#", QoS::AtMostOnce);
        router.add_session_filter(1, "t/+", QoS::AtLeastOnce);

        let outcome = router.route("t/x", QoS::ExactlyOnce, Bytes::new());
        assert_eq!(outcome.delivered, 1);
        assert_eq!(rx.try_recv().unwrap().qos, QoS::AtLeastOnce);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops() {
        let router = Router::new();
        let (tx, _rx) = mpsc::channel(1);
        router.add_session(1, "slow", tx);
        router.add_session_filter(1, "t", QoS::AtMostOnce);

        assert_eq!(router.route("t", QoS::AtMostOnce, Bytes::new()).delivered, 1);
        assert_eq!(router.route("t", QoS::AtMostOnce, Bytes::new()).dropped, 1);
    }

    #[test]
    fn test_remove_session() {
        let router = Router::new();
        let (tx, _rx) = mpsc::channel(1);
        router.add_session(3, "c", tx);
        router.add_session_filter(3, "a", QoS::AtMostOnce);
        router.add_session_filter(3, "b", QoS::AtMostOnce);
        assert_eq!(router.client_filters("c"), vec!["a".to_string(), "b".to_string()]);

        assert!(router.remove_session_filter(3, "a"));
        assert_eq!(router.remove_session(3), 1);
        assert!(router.client_filters("c").is_empty());
        assert!(!router.add_session_filter(3, "a", QoS::AtMostOnce));
    }
}
