//! Uniform facade over the two broker implementations.

use crate::config::{BrokerConfig, BrokerMode};
use crate::embedded::EmbeddedBroker;
use crate::error::BrokerError;
use crate::remote::RemoteBroker;
use crate::router::MessageCallback;
use bytes::Bytes;
use syncwire_protocol::QoS;

/// The broker an engine publishes and subscribes through. Exactly one
/// implementation is active per engine.
pub enum BrokerAdapter {
    Embedded(EmbeddedBroker),
    Remote(RemoteBroker),
}

impl BrokerAdapter {
    /// Builds the adapter selected by `config.mode`.
    pub fn from_config(config: &BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        Ok(match config.mode {
            BrokerMode::Embedded => Self::Embedded(EmbeddedBroker::new(config.embedded.clone())),
            BrokerMode::Remote => Self::Remote(RemoteBroker::new(config.remote.clone())),
        })
    }

    pub fn mode(&self) -> BrokerMode {
        match self {
            Self::Embedded(_) => BrokerMode::Embedded,
            Self::Remote(_) => BrokerMode::Remote,
        }
    }

    /// Fails with `already_started` when called twice.
    pub async fn start(&self) -> Result<(), BrokerError> {
        match self {
            Self::Embedded(broker) => broker.start().await,
            Self::Remote(broker) => broker.start().await,
        }
    }

    /// No-op when never started.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        match self {
            Self::Embedded(broker) => broker.stop().await,
            Self::Remote(broker) => broker.stop().await,
        }
    }

    pub async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), BrokerError> {
        match self {
            Self::Embedded(broker) => broker.publish(topic, qos, payload).map(|_| ()),
            Self::Remote(broker) => broker.publish(topic, qos, payload).await,
        }
    }

    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        callback: MessageCallback,
    ) -> Result<(), BrokerError> {
        match self {
            Self::Embedded(broker) => broker.subscribe(filter, callback),
            Self::Remote(broker) => broker.subscribe(filter, qos, callback).await,
        }
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        match self {
            Self::Embedded(broker) => broker.unsubscribe(filter),
            Self::Remote(broker) => broker.unsubscribe(filter).await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Self::Embedded(broker) => broker.is_connected(),
            Self::Remote(broker) => broker.is_connected(),
        }
    }

    pub fn as_embedded(&self) -> Option<&EmbeddedBroker> {
        match self {
            Self::Embedded(broker) => Some(broker),
            Self::Remote(_) => None,
        }
    }
}
