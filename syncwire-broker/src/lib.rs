//! # syncwire-broker
//!
//! Publish/subscribe transports for syncwire.
//!
//! - [`EmbeddedBroker`]: an in-process broker that also accepts external
//!   clients over TCP or TLS.
//! - [`RemoteBroker`]: a client for an external broker that survives
//!   connection loss and restores its subscriptions.
//! - [`BrokerAdapter`]: the single facade the engine talks to.

pub mod adapter;
pub mod config;
pub mod embedded;
pub mod error;
pub mod remote;
pub mod router;
mod session;
pub mod stream;
pub mod tls;

pub use adapter::BrokerAdapter;
pub use config::{
    BrokerConfig, BrokerMode, ClientTlsConfig, EmbeddedBrokerConfig, RemoteBrokerConfig,
    ServerTlsConfig,
};
pub use embedded::{BrokerStats, EmbeddedBroker, SessionClosedCallback};
pub use error::BrokerError;
pub use remote::{ConnectionState, RemoteBroker};
pub use router::{MessageCallback, RouteOutcome};
