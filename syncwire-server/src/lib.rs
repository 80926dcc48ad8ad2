//! # syncwire-server
//!
//! The syncwire engine.
//!
//! This crate provides:
//! - The operation dispatcher: validation, hooks, storage calls and fan-out
//! - Engine lifecycle over a broker, plus direct in-process channels
//! - Configuration loading
//! - Token authentication as a `BeforeConnect` hook
//! - Prometheus metrics

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod stats;

pub use auth::{install_token_auth, TokenValidator};
pub use config::{AuthConfig, Config, ConfigError, EngineConfig, MetricsConfig};
pub use dispatcher::{Dispatcher, Origin};
pub use engine::{ChannelHandle, ChannelSender, Engine};
pub use error::ServerError;
pub use metrics::Metrics;
pub use stats::{EngineStats, StatsSnapshot};
