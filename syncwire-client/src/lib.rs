//! # syncwire-client
//!
//! Client library for syncwire.
//!
//! This crate provides:
//! - A broker client bound to one syncwire connection id
//! - Request/response correlation with timeouts
//! - Typed helpers for CRUD, metadata and subscription operations
//! - A broadcast stream of change notifications

pub mod client;
pub mod error;

pub use client::{Client, ClientConfig, Page};
pub use error::ClientError;
