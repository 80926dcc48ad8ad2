//! # syncwire-core
//!
//! Transport-agnostic building blocks of the syncwire engine.
//!
//! This crate provides:
//! - The ordered hook registry and per-operation hook context
//! - The connection registry
//! - The subscription registry and filter matching
//! - The storage collaborator contract and an in-memory implementation
//! - The entity catalog

pub mod catalog;
pub mod connection;
pub mod context;
pub mod error;
pub mod filter;
pub mod hooks;
pub mod memory;
pub mod storage;
pub mod subscription;

pub use catalog::{Catalog, ColumnDescriptor, ModelDescriptor, ModelRegistry};
pub use connection::{Connection, ConnectionRegistry, DeliveryRoute};
pub use context::{ExtensionContext, HookContext};
pub use error::{CatalogError, HookError, StorageError};
pub use hooks::{HookFn, HookPoint, HookRegistry};
pub use memory::MemoryStore;
pub use storage::{Record, Scope, Storage};
pub use subscription::{Subscription, SubscriptionRegistry};
