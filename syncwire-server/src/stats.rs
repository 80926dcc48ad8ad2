//! Engine counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated by the dispatcher.
#[derive(Debug, Default)]
pub struct EngineStats {
    messages_received: AtomicU64,
    messages_rejected: AtomicU64,
    operations_succeeded: AtomicU64,
    operations_failed: AtomicU64,
    notifications_sent: AtomicU64,
    notification_failures: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    /// Undecodable or invalid messages and refused connections.
    pub messages_rejected: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub notifications_sent: u64,
    pub notification_failures: u64,
}

impl EngineStats {
    pub(crate) fn received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn operation(&self, ok: bool) {
        let counter = if ok {
            &self.operations_succeeded
        } else {
            &self.operations_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn notification(&self, ok: bool) {
        let counter = if ok {
            &self.notifications_sent
        } else {
            &self.notification_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            operations_succeeded: self.operations_succeeded.load(Ordering::Relaxed),
            operations_failed: self.operations_failed.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notification_failures: self.notification_failures.load(Ordering::Relaxed),
        }
    }
}
