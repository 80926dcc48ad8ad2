//! Subscription registry.
//!
//! Subscriptions are indexed by id and by `(schema, entity)`. Both indexes
//! live behind one reader/writer lock so that they never disagree.

use crate::filter;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use syncwire_protocol::FilterOption;

/// A standing interest in changes to one entity.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub connection_id: String,
    pub schema: String,
    pub entity: String,
    pub filters: Vec<FilterOption>,
    active: AtomicBool,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        connection_id: impl Into<String>,
        schema: impl Into<String>,
        entity: impl Into<String>,
        filters: Vec<FilterOption>,
    ) -> Self {
        Self {
            id: id.into(),
            connection_id: connection_id.into(),
            schema: schema.into(),
            entity: entity.into(),
            filters,
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Returns true if `record` satisfies every filter.
    pub fn matches(&self, record: &Value) -> bool {
        self.is_active() && filter::matches_all(&self.filters, record)
    }
}

type EntityKey = (String, String);

#[derive(Default)]
struct Indexes {
    by_id: HashMap<String, Arc<Subscription>>,
    by_entity: HashMap<EntityKey, HashSet<String>>,
}

/// Concurrent table of active subscriptions.
pub struct SubscriptionRegistry {
    inner: RwLock<Indexes>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indexes::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates a fresh subscription id (`sub-1`, `sub-2`, ...).
    pub fn next_id(&self) -> String {
        format!("sub-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a subscription under `id`.
    ///
    /// Re-using an id replaces the previous subscription.
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        connection_id: impl Into<String>,
        schema: impl Into<String>,
        entity: impl Into<String>,
        filters: Vec<FilterOption>,
    ) -> Arc<Subscription> {
        let sub = Arc::new(Subscription::new(
            id,
            connection_id,
            schema,
            entity,
            filters,
        ));
        let key = (sub.schema.clone(), sub.entity.clone());

        let mut inner = self.inner.write();
        if let Some(old) = inner.by_id.insert(sub.id.clone(), Arc::clone(&sub)) {
            old.deactivate();
            let old_key = (old.schema.clone(), old.entity.clone());
            remove_from_entity(&mut inner.by_entity, &old_key, &old.id);
        }
        inner
            .by_entity
            .entry(key)
            .or_default()
            .insert(sub.id.clone());
        sub
    }

    /// Removes a subscription. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: &str) -> Option<Arc<Subscription>> {
        let mut inner = self.inner.write();
        let sub = inner.by_id.remove(id)?;
        sub.deactivate();
        let key = (sub.schema.clone(), sub.entity.clone());
        remove_from_entity(&mut inner.by_entity, &key, id);
        Some(sub)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Subscription>> {
        self.inner.read().by_id.get(id).cloned()
    }

    /// Every active subscription on `(schema, entity)`, regardless of owner.
    pub fn list_by_entity(&self, schema: &str, entity: &str) -> Vec<Arc<Subscription>> {
        let inner = self.inner.read();
        let key = (schema.to_string(), entity.to_string());
        let Some(ids) = inner.by_entity.get(&key) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|sub| sub.is_active())
            .cloned()
            .collect()
    }

    /// Subscriptions on `(schema, entity)` whose filters match `record`.
    ///
    /// Matching runs after the read lock is released.
    pub fn matching(&self, schema: &str, entity: &str, record: &Value) -> Vec<Arc<Subscription>> {
        let mut subs = self.list_by_entity(schema, entity);
        subs.retain(|sub| sub.matches(record));
        subs
    }

    /// Removes the given subscriptions, returning how many existed.
    pub fn remove_all<'a, I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut inner = self.inner.write();
        let mut removed = 0;
        for id in ids {
            if let Some(sub) = inner.by_id.remove(id.as_str()) {
                sub.deactivate();
                let key = (sub.schema.clone(), sub.entity.clone());
                remove_from_entity(&mut inner.by_entity, &key, id);
                removed += 1;
            }
        }
        removed
    }

    /// Removes every subscription owned by `connection_id`.
    pub fn remove_connection(&self, connection_id: &str) -> usize {
        let ids: Vec<String> = self
            .inner
            .read()
            .by_id
            .values()
            .filter(|s| s.connection_id == connection_id)
            .map(|s| s.id.clone())
            .collect();
        self.remove_all(ids.iter())
    }

    pub fn count(&self) -> usize {
        self.inner.read().by_id.len()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_from_entity(by_entity: &mut HashMap<EntityKey, HashSet<String>>, key: &EntityKey, id: &str) {
    if let Some(ids) = by_entity.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            by_entity.remove(key);
        }
    }
}
