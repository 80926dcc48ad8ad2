//! Hook registry.
//!
//! Hooks run in registration order. The first error stops the remaining
//! hooks for that point and is returned to the caller.

use crate::context::HookContext;
use crate::error::HookError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use syncwire_protocol::Operation;

/// Named lifecycle points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeConnect,
    AfterConnect,
    BeforeDisconnect,
    AfterDisconnect,

    BeforeRead,
    AfterRead,
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,

    BeforeSubscribe,
    AfterSubscribe,
    BeforeUnsubscribe,
    AfterUnsubscribe,

    /// Fired once a message is routed, before the specific operation.
    BeforeHandle,
}

impl HookPoint {
    pub const ALL: [HookPoint; 17] = [
        HookPoint::BeforeConnect,
        HookPoint::AfterConnect,
        HookPoint::BeforeDisconnect,
        HookPoint::AfterDisconnect,
        HookPoint::BeforeRead,
        HookPoint::AfterRead,
        HookPoint::BeforeCreate,
        HookPoint::AfterCreate,
        HookPoint::BeforeUpdate,
        HookPoint::AfterUpdate,
        HookPoint::BeforeDelete,
        HookPoint::AfterDelete,
        HookPoint::BeforeSubscribe,
        HookPoint::AfterSubscribe,
        HookPoint::BeforeUnsubscribe,
        HookPoint::AfterUnsubscribe,
        HookPoint::BeforeHandle,
    ];

    /// The `Before*`/`After*` pair for an operation. `meta` shares the read pair.
    pub fn for_operation(op: &Operation) -> Option<(HookPoint, HookPoint)> {
        match op {
            Operation::Read | Operation::Meta => Some((HookPoint::BeforeRead, HookPoint::AfterRead)),
            Operation::Create => Some((HookPoint::BeforeCreate, HookPoint::AfterCreate)),
            Operation::Update => Some((HookPoint::BeforeUpdate, HookPoint::AfterUpdate)),
            Operation::Delete => Some((HookPoint::BeforeDelete, HookPoint::AfterDelete)),
            Operation::Subscribe => Some((HookPoint::BeforeSubscribe, HookPoint::AfterSubscribe)),
            Operation::Unsubscribe => {
                Some((HookPoint::BeforeUnsubscribe, HookPoint::AfterUnsubscribe))
            }
            Operation::Unknown(_) => None,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A registered hook.
pub type HookFn = Arc<dyn Fn(&mut HookContext) -> Result<(), HookError> + Send + Sync>;

/// Ordered hooks per lifecycle point.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<HookPoint, Vec<HookFn>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `hook` to the list for `point`.
    pub fn register<F>(&self, point: HookPoint, hook: F)
    where
        F: Fn(&mut HookContext) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .entry(point)
            .or_default()
            .push(Arc::new(hook));
    }

    /// Runs every hook for `point` in order, stopping at the first error.
    ///
    /// The list is snapshotted before running so hooks may register further
    /// hooks without deadlocking; those take effect on the next execution.
    pub fn execute(&self, point: HookPoint, ctx: &mut HookContext) -> Result<(), HookError> {
        let hooks = match self.hooks.read().get(&point) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => return Ok(()),
        };
        let total = hooks.len();
        for (i, hook) in hooks.iter().enumerate() {
            if let Err(e) = hook(ctx) {
                tracing::debug!("{} hook {}/{} stopped the chain: {}", point, i + 1, total, e);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn count(&self, point: HookPoint) -> usize {
        self.hooks.read().get(&point).map_or(0, Vec::len)
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.hooks.read();
        let mut map = f.debug_map();
        for point in HookPoint::ALL {
            if let Some(list) = hooks.get(&point) {
                map.entry(&point, &list.len());
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, DeliveryRoute};
    use parking_lot::Mutex;
    use syncwire_protocol::Message;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> HookContext {
        let conn = Arc::new(Connection::new(
            "c1",
            "c1",
            DeliveryRoute::Broker,
            CancellationToken::new(),
        ));
        HookContext::new(
            Message::request("1", Operation::Create, "public", "orders"),
            conn,
        )
    }

    #[test]
    fn test_empty_point_is_noop() {
        let registry = HookRegistry::new();
        assert!(registry.execute(HookPoint::BeforeCreate, &mut ctx()).is_ok());
    }

    #[test]
    fn test_order_and_short_circuit() {
        let registry = HookRegistry::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c = Arc::clone(&calls);
        registry.register(HookPoint::BeforeCreate, move |_| {
            c.lock().push("h1");
            Ok(())
        });
        let c = Arc::clone(&calls);
        registry.register(HookPoint::BeforeCreate, move |_| {
            c.lock().push("h2");
            Err(HookError::new("h2 refused"))
        });
        let c = Arc::clone(&calls);
        registry.register(HookPoint::BeforeCreate, move |_| {
            c.lock().push("h3");
            Ok(())
        });

        let err = registry
            .execute(HookPoint::BeforeCreate, &mut ctx())
            .unwrap_err();
        assert_eq!(err, HookError::new("h2 refused"));
        assert_eq!(*calls.lock(), vec!["h1", "h2"]);
    }

    #[test]
    fn test_hooks_can_mutate_context() {
        let registry = HookRegistry::new();
        registry.register(HookPoint::BeforeCreate, |ctx| {
            ctx.extensions.tenant_id = Some("acme".into());
            Ok(())
        });
        registry.register(HookPoint::BeforeCreate, |ctx| {
            match ctx.extensions.tenant_id.as_deref() {
                Some("acme") => Ok(()),
                _ => Err(HookError::new("tenant missing")),
            }
        });

        let mut context = ctx();
        registry
            .execute(HookPoint::BeforeCreate, &mut context)
            .unwrap();
        assert_eq!(context.extensions.tenant_id.as_deref(), Some("acme"));
    }

    #[test]
    fn test_points_are_independent() {
        let registry = HookRegistry::new();
        registry.register(HookPoint::BeforeDelete, |_| Err(HookError::new("no")));

        assert!(registry.execute(HookPoint::BeforeCreate, &mut ctx()).is_ok());
        assert!(registry.execute(HookPoint::BeforeDelete, &mut ctx()).is_err());
        assert_eq!(registry.count(HookPoint::BeforeDelete), 1);
        assert_eq!(registry.count(HookPoint::AfterDelete), 0);
    }

    #[test]
    fn test_operation_pairs() {
        assert_eq!(
            HookPoint::for_operation(&Operation::Update),
            Some((HookPoint::BeforeUpdate, HookPoint::AfterUpdate))
        );
        assert_eq!(
            HookPoint::for_operation(&Operation::Meta),
            Some((HookPoint::BeforeRead, HookPoint::AfterRead))
        );
        assert_eq!(
            HookPoint::for_operation(&Operation::Unknown("x".into())),
            None
        );
    }
}
