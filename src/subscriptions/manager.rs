//! Registry of live persistent searches.

use crate::filter::Filter;
use crate::types::{ConnectionId, DerefPolicy, Dn, MessageId, Scope};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::types::{
    AttributeSelection, OperationContext, Subscription, SubscriptionHandle, SubscriptionKey,
    SubscriptionSpec,
};

/// Outcome of an abandon request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbandonResult {
    Ok,
    /// No such subscription; expected when it already ended.
    NotFound,
}

/// Process-wide set of live subscriptions.
///
/// Structural changes take the write lock; iteration clones the handles
/// under the read lock so fan-out never holds it while dispatching.
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<SubscriptionKey, SubscriptionHandle>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a persistent search.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        conn: ConnectionId,
        op: OperationContext,
        base: &str,
        normalized_base: &str,
        scope: Scope,
        deref: DerefPolicy,
        size_limit: i64,
        time_limit: i64,
        filter: Filter,
        filter_str: &str,
        attrs: AttributeSelection,
        attrs_only: bool,
    ) -> SubscriptionHandle {
        self.register_spec(SubscriptionSpec {
            conn,
            op,
            base: Dn::with_normalized(base, normalized_base),
            scope,
            deref,
            size_limit,
            time_limit,
            filter,
            filter_str: filter_str.to_string(),
            attrs,
            attrs_only,
        })
    }

    /// Admit a persistent search described by `spec`.
    ///
    /// A subscription already registered under the same key is replaced.
    pub fn register_spec(&self, spec: SubscriptionSpec) -> SubscriptionHandle {
        let subscription = Arc::new(Subscription::from_spec(spec));
        debug!(
            conn = %subscription.key.conn,
            msg_id = %subscription.key.msg_id,
            base = %subscription.base,
            scope = ?subscription.scope,
            filter = %subscription.filter_str,
            "Registered persistent search"
        );

        let previous = self
            .subscriptions
            .write()
            .insert(subscription.key, Arc::clone(&subscription));
        if let Some(previous) = previous {
            previous.mark_abandoned();
        }
        subscription
    }

    /// Abandon the subscription for (`conn`, `msg_id`).
    pub fn abandon(&self, conn: ConnectionId, msg_id: MessageId) -> AbandonResult {
        let removed = self
            .subscriptions
            .write()
            .remove(&SubscriptionKey::new(conn, msg_id));
        match removed {
            Some(sub) => {
                sub.mark_abandoned();
                debug!(%conn, %msg_id, "Abandoned persistent search");
                AbandonResult::Ok
            }
            None => {
                debug!(%conn, %msg_id, "Abandon for unknown persistent search");
                AbandonResult::NotFound
            }
        }
    }

    /// Abandon every subscription on a closed connection.
    pub fn close_connection(&self, conn: ConnectionId) -> usize {
        let mut subs = self.subscriptions.write();
        let keys: Vec<_> = subs.keys().filter(|k| k.conn == conn).copied().collect();
        for key in &keys {
            if let Some(sub) = subs.remove(key) {
                sub.mark_abandoned();
            }
        }
        debug!(%conn, closed = keys.len(), "Connection closed");
        keys.len()
    }

    /// Snapshot of the live subscriptions.
    pub fn iterate(&self) -> Vec<SubscriptionHandle> {
        let mut subs: Vec<_> = self.subscriptions.read().values().cloned().collect();
        subs.sort_by_key(|s| (s.key.conn, s.key.msg_id));
        subs
    }

    pub fn get(&self, conn: ConnectionId, msg_id: MessageId) -> Option<SubscriptionHandle> {
        self.subscriptions
            .read()
            .get(&SubscriptionKey::new(conn, msg_id))
            .cloned()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn spec(conn: u64, msg: i32) -> SubscriptionSpec {
        SubscriptionSpec::new(
            ConnectionId(conn),
            OperationContext::new(MessageId(msg), "cn=user,dc=example"),
            "dc=example",
            Scope::Subtree,
            Filter::present("objectClass"),
        )
    }

    #[test]
    fn test_register_abandon() {
        let registry = SubscriptionRegistry::new();

        let handle = registry.register(
            ConnectionId(1),
            OperationContext::new(MessageId(2), "cn=user,dc=example"),
            "DC=Example",
            "dc=example",
            Scope::OneLevel,
            DerefPolicy::Never,
            0,
            0,
            Filter::present("cn"),
            "(cn=*)",
            AttributeSelection::default(),
            false,
        );
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(handle.base.raw(), "DC=Example");
        assert!(!handle.is_abandoned());

        assert_eq!(registry.abandon(ConnectionId(1), MessageId(2)), AbandonResult::Ok);
        assert!(handle.is_abandoned());
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(
            registry.abandon(ConnectionId(1), MessageId(2)),
            AbandonResult::NotFound
        );
    }

    #[test]
    fn test_close_connection() {
        let registry = SubscriptionRegistry::new();
        let a = registry.register_spec(spec(1, 1));
        let b = registry.register_spec(spec(1, 2));
        let c = registry.register_spec(spec(2, 1));

        assert_eq!(registry.close_connection(ConnectionId(1)), 2);
        assert!(a.is_abandoned() && b.is_abandoned());
        assert!(!c.is_abandoned());
        assert_eq!(registry.iterate().len(), 1);
    }

    #[test]
    fn test_reregister_replaces() {
        let registry = SubscriptionRegistry::new();
        let first = registry.register_spec(spec(1, 1));
        let second = registry.register_spec(spec(1, 1));
        assert!(first.is_abandoned());
        assert!(!second.is_abandoned());
        assert_eq!(registry.subscription_count(), 1);
    }

    #[test]
    fn test_concurrent_register_and_iterate() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for m in 0..50 {
                        registry.register_spec(spec(t, m));
                        if m % 2 == 0 {
                            registry.abandon(ConnectionId(t), MessageId(m));
                        }
                    }
                })
            })
            .collect();
        let reader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..100 {
                    let _ = registry.iterate();
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(registry.subscription_count(), 4 * 25);
    }
}
