//! Property and event subscriptions.
//!
//! The manager is pure bookkeeping: subscribe/unsubscribe/clear mutate
//! it, fan-out reads it.  Delivery itself happens in the broker, which
//! resolves subscriber ids to sessions; a failure for one subscriber
//! never affects the others.

use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

/// What a subscription matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Matches `property_changed` notifications for one property name.
    Property,
    /// Matches named events.
    Event,
}

/// Key: (device, kind, name).  Values: subscriber peer ids.
type SubKey = (String, SubscriptionKind, String);

/// Subscription table with uniqueness on the full
/// (subscriber, device, kind, name) tuple.
#[derive(Default)]
pub struct SubscriptionManager {
    inner: RwLock<HashMap<SubKey, HashSet<String>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        SubscriptionManager::default()
    }

    /// Idempotent: returns false when the subscription already existed.
    pub async fn subscribe(
        &self,
        subscriber: &str,
        device_id: &str,
        kind: SubscriptionKind,
        name: &str,
    ) -> bool {
        let key = (device_id.to_owned(), kind, name.to_owned());
        let added = self
            .inner
            .write()
            .await
            .entry(key)
            .or_default()
            .insert(subscriber.to_owned());
        if added {
            debug!(subscriber, device_id, ?kind, name, "subscribed");
        }
        added
    }

    /// Returns false when no such subscription existed.
    pub async fn unsubscribe(
        &self,
        subscriber: &str,
        device_id: &str,
        kind: SubscriptionKind,
        name: &str,
    ) -> bool {
        let key = (device_id.to_owned(), kind, name.to_owned());
        let mut inner = self.inner.write().await;
        match inner.get_mut(&key) {
            Some(subscribers) => {
                let removed = subscribers.remove(subscriber);
                if subscribers.is_empty() {
                    inner.remove(&key);
                }
                removed
            }
            None => false,
        }
    }

    /// Drop every subscription held by `subscriber` (on disconnect).
    pub async fn clear_for(&self, subscriber: &str) {
        let mut inner = self.inner.write().await;
        inner.retain(|_, subscribers| {
            subscribers.remove(subscriber);
            !subscribers.is_empty()
        });
    }

    /// Subscribers matching (device, kind, name), for fan-out.
    pub async fn subscribers_of(
        &self,
        device_id: &str,
        kind: SubscriptionKind,
        name: &str,
    ) -> Vec<String> {
        let key = (device_id.to_owned(), kind, name.to_owned());
        self.inner
            .read()
            .await
            .get(&key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.values().map(HashSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_subscribe_is_idempotent() {
        let subs = SubscriptionManager::new();
        assert!(
            subs.subscribe("c1", "scope-1", SubscriptionKind::Property, "temperature")
                .await
        );
        assert!(
            !subs
                .subscribe("c1", "scope-1", SubscriptionKind::Property, "temperature")
                .await
        );
        assert_eq!(subs.count().await, 1);

        // One unsubscribe undoes any number of subscribes.
        assert!(
            subs.unsubscribe("c1", "scope-1", SubscriptionKind::Property, "temperature")
                .await
        );
        assert!(
            subs.subscribers_of("scope-1", SubscriptionKind::Property, "temperature")
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn property_and_event_namespaces_are_distinct() {
        let subs = SubscriptionManager::new();
        subs.subscribe("c1", "scope-1", SubscriptionKind::Property, "slewing")
            .await;
        assert!(
            subs.subscribers_of("scope-1", SubscriptionKind::Event, "slewing")
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn clear_for_purges_every_entry() {
        let subs = SubscriptionManager::new();
        subs.subscribe("c1", "scope-1", SubscriptionKind::Event, "slew_done")
            .await;
        subs.subscribe("c1", "cam-1", SubscriptionKind::Property, "cooler")
            .await;
        subs.subscribe("c2", "scope-1", SubscriptionKind::Event, "slew_done")
            .await;

        subs.clear_for("c1").await;
        assert_eq!(subs.count().await, 1);
        assert_eq!(
            subs.subscribers_of("scope-1", SubscriptionKind::Event, "slew_done")
                .await,
            vec!["c2".to_owned()]
        );
    }
}
