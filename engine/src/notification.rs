//! Conflict notifications for external subscribers.
//!
//! The conflict engine queues a notification on the applying transaction;
//! it is published only after that transaction commits. Delivery is
//! best-effort: a panicking subscriber is logged and skipped.

use crate::{entity::ReplicatedItemType, Etag, Key};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// What the incoming conflicting version did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicationOperation {
    Put,
    Delete,
}

/// Raised when an item enters (or stays in) conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationConflictNotification {
    pub item_type: ReplicatedItemType,
    /// Key of the conflicted item
    pub id: Key,
    /// Etag of the conflict placeholder
    pub etag: Etag,
    pub operation: ReplicationOperation,
    /// Every conflict holder of the item
    pub conflicts: Vec<Key>,
}

/// Receives conflict notifications.
pub trait ConflictSubscriber: Send + Sync {
    fn on_conflict(&self, notification: &ReplicationConflictNotification);
}

impl<F> ConflictSubscriber for F
where
    F: Fn(&ReplicationConflictNotification) + Send + Sync,
{
    fn on_conflict(&self, notification: &ReplicationConflictNotification) {
        self(notification)
    }
}

/// Handle returned by [`NotificationHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out of conflict notifications.
#[derive(Default)]
pub struct NotificationHub {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn ConflictSubscriber>)>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ConflictSubscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.push((id, subscriber));
        }
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut subscribers) = self.subscribers.write() else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Deliver to every subscriber.
    pub fn publish(&self, notification: &ReplicationConflictNotification) {
        let subscribers: Vec<_> = match self.subscribers.read() {
            Ok(subscribers) => subscribers.iter().map(|(_, s)| Arc::clone(s)).collect(),
            Err(_) => return,
        };

        tracing::debug!(
            id = %notification.id,
            conflicts = notification.conflicts.len(),
            subscribers = subscribers.len(),
            "publishing replication conflict"
        );

        for subscriber in subscribers {
            let delivered = catch_unwind(AssertUnwindSafe(|| subscriber.on_conflict(notification)));
            if delivered.is_err() {
                tracing::warn!(id = %notification.id, "conflict subscriber panicked");
            }
        }
    }
}
