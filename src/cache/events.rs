//! Change Notifications
//!
//! Explicit observer registration for replica-set changes and observed
//! tombstones. Callbacks run synchronously inside the reconciliation
//! task that produced the change; subscribers that need to do real work
//! should hand the event off to their own task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

/// Notification published by the coordinator's reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CacheEvent {
    /// A memory-resident key gained at least one foreign replica
    InstancesChanged {
        /// The logical key that changed
        key: String,
    },
    /// The key's tombstone was observed; the whole key is gone
    KeyDeleted {
        /// The logical key that was deleted
        key: String,
    },
}

pub(crate) type EventCallback = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Subscriber registry with synchronous delivery.
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<HashMap<u64, EventCallback>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn subscribe(self: Arc<Self>, callback: EventCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, callback);
        Subscription {
            id,
            bus: Arc::downgrade(&self),
        }
    }

    /// Deliver `event` to every subscriber; returns how many were called.
    /// Callbacks run outside the registry lock, so a callback may
    /// subscribe or unsubscribe without deadlocking.
    pub fn publish(&self, event: &CacheEvent) -> usize {
        let callbacks: Vec<EventCallback> = self.subscribers.lock().values().cloned().collect();
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }
}

/// Registration handle returned by subscribe; deregisters the callback
/// on drop or explicit [`unsubscribe`](Self::unsubscribe).
pub struct Subscription {
    id: u64,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Deregister the callback
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}
