//! Event infrastructure for the collaboration core.
//!
//! `EventBus<E>` is a small observer registry: subscribers get a `Subscription`
//! handle and stay registered for as long as they hold it. The same bus type
//! backs decorator state-map observation and the session's monitoring events
//! (`CollabEvent`).

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by a collaboration session for debugging and monitoring.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CollabEvent {
    /// A local edit transaction was written into the shared tree.
    LocalSynced {
        /// Collab nodes created for freshly inserted local nodes.
        created: usize,
        /// Collab nodes destroyed along with their local nodes.
        destroyed: usize,
        /// Text splices issued against shared texts.
        #[serde(rename = "textEdits")]
        text_edits: usize,
    },
    /// Shared-tree changes (remote or merged) were applied to the local tree.
    RemoteApplied {
        /// Local nodes created from shared nodes.
        created: usize,
        /// Local nodes removed because their shared node vanished.
        removed: usize,
        /// Nodes whose properties, text or state were refreshed.
        updated: usize,
    },
    /// A synchronization invariant was violated.
    Error {
        /// Human-readable description of the failure.
        message: String,
        /// Whether the failure indicates the trees have diverged.
        fatal: bool,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unsubscribe now. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Event bus for publishing events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: Clone + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Subscription
    where
        E: Send + Sync,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));

        let bus: Weak<Self> = Arc::downgrade(self);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(bus) = bus.upgrade() {
                    bus.unsubscribe(id);
                }
            })),
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the callback list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_applied() -> CollabEvent {
        CollabEvent::RemoteApplied {
            created: 1,
            removed: 0,
            updated: 2,
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event: CollabEvent| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(remote_applied());

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event: CollabEvent| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(remote_applied());
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(remote_applied());
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let bus = Arc::new(EventBus::new());
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        let count1_clone = Arc::clone(&count1);
        let count2_clone = Arc::clone(&count2);

        let sub1 = bus.subscribe(move |_: CollabEvent| {
            count1_clone.fetch_add(1, Ordering::Relaxed);
        });
        let _sub2 = bus.subscribe(move |_: CollabEvent| {
            count2_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(remote_applied());
        sub1.unsubscribe();
        bus.emit(remote_applied());

        assert_eq!(count1.load(Ordering::Relaxed), 1);
        assert_eq!(count2.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_collab_event_serialization() {
        let event = CollabEvent::LocalSynced {
            created: 2,
            destroyed: 1,
            text_edits: 3,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"localSynced\""));
        assert!(json.contains("\"textEdits\":3"));
    }
}
