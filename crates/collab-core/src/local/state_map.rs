//! Decorator state maps.
//!
//! A `StateMap` is a shared handle: clones point at the same entries and carry
//! the same identity token. Replacing a decorator's state map means installing
//! a map with a different `StateMapId`, which is how the synchronizer tells a
//! swap apart from in-place edits. Content equality never matters.

use crate::events::{EventBus, Subscription};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

static NEXT_STATE_MAP_ID: AtomicU64 = AtomicU64::new(1);

/// Identity token of a state map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateMapId(u64);

/// A single key change on a state map. `value` is `None` for removals.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMapChange {
    pub key: String,
    pub value: Option<Value>,
}

struct StateMapInner {
    id: StateMapId,
    entries: RwLock<BTreeMap<String, Value>>,
    observers: Arc<EventBus<StateMapChange>>,
}

/// Key/value state of a decorator node.
#[derive(Clone)]
pub struct StateMap {
    inner: Arc<StateMapInner>,
}

impl StateMap {
    pub fn new() -> Self {
        Self::from_entries(std::iter::empty::<(String, Value)>())
    }

    pub fn from_entries<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        let entries = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self {
            inner: Arc::new(StateMapInner {
                id: StateMapId(NEXT_STATE_MAP_ID.fetch_add(1, Ordering::Relaxed)),
                entries: RwLock::new(entries),
                observers: Arc::new(EventBus::new()),
            }),
        }
    }

    pub fn id(&self) -> StateMapId {
        self.inner.id
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    /// Set a key, notifying observers when the value actually changes.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let changed = {
            let mut entries = self
                .inner
                .entries
                .write()
                .unwrap_or_else(|e| e.into_inner());
            if entries.get(&key) == Some(&value) {
                false
            } else {
                entries.insert(key.clone(), value.clone());
                true
            }
        };
        if changed {
            self.inner.observers.emit(StateMapChange {
                key,
                value: Some(value),
            });
        }
    }

    /// Remove a key, notifying observers when it existed.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let removed = self
            .inner
            .entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        if removed.is_some() {
            self.inner.observers.emit(StateMapChange {
                key: key.to_string(),
                value: None,
            });
        }
        removed
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Copy of every entry, ordered by key.
    pub fn entries(&self) -> BTreeMap<String, Value> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Observe key changes. Dropping the returned handle stops observation.
    pub fn observe(&self, callback: impl Fn(StateMapChange) + Send + Sync + 'static) -> Subscription {
        self.inner.observers.subscribe(callback)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.subscriber_count()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.inner.entries.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for StateMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMap")
            .field("id", &self.inner.id)
            .field("entries", &*self.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_clones_share_identity_and_entries() {
        let map = StateMap::from_entries([("color", json!("red"))]);
        let alias = map.clone();
        alias.set("size", json!("large"));

        assert_eq!(map.id(), alias.id());
        assert_eq!(map.get("size"), Some(json!("large")));
    }

    #[test]
    fn test_equal_content_has_distinct_identity() {
        let a = StateMap::from_entries([("color", json!("red"))]);
        let b = StateMap::from_entries([("color", json!("red"))]);
        assert_eq!(a.entries(), b.entries());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_observers_see_only_real_changes() {
        let map = StateMap::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sub = map.observe(move |change| seen_clone.lock().unwrap().push(change));

        map.set("color", json!("red"));
        map.set("color", json!("red"));
        map.remove("color");
        map.remove("color");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                StateMapChange {
                    key: "color".into(),
                    value: Some(json!("red")),
                },
                StateMapChange {
                    key: "color".into(),
                    value: None,
                },
            ]
        );

        drop(sub);
        assert_eq!(map.observer_count(), 0);
    }
}
