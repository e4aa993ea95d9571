//! Decorator collab node.
//!
//! A decorator's state lives in a `LoroMap` nested under the `__state` meta
//! key. Replacing the local state map (a new identity) replaces the shared
//! map; in-place edits on either side flow through observers:
//! - local state map -> shared map, unless shared changes are being applied
//! - shared map -> the binding's change queue

use crate::binding::Binding;
use crate::error::{CollabError, Result};
use crate::events::Subscription;
use crate::local::{EditorState, LocalNode, NodeKey, NodeMap, StateMap, StateMapId};
use crate::properties;
use crate::shared::{self, SharedNodeRef};
use loro::{ContainerTrait, LoroMap, TreeID};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Lifecycle of a decorator collab node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoratorState {
    /// Not yet linked to a shared state map.
    Unbound,
    /// Linked and observing both maps.
    Bound,
    /// Terminal.
    Destroyed,
}

pub struct CollabDecoratorNode {
    key: NodeKey,
    id: TreeID,
    pub(super) parent: Option<NodeKey>,
    node_type: String,
    state: DecoratorState,
    linked: Option<StateMapId>,
    shared_map: Option<LoroMap>,
    /// Mirrors local state-map edits into the shared map. Dropping it
    /// unsubscribes.
    local_observer: Option<Subscription>,
    /// Feeds shared state-map changes into the binding's queue.
    shared_observer: Option<loro::Subscription>,
}

impl CollabDecoratorNode {
    pub fn new(key: NodeKey, id: TreeID, parent: Option<NodeKey>, node_type: String) -> Self {
        Self {
            key,
            id,
            parent,
            node_type,
            state: DecoratorState::Unbound,
            linked: None,
            shared_map: None,
            local_observer: None,
            shared_observer: None,
        }
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn shared(&self) -> SharedNodeRef {
        SharedNodeRef::Node(self.id)
    }

    pub fn parent(&self) -> Option<&NodeKey> {
        self.parent.as_ref()
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn state(&self) -> DecoratorState {
        self.state
    }

    /// Identity of the local state map this node is linked to.
    pub fn linked_state(&self) -> Option<StateMapId> {
        self.linked
    }

    pub fn observer_count(&self) -> usize {
        usize::from(self.local_observer.is_some()) + usize::from(self.shared_observer.is_some())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state == DecoratorState::Destroyed {
            return Err(CollabError::Destroyed {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    /// Sync properties, then replace the shared state map if the local state
    /// map changed identity since the previous snapshot (or was never
    /// linked). Returns whether a replacement happened.
    pub fn sync_properties_from_local(
        &mut self,
        binding: &mut Binding,
        next: &LocalNode,
        prev_nodes: &NodeMap,
    ) -> Result<bool> {
        self.ensure_live()?;
        let next_state = next
            .state()
            .ok_or_else(|| CollabError::desync(&self.key, "collab decorator bound to a non-decorator"))?;
        let meta = binding.meta(self.shared())?;
        properties::sync_properties_to_shared(&meta, next.properties())?;

        let prev_state = prev_nodes
            .get(&self.key)
            .and_then(|prev| prev.state())
            .map(StateMap::id);
        let unchanged = self.state == DecoratorState::Bound
            && prev_state == Some(next_state.id())
            && self.linked == Some(next_state.id());
        if unchanged {
            return Ok(false);
        }

        debug!("Replacing shared state map of {}", self.key);
        let map = meta.insert_container(shared::STATE_KEY, LoroMap::new())?;
        for (key, value) in next_state.entries() {
            shared::write_entry(&map, &key, value)?;
        }
        self.link(binding, next_state, map);
        Ok(true)
    }

    /// Apply shared state to the live local decorator.
    ///
    /// `keys_changed` limits the keys applied; `None` applies every key and
    /// removes local keys the shared map no longer has. A replaced shared map
    /// always applies every key.
    pub fn sync_properties_from_shared(
        &mut self,
        binding: &mut Binding,
        editor: &mut EditorState,
        keys_changed: Option<&HashSet<String>>,
    ) -> Result<bool> {
        self.ensure_live()?;
        let local_state = editor
            .decorator(&self.key)
            .and_then(|node| node.state().cloned())
            .ok_or_else(|| CollabError::desync(&self.key, "local decorator missing"))?;
        let meta = binding.meta(self.shared())?;
        let map = shared::get_map(&meta, shared::STATE_KEY).ok_or_else(|| CollabError::MissingSharedState {
            key: self.key.clone(),
        })?;

        let replaced = self.shared_map.as_ref().map(|m| m.id()) != Some(map.id());
        let keys_changed = if replaced { None } else { keys_changed };

        let mut changed = properties::sync_properties_to_local(&meta, editor, &self.key)?;
        {
            let _guard = binding.suppression().applying_shared();
            match keys_changed {
                Some(keys) => {
                    for key in keys {
                        match shared::read_entry(&map, key) {
                            Some(value) => {
                                if local_state.get(key).as_ref() != Some(&value) {
                                    local_state.set(key.clone(), value);
                                    changed = true;
                                }
                            }
                            None => changed |= local_state.remove(key).is_some(),
                        }
                    }
                }
                None => {
                    let entries = shared::read_entries(&map);
                    for key in local_state.keys() {
                        if !entries.contains_key(&key) {
                            local_state.remove(&key);
                            changed = true;
                        }
                    }
                    for (key, value) in entries {
                        if local_state.get(&key).as_ref() != Some(&value) {
                            local_state.set(key, value);
                            changed = true;
                        }
                    }
                }
            }
        }

        self.link(binding, &local_state, map);
        Ok(changed)
    }

    /// Link `state` with `map` in the binding and (re)install both observers.
    fn link(&mut self, binding: &mut Binding, state: &StateMap, map: LoroMap) {
        self.unobserve();
        if let Some(old) = self.linked.take() {
            binding.unlink_state(old);
        }
        binding.link_state(&self.key, state.id(), map.id());

        let target = map.clone();
        let suppression = binding.suppression().clone();
        let key = self.key.clone();
        let local = state.observe(move |change| {
            if suppression.is_applying_shared() {
                return;
            }
            let result = match change.value {
                Some(value) => shared::write_entry(&target, &change.key, value),
                None => shared::delete_entry(&target, &change.key),
            };
            if let Err(e) = result {
                warn!("Failed to mirror state key {} of {}: {}", change.key, key, e);
            }
        });
        let remote = binding.subscribe_container(&map.id());

        self.local_observer = Some(local);
        self.shared_observer = Some(remote);
        self.linked = Some(state.id());
        self.shared_map = Some(map);
        self.state = DecoratorState::Bound;
    }

    fn unobserve(&mut self) {
        self.local_observer = None;
        self.shared_observer = None;
    }

    /// Unregister and cancel every observer. A second call does nothing.
    pub fn destroy(&mut self, binding: &mut Binding) {
        if self.state == DecoratorState::Destroyed {
            return;
        }
        self.unobserve();
        if let Some(linked) = self.linked.take() {
            binding.unlink_state(linked);
        }
        binding.unregister(&self.key);
        self.shared_map = None;
        self.state = DecoratorState::Destroyed;
        debug!("Destroyed collab decorator {}", self.key);
    }
}

impl std::fmt::Debug for CollabDecoratorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabDecoratorNode")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("state", &self.state)
            .field("linked", &self.linked)
            .field("observers", &self.observer_count())
            .finish()
    }
}
