//! Binding: the registry tying local nodes to their shared counterparts.
//!
//! The binding owns the shared document, every collab node (keyed by local
//! node key) and the side tables that route shared change events back to the
//! collab node owning the changed tree node or container.

use crate::bridge::{self, ChangeQueue, SharedChange, Suppression};
use crate::collab::{CollabElementNode, CollabNode};
use crate::config::CollabConfig;
use crate::error::{CollabError, Result};
use crate::events::{CollabEvent, EventBus};
use crate::local::{EditorState, NodeKey, NodeMap, StateMapId};
use crate::peer_id::PeerId;
use crate::shared::{self, SharedNodeRef};
use loro::{ContainerID, ContainerTrait, LoroDoc, LoroMap, LoroTree, TreeID};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a registered container holds for its owning collab node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
    /// The node's meta map (variant, type, properties).
    Meta,
    /// The text content of a text node.
    Text,
    /// The state map of a decorator.
    State,
}

type ErrorHook = Box<dyn Fn(&CollabError) + Send + Sync>;

/// Side-table entries recorded for one collab node, so unregistering it
/// touches only its own entries.
#[derive(Debug, Default)]
struct Owned {
    tree: Option<TreeID>,
    containers: Vec<ContainerID>,
    states: Vec<StateMapId>,
}

pub struct Binding {
    doc: LoroDoc,
    tree: LoroTree,
    root_meta: LoroMap,
    root_key: NodeKey,
    peer_id: PeerId,
    config: CollabConfig,
    nodes: HashMap<NodeKey, CollabNode>,
    tree_owners: HashMap<TreeID, NodeKey>,
    container_owners: HashMap<ContainerID, (NodeKey, ContainerRole)>,
    state_links: HashMap<StateMapId, ContainerID>,
    owned: HashMap<NodeKey, Owned>,
    pending_deletes: Vec<TreeID>,
    suppression: Suppression,
    queue: ChangeQueue,
    root_subscription: Option<loro::Subscription>,
    events: Arc<EventBus<CollabEvent>>,
    error_hook: Option<ErrorHook>,
}

impl Binding {
    /// Bind a fresh shared document to a local tree rooted at `root_key`.
    pub fn new(config: CollabConfig, root_key: NodeKey) -> Result<Self> {
        Self::with_doc(LoroDoc::new(), config, root_key)
    }

    /// Bind an existing shared document (e.g. one loaded from a snapshot).
    pub fn with_doc(doc: LoroDoc, config: CollabConfig, root_key: NodeKey) -> Result<Self> {
        if !shared::is_valid_root_name(&config.tree_name) {
            return Err(CollabError::InvalidConfig(format!(
                "tree name {:?} must be non-empty without '/' or NUL",
                config.tree_name
            )));
        }
        let peer_id = config.peer_id.unwrap_or_else(PeerId::generate);
        doc.set_peer_id(peer_id.as_u64())?;

        let tree = doc.get_tree(config.tree_name.as_str());
        tree.enable_fractional_index(config.fractional_index_jitter);
        let root_meta = doc.get_map(shared::root_meta_name(&config.tree_name).as_str());

        let suppression = Suppression::new();
        let queue = ChangeQueue::default();
        let root_subscription = doc.subscribe_root(bridge::listener(queue.clone(), suppression.clone()));

        let mut binding = Self {
            doc,
            tree,
            root_meta,
            root_key: root_key.clone(),
            peer_id,
            config,
            nodes: HashMap::new(),
            tree_owners: HashMap::new(),
            container_owners: HashMap::new(),
            state_links: HashMap::new(),
            owned: HashMap::new(),
            pending_deletes: Vec::new(),
            suppression,
            queue,
            root_subscription: Some(root_subscription),
            events: Arc::new(EventBus::new()),
            error_hook: None,
        };
        binding.register(CollabNode::Element(CollabElementNode::new(
            root_key,
            SharedNodeRef::Root,
            None,
            "root".to_string(),
        )))?;

        info!("Binding created for peer {}", peer_id);
        Ok(binding)
    }

    // ========== Accessors ==========

    pub fn doc(&self) -> &LoroDoc {
        &self.doc
    }

    pub fn tree(&self) -> &LoroTree {
        &self.tree
    }

    pub fn root_key(&self) -> &NodeKey {
        &self.root_key
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn suppression(&self) -> &Suppression {
        &self.suppression
    }

    pub fn events(&self) -> &Arc<EventBus<CollabEvent>> {
        &self.events
    }

    /// Meta map of a shared node.
    pub fn meta(&self, node: SharedNodeRef) -> Result<LoroMap> {
        match node {
            SharedNodeRef::Root => Ok(self.root_meta.clone()),
            SharedNodeRef::Node(id) => Ok(self.tree.get_meta(id)?),
        }
    }

    // ========== Registry ==========

    pub fn node(&self, key: &NodeKey) -> Option<&CollabNode> {
        self.nodes.get(key)
    }

    pub fn node_mut(&mut self, key: &NodeKey) -> Option<&mut CollabNode> {
        self.nodes.get_mut(key)
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// Number of registered collab nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.nodes.keys()
    }

    /// Register a collab node and record its shared node and meta map in the
    /// side tables. A key can only be registered once.
    pub fn register(&mut self, node: CollabNode) -> Result<()> {
        let key = node.key().clone();
        if self.nodes.contains_key(&key) {
            return Err(CollabError::desync(&key, "collab node registered twice"));
        }
        if let Some(id) = node.shared().tree_id() {
            if let Some(owner) = self.tree_owners.get(&id) {
                if *owner != key {
                    return Err(CollabError::desync(
                        &key,
                        format!("shared node {id:?} already owned by {owner}"),
                    ));
                }
            }
            self.tree_owners.insert(id, key.clone());
            self.owned.entry(key.clone()).or_default().tree = Some(id);
        }
        let meta = self.meta(node.shared())?;
        self.link_container(meta.id(), &key, ContainerRole::Meta);
        self.nodes.insert(key, node);
        Ok(())
    }

    /// Remove a collab node and every side-table entry pointing at it.
    pub fn unregister(&mut self, key: &NodeKey) -> Option<CollabNode> {
        if let Some(owned) = self.owned.remove(key) {
            if let Some(id) = owned.tree {
                if self.tree_owners.get(&id) == Some(key) {
                    self.tree_owners.remove(&id);
                }
            }
            for cid in &owned.containers {
                if matches!(self.container_owners.get(cid), Some((owner, _)) if owner == key) {
                    self.container_owners.remove(cid);
                }
            }
            for state in &owned.states {
                self.state_links.remove(state);
            }
        }
        self.nodes.remove(key)
    }

    /// Take a collab node out of the registry for the duration of `f`.
    ///
    /// The node cannot be reached through the binding while `f` runs. It is
    /// put back afterwards unless `f` destroyed it.
    pub fn with_node<T>(
        &mut self,
        key: &NodeKey,
        f: impl FnOnce(&mut CollabNode, &mut Binding) -> Result<T>,
    ) -> Result<T> {
        let mut node = self
            .nodes
            .remove(key)
            .ok_or_else(|| CollabError::desync(key, "no collab node registered"))?;
        let result = f(&mut node, self);
        if !node.is_destroyed() {
            self.nodes.entry(key.clone()).or_insert(node);
        }
        result
    }

    /// Destroy a single collab node. Returns whether one was registered.
    pub fn destroy_node(&mut self, key: &NodeKey) -> bool {
        match self.nodes.remove(key) {
            Some(mut node) => {
                node.destroy(self);
                true
            }
            None => {
                self.unregister(key);
                false
            }
        }
    }

    /// Destroy the collab nodes of a local subtree, walking the live editor.
    pub fn destroy_subtree(&mut self, editor: &EditorState, key: &NodeKey) -> usize {
        let mut destroyed = 0;
        let mut stack = vec![key.clone()];
        while let Some(current) = stack.pop() {
            stack.extend(editor.children(&current).iter().cloned());
            if self.destroy_node(&current) {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Destroy the collab nodes of a subtree removed by a local transaction
    /// and queue its shared node for deletion.
    ///
    /// Descendants that are still attached elsewhere in the editor were moved
    /// out and keep their collab nodes.
    pub(crate) fn destroy_removed(
        &mut self,
        key: &NodeKey,
        prev_nodes: &NodeMap,
        editor: &EditorState,
    ) -> usize {
        if let Some(id) = self.node(key).and_then(|n| n.shared().tree_id()) {
            self.pending_deletes.push(id);
        }
        let mut destroyed = 0;
        let mut stack = vec![key.clone()];
        while let Some(current) = stack.pop() {
            if current != *key && editor.is_attached(&current) {
                continue;
            }
            if let Some(node) = prev_nodes.get(&current) {
                stack.extend(node.children().iter().cloned());
            }
            if self.destroy_node(&current) {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Delete the shared nodes queued by `destroy_removed`. Runs after all
    /// moves of a pass so moved-out descendants survive.
    pub(crate) fn flush_deletes(&mut self) -> Result<()> {
        for id in std::mem::take(&mut self.pending_deletes) {
            if shared::is_alive(&self.tree, id) {
                self.tree.delete(id)?;
            }
        }
        Ok(())
    }

    /// Destroy collab nodes whose local node no longer exists.
    pub(crate) fn prune_orphans(&mut self, editor: &EditorState) -> usize {
        let orphans: Vec<NodeKey> = self
            .nodes
            .keys()
            .filter(|key| !editor.contains(key))
            .cloned()
            .collect();
        for key in &orphans {
            debug!("Pruning orphaned collab node {}", key);
            self.destroy_node(key);
        }
        orphans.len()
    }

    /// Destroy every collab node except the root.
    pub fn reset(&mut self) {
        let keys: Vec<NodeKey> = self
            .nodes
            .keys()
            .filter(|key| **key != self.root_key)
            .cloned()
            .collect();
        for key in &keys {
            self.destroy_node(key);
        }
        self.pending_deletes.clear();
        self.queue.drain();
    }

    /// Destroy every collab node and stop observing the shared document.
    pub fn teardown(&mut self) {
        let keys: Vec<NodeKey> = self.nodes.keys().cloned().collect();
        for key in &keys {
            self.destroy_node(key);
        }
        self.root_subscription = None;
        self.queue.drain();
        info!("Binding for peer {} torn down", self.peer_id);
    }

    // ========== Side tables ==========

    pub fn owner_of_tree(&self, id: &TreeID) -> Option<&NodeKey> {
        self.tree_owners.get(id)
    }

    pub fn owner_of_container(&self, cid: &ContainerID) -> Option<(&NodeKey, ContainerRole)> {
        self.container_owners
            .get(cid)
            .map(|(key, role)| (key, *role))
    }

    pub(crate) fn link_container(&mut self, cid: ContainerID, key: &NodeKey, role: ContainerRole) {
        if let Some((previous, _)) = self.container_owners.insert(cid.clone(), (key.clone(), role)) {
            if previous == *key {
                return;
            }
            if let Some(owned) = self.owned.get_mut(&previous) {
                owned.containers.retain(|c| *c != cid);
            }
        }
        self.owned.entry(key.clone()).or_default().containers.push(cid);
    }

    pub(crate) fn unlink_container(&mut self, cid: &ContainerID) {
        if let Some((owner, _)) = self.container_owners.remove(cid) {
            if let Some(owned) = self.owned.get_mut(&owner) {
                owned.containers.retain(|c| c != cid);
            }
        }
    }

    /// Link a local state map with its shared map, both ways.
    pub(crate) fn link_state(&mut self, key: &NodeKey, state: StateMapId, cid: ContainerID) {
        self.state_links.insert(state, cid.clone());
        self.link_container(cid, key, ContainerRole::State);
        let owned = self.owned.entry(key.clone()).or_default();
        if !owned.states.contains(&state) {
            owned.states.push(state);
        }
    }

    pub(crate) fn unlink_state(&mut self, state: StateMapId) {
        if let Some(cid) = self.state_links.remove(&state) {
            if let Some((owner, _)) = self.container_owners.remove(&cid) {
                if let Some(owned) = self.owned.get_mut(&owner) {
                    owned.containers.retain(|c| *c != cid);
                    owned.states.retain(|s| *s != state);
                }
            }
        }
    }

    /// Shared map linked to a local state map.
    pub fn linked_container(&self, state: StateMapId) -> Option<&ContainerID> {
        self.state_links.get(&state)
    }

    /// Nearest ancestor of a shared node that has an owner.
    pub fn nearest_known_ancestor(&self, id: TreeID) -> Option<NodeKey> {
        let mut current = shared::parent_of(&self.tree, id)?;
        loop {
            match current {
                SharedNodeRef::Root => return Some(self.root_key.clone()),
                SharedNodeRef::Node(node) => {
                    if let Some(key) = self.tree_owners.get(&node) {
                        return Some(key.clone());
                    }
                    current = shared::parent_of(&self.tree, node)?;
                }
            }
        }
    }

    /// Keys of the owned children of `parent`, in shared order. This is the
    /// child sequence the shared tree currently mirrors.
    pub fn shared_child_keys(&self, parent: SharedNodeRef) -> Vec<NodeKey> {
        shared::children(&self.tree, parent)
            .iter()
            .filter_map(|id| self.tree_owners.get(id).cloned())
            .collect()
    }

    // ========== Shared document ==========

    pub fn commit(&self) {
        self.doc.commit();
    }

    pub(crate) fn drain_changes(&self) -> Vec<SharedChange> {
        self.queue.drain()
    }

    /// Observe a single container. Dropping the handle stops observation.
    pub(crate) fn subscribe_container(&self, cid: &ContainerID) -> loro::Subscription {
        self.doc.subscribe(
            cid,
            bridge::listener(self.queue.clone(), self.suppression.clone()),
        )
    }

    // ========== Errors & events ==========

    pub fn set_error_hook(&mut self, hook: impl Fn(&CollabError) + Send + Sync + 'static) {
        self.error_hook = Some(Box::new(hook));
    }

    /// Report a failure through the error hook and the event bus.
    pub fn report_error(&self, err: &CollabError) {
        warn!("Collaboration error on peer {}: {}", self.peer_id, err);
        if let Some(hook) = &self.error_hook {
            hook(err);
        }
        self.events.emit(CollabEvent::Error {
            message: err.to_string(),
            fatal: err.is_fatal(),
        });
    }

    pub(crate) fn emit(&self, event: CollabEvent) {
        self.events.emit(event);
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("peer_id", &self.peer_id)
            .field("nodes", &self.nodes.len())
            .field("pending_changes", &self.queue.len())
            .finish()
    }
}
