//! Observer/event bridge between Loro change events and the synchronizer.
//!
//! Loro listeners only record what changed into a [`ChangeQueue`]. The queue
//! is drained after an import and routed through the binding's side tables
//! into a [`ChangeSet`] the shared-to-local pass consumes.
//!
//! Echo prevention uses two suppression windows:
//! - `local_write`: open while local edits are written and committed; listeners
//!   drop every event raised inside it.
//! - `applying_shared`: open while shared changes are applied locally; local
//!   state-map observers do not write back.

use crate::binding::{Binding, ContainerRole};
use crate::local::NodeKey;
use loro::event::{ContainerDiff, Diff, DiffEvent, Subscriber};
use loro::{ContainerID, Index, TreeExternalDiff, TreeID, TreeParentId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One recorded shared-tree change.
#[derive(Debug, Clone, PartialEq)]
pub enum SharedChange {
    /// The child list of `parent` changed.
    Children { parent: TreeParentId },
    /// Keys of a map container changed. `owner` is the nearest tree node in
    /// the event path.
    Map {
        container: ContainerID,
        keys: Vec<String>,
        owner: Option<TreeID>,
    },
    /// A text container changed.
    Text {
        container: ContainerID,
        owner: Option<TreeID>,
    },
}

/// Restores a suppression flag to its previous value on drop.
#[must_use = "suppression ends when the guard is dropped"]
pub struct SuppressionGuard {
    flag: Arc<AtomicBool>,
    previous: bool,
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        self.flag.store(self.previous, Ordering::SeqCst);
    }
}

/// Echo-prevention state shared with Loro listeners and state-map observers.
#[derive(Debug, Clone, Default)]
pub struct Suppression {
    local_write: Arc<AtomicBool>,
    applying_shared: Arc<AtomicBool>,
}

impl Suppression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_write(&self) -> SuppressionGuard {
        open(&self.local_write)
    }

    pub fn applying_shared(&self) -> SuppressionGuard {
        open(&self.applying_shared)
    }

    pub fn is_local_write(&self) -> bool {
        self.local_write.load(Ordering::SeqCst)
    }

    pub fn is_applying_shared(&self) -> bool {
        self.applying_shared.load(Ordering::SeqCst)
    }
}

fn open(flag: &Arc<AtomicBool>) -> SuppressionGuard {
    let previous = flag.swap(true, Ordering::SeqCst);
    SuppressionGuard {
        flag: Arc::clone(flag),
        previous,
    }
}

/// Pending shared changes recorded by listeners.
#[derive(Debug, Clone, Default)]
pub struct ChangeQueue {
    inner: Arc<Mutex<Vec<SharedChange>>>,
}

impl ChangeQueue {
    pub fn push(&self, change: SharedChange) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(change);
    }

    pub fn drain(&self) -> Vec<SharedChange> {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build a Loro subscriber that records changes unless a local write is in
/// progress.
pub(crate) fn listener(queue: ChangeQueue, suppression: Suppression) -> Subscriber {
    Arc::new(move |event: DiffEvent| {
        if suppression.is_local_write() {
            return;
        }
        for diff in event.events {
            record(&queue, diff);
        }
    })
}

fn record(queue: &ChangeQueue, diff: ContainerDiff) {
    let owner = diff.path.iter().rev().find_map(|(_, index)| match index {
        Index::Node(id) => Some(*id),
        _ => None,
    });
    match diff.diff {
        Diff::Tree(tree) => {
            for item in tree.diff.iter() {
                match &item.action {
                    TreeExternalDiff::Create { parent, .. } => {
                        queue.push(SharedChange::Children { parent: *parent });
                    }
                    TreeExternalDiff::Move {
                        parent, old_parent, ..
                    } => {
                        queue.push(SharedChange::Children { parent: *parent });
                        if old_parent != parent {
                            queue.push(SharedChange::Children {
                                parent: *old_parent,
                            });
                        }
                    }
                    TreeExternalDiff::Delete { old_parent, .. } => {
                        queue.push(SharedChange::Children {
                            parent: *old_parent,
                        });
                    }
                    #[allow(unreachable_patterns)]
                    _ => {}
                }
            }
        }
        Diff::Map(delta) => {
            queue.push(SharedChange::Map {
                container: diff.target.clone(),
                keys: delta.updated.keys().map(|k| k.to_string()).collect(),
                owner,
            });
        }
        Diff::Text(_) => {
            queue.push(SharedChange::Text {
                container: diff.target.clone(),
                owner,
            });
        }
        _ => {}
    }
}

/// Shared changes resolved to the collab nodes that own them.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Parents whose child list changed.
    pub children: HashSet<NodeKey>,
    /// Nodes whose properties, text or format changed.
    pub content: HashSet<NodeKey>,
    /// Decorators whose state changed. `None` means every key.
    pub state_keys: HashMap<NodeKey, Option<HashSet<String>>>,
}

impl ChangeSet {
    pub fn route(binding: &Binding, changes: Vec<SharedChange>) -> Self {
        let mut set = ChangeSet::default();
        for change in changes {
            match change {
                SharedChange::Children { parent } => match parent {
                    TreeParentId::Root => {
                        set.children.insert(binding.root_key().clone());
                    }
                    TreeParentId::Node(id) => match binding.owner_of_tree(&id) {
                        Some(key) => {
                            set.children.insert(key.clone());
                        }
                        None => set.fall_back(binding, Some(id)),
                    },
                    _ => {}
                },
                SharedChange::Map {
                    container,
                    keys,
                    owner,
                } => match binding.owner_of_container(&container) {
                    Some((key, ContainerRole::State)) => {
                        set.add_state_keys(key, Some(keys));
                    }
                    Some((key, _)) => {
                        if keys.iter().any(|k| k == crate::shared::STATE_KEY) {
                            set.add_state_keys(key, None);
                        }
                        set.content.insert(key.clone());
                    }
                    None => match owner.and_then(|id| binding.owner_of_tree(&id)) {
                        Some(key) => {
                            if keys.iter().any(|k| k == crate::shared::STATE_KEY) {
                                set.add_state_keys(key, None);
                            }
                            set.content.insert(key.clone());
                        }
                        None => set.fall_back(binding, owner),
                    },
                },
                SharedChange::Text { container, owner } => {
                    let key = binding
                        .owner_of_container(&container)
                        .map(|(key, _)| key)
                        .or_else(|| owner.and_then(|id| binding.owner_of_tree(&id)));
                    match key {
                        Some(key) => {
                            set.content.insert(key.clone());
                        }
                        None => set.fall_back(binding, owner),
                    }
                }
            }
        }
        set
    }

    /// Resolve a change on an unknown node to a full child reconciliation of
    /// its nearest known ancestor.
    fn fall_back(&mut self, binding: &Binding, node: Option<TreeID>) {
        let Some(id) = node else {
            debug!("Dropping shared change with no tree owner");
            return;
        };
        if let Some(key) = binding.nearest_known_ancestor(id) {
            debug!("Unknown shared node {:?}, reconciling ancestor {}", id, key);
            self.children.insert(key);
        }
    }

    fn add_state_keys(&mut self, key: &NodeKey, keys: Option<Vec<String>>) {
        let entry = self
            .state_keys
            .entry(key.clone())
            .or_insert_with(|| Some(HashSet::new()));
        match (entry.as_mut(), keys) {
            (Some(existing), Some(keys)) => existing.extend(keys),
            _ => *entry = None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.content.is_empty() && self.state_keys.is_empty()
    }
}
