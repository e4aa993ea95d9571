//! Element collab node: properties and ordered children.

use super::CollabNode;
use crate::binding::Binding;
use crate::diff;
use crate::error::Result;
use crate::local::{EditorState, LocalNode, NodeKey};
use crate::properties;
use crate::shared::{self, SharedNodeRef};
use crate::sync::{LocalPass, SharedPass};
use loro::TreeID;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug)]
pub struct CollabElementNode {
    key: NodeKey,
    shared: SharedNodeRef,
    pub(super) parent: Option<NodeKey>,
    node_type: String,
}

impl CollabElementNode {
    pub fn new(key: NodeKey, shared: SharedNodeRef, parent: Option<NodeKey>, node_type: String) -> Self {
        Self {
            key,
            shared,
            parent,
            node_type,
        }
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn shared(&self) -> SharedNodeRef {
        self.shared
    }

    pub fn parent(&self) -> Option<&NodeKey> {
        self.parent.as_ref()
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn sync_properties_from_local(&self, binding: &Binding, next: &LocalNode) -> Result<usize> {
        let meta = binding.meta(self.shared)?;
        properties::sync_properties_to_shared(&meta, next.properties())
    }

    pub fn sync_properties_from_shared(&self, binding: &Binding, editor: &mut EditorState) -> Result<bool> {
        let meta = binding.meta(self.shared)?;
        properties::sync_properties_to_local(&meta, editor, &self.key)
    }

    /// Make the shared child order equal the local child order.
    ///
    /// Children in the longest common subsequence of the mirrored and local
    /// orders stay where they are. Removed children go first, then every
    /// other child is placed right after its predecessor, then dirty
    /// retained children sync their own content.
    pub fn sync_children_from_local(&mut self, binding: &mut Binding, pass: &mut LocalPass<'_>) -> Result<()> {
        let next: Vec<NodeKey> = pass.editor.children(&self.key).to_vec();
        let prev = binding.shared_child_keys(self.shared);
        let script = diff::child_edit_script(&prev, &next);

        for key in &script.removals {
            if pass.editor.is_attached(key) {
                debug!("{} moved out of {}, leaving it to its new parent", key, self.key);
                continue;
            }
            pass.report.destroyed += binding.destroy_removed(key, &pass.update.prev_nodes, pass.editor);
        }

        let mut created = HashSet::new();
        let mut placed: Option<TreeID> = None;
        for key in &next {
            let existing = binding.node(key).and_then(|n| n.shared().tree_id());
            let id = match existing {
                Some(id) if script.anchors.contains(key) => id,
                Some(id) => {
                    self.place_after(binding, id, placed)?;
                    if let Some(node) = binding.node_mut(key) {
                        node.set_parent(self.key.clone());
                    }
                    id
                }
                None => {
                    let index = self.index_after(binding, placed);
                    created.insert(key.clone());
                    CollabNode::create_from_local(binding, pass, key, &self.key, self.shared, index)?
                }
            };
            placed = Some(id);
        }

        for key in &next {
            if created.contains(key) || !pass.update.is_dirty(key) {
                continue;
            }
            binding.with_node(key, |node, binding| node.sync_from_local(binding, pass))?;
        }
        Ok(())
    }

    /// Move `id` directly after `after` (or to the front) unless it is
    /// already there.
    fn place_after(&self, binding: &Binding, id: TreeID, after: Option<TreeID>) -> Result<()> {
        let tree = binding.tree();
        let siblings = shared::children(tree, self.shared);
        match after {
            Some(after) => {
                let current = siblings
                    .iter()
                    .position(|s| *s == after)
                    .and_then(|pos| siblings.get(pos + 1));
                if current != Some(&id) {
                    tree.mov_after(id, after)?;
                }
            }
            None => match siblings.first() {
                Some(first) if *first == id => {}
                Some(first) => tree.mov_before(id, *first)?,
                None => tree.mov_to(id, self.shared, 0)?,
            },
        }
        Ok(())
    }

    fn index_after(&self, binding: &Binding, after: Option<TreeID>) -> usize {
        after
            .and_then(|after| {
                shared::children(binding.tree(), self.shared)
                    .iter()
                    .position(|s| *s == after)
            })
            .map(|pos| pos + 1)
            .unwrap_or(0)
    }

    /// Make the local child order equal the shared child order.
    ///
    /// Shared children without a local node get one. Local children whose
    /// shared node was deleted are removed; ones whose shared node now lives
    /// under another parent are only detached so that parent can adopt them.
    pub fn sync_children_from_shared(&mut self, binding: &mut Binding, pass: &mut SharedPass<'_>) -> Result<()> {
        let shared_children = shared::children(binding.tree(), self.shared);
        let mut keys = Vec::with_capacity(shared_children.len());

        for id in shared_children {
            let key = match binding.owner_of_tree(&id).cloned() {
                Some(key) if pass.editor.contains(&key) => {
                    if let Some(node) = binding.node_mut(&key) {
                        node.set_parent(self.key.clone());
                    }
                    key
                }
                Some(stale) => {
                    debug!("Replacing collab node {} whose local node vanished", stale);
                    binding.destroy_node(&stale);
                    CollabNode::create_from_shared(binding, pass, id, &self.key)?
                }
                None => CollabNode::create_from_shared(binding, pass, id, &self.key)?,
            };
            keys.push(key);
        }

        let current: Vec<NodeKey> = pass.editor.children(&self.key).to_vec();
        for child in current.iter().filter(|c| !keys.contains(c)) {
            let moved = binding
                .node(child)
                .and_then(|n| n.shared().tree_id())
                .is_some_and(|id| shared::is_alive(binding.tree(), id));
            if moved {
                debug!("{} moved to another shared parent", child);
                continue;
            }
            pass.report.removed += binding.destroy_subtree(pass.editor, child);
            pass.editor.remove(child)?;
        }

        pass.editor.set_children(&self.key, &keys)?;
        Ok(())
    }
}
