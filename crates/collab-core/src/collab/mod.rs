//! Collab nodes: per-node proxies pairing a local node with its shared node.

mod decorator;
mod element;
mod text;

pub use decorator::{CollabDecoratorNode, DecoratorState};
pub use element::CollabElementNode;
pub use text::CollabTextNode;

use crate::binding::{Binding, ContainerRole};
use crate::error::{CollabError, Result};
use crate::local::{EditorState, NodeKey, NodeKind, StateMap};
use crate::properties;
use crate::shared::{self, SharedNodeRef};
use crate::sync::{LocalPass, SharedPass};
use loro::{LoroText, TreeID};
use std::collections::HashSet;
use tracing::debug;

/// A collab node of any variant.
#[derive(Debug)]
pub enum CollabNode {
    Element(CollabElementNode),
    Text(CollabTextNode),
    Decorator(CollabDecoratorNode),
}

impl CollabNode {
    pub fn key(&self) -> &NodeKey {
        match self {
            CollabNode::Element(n) => n.key(),
            CollabNode::Text(n) => n.key(),
            CollabNode::Decorator(n) => n.key(),
        }
    }

    pub fn shared(&self) -> SharedNodeRef {
        match self {
            CollabNode::Element(n) => n.shared(),
            CollabNode::Text(n) => n.shared(),
            CollabNode::Decorator(n) => n.shared(),
        }
    }

    pub fn parent(&self) -> Option<&NodeKey> {
        match self {
            CollabNode::Element(n) => n.parent(),
            CollabNode::Text(n) => n.parent(),
            CollabNode::Decorator(n) => n.parent(),
        }
    }

    pub(crate) fn set_parent(&mut self, parent: NodeKey) {
        match self {
            CollabNode::Element(n) => n.parent = Some(parent),
            CollabNode::Text(n) => n.parent = Some(parent),
            CollabNode::Decorator(n) => n.parent = Some(parent),
        }
    }

    pub fn node_type(&self) -> &str {
        match self {
            CollabNode::Element(n) => n.node_type(),
            CollabNode::Text(n) => n.node_type(),
            CollabNode::Decorator(n) => n.node_type(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            CollabNode::Element(n) if n.shared() == SharedNodeRef::Root => NodeKind::Root,
            CollabNode::Element(_) => NodeKind::Element,
            CollabNode::Text(_) => NodeKind::Text,
            CollabNode::Decorator(_) => NodeKind::Decorator,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, CollabNode::Decorator(n) if n.state() == DecoratorState::Destroyed)
    }

    /// Unregister from the binding and cancel every observer. Idempotent.
    pub fn destroy(&mut self, binding: &mut Binding) {
        match self {
            CollabNode::Decorator(n) => n.destroy(binding),
            other => {
                binding.unregister(other.key());
            }
        }
    }

    /// Bind a fresh local node: create its shared node at `index` under
    /// `parent_shared`, register it and write its full content.
    pub fn create_from_local(
        binding: &mut Binding,
        pass: &mut LocalPass<'_>,
        key: &NodeKey,
        parent: &NodeKey,
        parent_shared: SharedNodeRef,
        index: usize,
    ) -> Result<TreeID> {
        let local = pass
            .editor
            .node(key)
            .ok_or_else(|| CollabError::desync(key, "local node missing during creation"))?;
        let kind = local.kind();
        let node_type = local.node_type().to_string();

        let id = binding.tree().create_at(parent_shared, index)?;
        let meta = binding.meta(SharedNodeRef::Node(id))?;
        meta.insert(shared::KIND_KEY, kind.as_str())?;
        meta.insert(shared::TYPE_KEY, node_type.as_str())?;

        let parent = Some(parent.clone());
        let node = match kind {
            NodeKind::Element => CollabNode::Element(CollabElementNode::new(
                key.clone(),
                SharedNodeRef::Node(id),
                parent,
                node_type,
            )),
            NodeKind::Text => {
                let text = meta.insert_container(shared::TEXT_KEY, LoroText::new())?;
                CollabNode::Text(CollabTextNode::new(key.clone(), id, parent, node_type, text))
            }
            NodeKind::Decorator => CollabNode::Decorator(CollabDecoratorNode::new(
                key.clone(),
                id,
                parent,
                node_type,
            )),
            NodeKind::Root => {
                return Err(CollabError::desync(key, "root node cannot be nested"));
            }
        };
        if let CollabNode::Text(text) = &node {
            binding.link_container(text.text_id(), key, ContainerRole::Text);
        }
        binding.register(node)?;
        pass.report.created += 1;
        debug!("Created shared node {:?} for {} ({})", id, key, kind.as_str());

        binding.with_node(key, |node, binding| node.sync_from_local(binding, pass))?;
        Ok(id)
    }

    /// Bind a shared node with no local counterpart: create a detached local
    /// node (and its subtree) from it and register the collab node. The
    /// caller attaches the returned key.
    pub fn create_from_shared(
        binding: &mut Binding,
        pass: &mut SharedPass<'_>,
        id: TreeID,
        parent: &NodeKey,
    ) -> Result<NodeKey> {
        let meta = binding.meta(SharedNodeRef::Node(id))?;
        let kind = shared::kind_of(&meta).ok_or_else(|| {
            CollabError::desync(parent, format!("shared node {id:?} has no variant tag"))
        })?;
        let node_type =
            shared::get_string(&meta, shared::TYPE_KEY).unwrap_or_else(|| kind.as_str().to_string());

        let editor = &mut *pass.editor;
        let (key, node) = match kind {
            NodeKind::Element => {
                let key = editor.create_element(node_type.as_str());
                let node = CollabNode::Element(CollabElementNode::new(
                    key.clone(),
                    SharedNodeRef::Node(id),
                    Some(parent.clone()),
                    node_type,
                ));
                (key, node)
            }
            NodeKind::Text => {
                let text = shared::get_text(&meta, shared::TEXT_KEY)
                    .ok_or_else(|| CollabError::desync(parent, format!("text node {id:?} has no content")))?;
                let key = editor.create_text(text.to_string());
                editor.set_format(&key, shared::format_of(&meta))?;
                let node = CollabNode::Text(CollabTextNode::new(
                    key.clone(),
                    id,
                    Some(parent.clone()),
                    node_type,
                    text,
                ));
                (key, node)
            }
            NodeKind::Decorator => {
                let entries = shared::get_map(&meta, shared::STATE_KEY)
                    .map(|map| shared::read_entries(&map))
                    .unwrap_or_default();
                let key = editor.create_decorator(node_type.as_str(), StateMap::from_entries(entries));
                let node = CollabNode::Decorator(CollabDecoratorNode::new(
                    key.clone(),
                    id,
                    Some(parent.clone()),
                    node_type,
                ));
                (key, node)
            }
            NodeKind::Root => {
                return Err(CollabError::desync(parent, "shared node tagged as root"));
            }
        };
        properties::sync_properties_to_local(&meta, editor, &key)?;

        if let CollabNode::Text(text) = &node {
            binding.link_container(text.text_id(), &key, ContainerRole::Text);
        }
        binding.register(node)?;
        pass.report.created += 1;
        debug!("Created local node {} for shared node {:?}", key, id);

        binding.with_node(&key, |node, binding| match node {
            CollabNode::Element(element) => element.sync_children_from_shared(binding, pass),
            CollabNode::Decorator(decorator) => decorator
                .sync_properties_from_shared(binding, pass.editor, None)
                .map(|_| ()),
            CollabNode::Text(_) => Ok(()),
        })?;
        Ok(key)
    }

    /// Write the content of a retained local node: properties, then
    /// children, text or state depending on the variant.
    pub fn sync_from_local(&mut self, binding: &mut Binding, pass: &mut LocalPass<'_>) -> Result<()> {
        let next = pass
            .editor
            .node(self.key())
            .ok_or_else(|| CollabError::desync(self.key(), "local node missing during sync"))?;
        match self {
            CollabNode::Element(element) => {
                element.sync_properties_from_local(binding, next)?;
                element.sync_children_from_local(binding, pass)
            }
            CollabNode::Text(text) => {
                if text.sync_from_local(binding, next)?.is_some() {
                    pass.report.text_edits += 1;
                }
                Ok(())
            }
            CollabNode::Decorator(decorator) => {
                decorator.sync_properties_from_local(binding, next, &pass.update.prev_nodes)?;
                Ok(())
            }
        }
    }

    /// Refresh the local node from its shared node. `state_keys` limits which
    /// decorator state keys are applied; `None` applies all of them.
    pub fn sync_content_from_shared(
        &mut self,
        binding: &mut Binding,
        editor: &mut EditorState,
        state_keys: Option<&HashSet<String>>,
    ) -> Result<bool> {
        match self {
            CollabNode::Element(element) => element.sync_properties_from_shared(binding, editor),
            CollabNode::Text(text) => text.sync_from_shared(binding, editor),
            CollabNode::Decorator(decorator) => {
                decorator.sync_properties_from_shared(binding, editor, state_keys)
            }
        }
    }
}
