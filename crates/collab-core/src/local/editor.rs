//! EditorState: the local document tree and its edit transactions.
//!
//! Every mutation marks the touched node dirty and all of its ancestors as
//! dirty elements. `update` wraps a batch of mutations into one transaction:
//! it snapshots the node map first, hands the snapshot and the dirty sets to
//! the caller when the batch succeeds, and restores the snapshot when it
//! fails. Nodes left detached at the end of a transaction are dropped.

use super::node::{LocalNode, NodeData, NodeKey, NodeKind, TextFormat};
use super::StateMap;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Snapshot of the node tree, addressable by key.
pub type NodeMap = HashMap<NodeKey, LocalNode>;

const ROOT_KEY: &str = "root";

#[derive(Debug, Error)]
pub enum EditorError {
    #[error("node not found: {0}")]
    NodeNotFound(NodeKey),

    #[error("node {0} cannot hold children")]
    NotAnElement(NodeKey),

    #[error("node {key} is not a {expected} node")]
    WrongKind { key: NodeKey, expected: &'static str },

    #[error("the root node cannot be {0}")]
    RootImmutable(&'static str),

    #[error("inserting {child} under {parent} would create a cycle")]
    Cycle { parent: NodeKey, child: NodeKey },

    #[error("index {index} out of bounds for {key} with {len} children")]
    IndexOutOfBounds { key: NodeKey, index: usize, len: usize },

    #[error("duplicate child {child} under {parent}")]
    DuplicateChild { parent: NodeKey, child: NodeKey },
}

pub type Result<T> = std::result::Result<T, EditorError>;

/// Who produced an editor transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// A local user edit; synchronized to the shared tree.
    Local,
    /// Produced by applying shared-tree changes; never synchronized back.
    Collaboration,
}

/// Result of a successful edit transaction.
#[derive(Debug, Clone)]
pub struct EditorUpdate {
    pub origin: UpdateOrigin,
    /// The node map as it was before the transaction.
    pub prev_nodes: NodeMap,
    pub dirty_elements: HashSet<NodeKey>,
    pub dirty_leaves: HashSet<NodeKey>,
}

impl EditorUpdate {
    pub fn is_dirty(&self, key: &NodeKey) -> bool {
        self.dirty_elements.contains(key) || self.dirty_leaves.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.dirty_elements.is_empty() && self.dirty_leaves.is_empty()
    }
}

/// The local editor document.
#[derive(Debug, Clone)]
pub struct EditorState {
    nodes: NodeMap,
    root: NodeKey,
    next_key: u64,
    dirty_elements: HashSet<NodeKey>,
    dirty_leaves: HashSet<NodeKey>,
}

impl Default for EditorState {
    fn default() -> Self {
        Self::new()
    }
}

impl EditorState {
    /// Create a document holding only an empty root.
    pub fn new() -> Self {
        let root = NodeKey::from(ROOT_KEY);
        let mut nodes = NodeMap::new();
        nodes.insert(
            root.clone(),
            LocalNode {
                key: root.clone(),
                parent: None,
                node_type: "root".to_string(),
                properties: Default::default(),
                data: NodeData::Root {
                    children: Vec::new(),
                },
            },
        );
        Self {
            nodes,
            root,
            next_key: 1,
            dirty_elements: HashSet::new(),
            dirty_leaves: HashSet::new(),
        }
    }

    pub fn root_key(&self) -> &NodeKey {
        &self.root
    }

    pub fn node(&self, key: &NodeKey) -> Option<&LocalNode> {
        self.nodes.get(key)
    }

    /// The live decorator node for `key`, or `None` if absent or not a decorator.
    pub fn decorator(&self, key: &NodeKey) -> Option<&LocalNode> {
        self.nodes
            .get(key)
            .filter(|n| n.kind() == NodeKind::Decorator)
    }

    pub fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn children(&self, key: &NodeKey) -> &[NodeKey] {
        self.nodes.get(key).map(|n| n.children()).unwrap_or(&[])
    }

    /// Whether `key` is reachable from the root.
    pub fn is_attached(&self, key: &NodeKey) -> bool {
        let mut current = key;
        loop {
            if *current == self.root {
                return true;
            }
            match self.nodes.get(current).and_then(|n| n.parent.as_ref()) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    // ========== Transactions ==========

    /// Run a local edit transaction.
    pub fn update<T, E>(
        &mut self,
        f: impl FnOnce(&mut EditorState) -> std::result::Result<T, E>,
    ) -> std::result::Result<(T, EditorUpdate), E> {
        self.update_with_origin(UpdateOrigin::Local, f)
    }

    /// Run an edit transaction tagged with `origin`.
    ///
    /// On error the node tree is restored to its state before the call.
    pub fn update_with_origin<T, E>(
        &mut self,
        origin: UpdateOrigin,
        f: impl FnOnce(&mut EditorState) -> std::result::Result<T, E>,
    ) -> std::result::Result<(T, EditorUpdate), E> {
        let prev_nodes = self.nodes.clone();
        let prev_next_key = self.next_key;
        self.dirty_elements.clear();
        self.dirty_leaves.clear();

        match f(self) {
            Ok(value) => {
                self.collect_garbage();
                let update = EditorUpdate {
                    origin,
                    prev_nodes,
                    dirty_elements: std::mem::take(&mut self.dirty_elements),
                    dirty_leaves: std::mem::take(&mut self.dirty_leaves),
                };
                Ok((value, update))
            }
            Err(e) => {
                self.nodes = prev_nodes;
                self.next_key = prev_next_key;
                self.dirty_elements.clear();
                self.dirty_leaves.clear();
                Err(e)
            }
        }
    }

    /// An update marking every node dirty, with the current nodes as the
    /// previous snapshot. Used to publish a whole document.
    pub fn full_update(&self) -> EditorUpdate {
        let mut dirty_elements = HashSet::new();
        let mut dirty_leaves = HashSet::new();
        for (key, node) in &self.nodes {
            if node.kind().is_element() {
                dirty_elements.insert(key.clone());
            } else {
                dirty_leaves.insert(key.clone());
            }
        }
        EditorUpdate {
            origin: UpdateOrigin::Local,
            prev_nodes: self.nodes.clone(),
            dirty_elements,
            dirty_leaves,
        }
    }

    /// Drop every node that is no longer reachable from the root.
    fn collect_garbage(&mut self) {
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::from([self.root.clone()]);
        while let Some(key) = queue.pop_front() {
            if let Some(node) = self.nodes.get(&key) {
                queue.extend(node.children().iter().cloned());
            }
            reachable.insert(key);
        }
        self.nodes.retain(|key, _| reachable.contains(key));
        self.dirty_elements.retain(|key| reachable.contains(key));
        self.dirty_leaves.retain(|key| reachable.contains(key));
    }

    // ========== Mutations ==========

    /// Create a detached node. It is dropped at the end of the transaction
    /// unless it gets attached.
    pub fn create_node(&mut self, node_type: impl Into<String>, data: NodeData) -> NodeKey {
        let key = NodeKey::new(self.next_key.to_string());
        self.next_key += 1;
        self.nodes.insert(
            key.clone(),
            LocalNode {
                key: key.clone(),
                parent: None,
                node_type: node_type.into(),
                properties: Default::default(),
                data,
            },
        );
        self.mark_dirty(&key);
        key
    }

    pub fn create_element(&mut self, node_type: impl Into<String>) -> NodeKey {
        self.create_node(node_type, NodeData::element())
    }

    pub fn create_text(&mut self, text: impl Into<String>) -> NodeKey {
        self.create_node("text", NodeData::text(text))
    }

    pub fn create_decorator(&mut self, node_type: impl Into<String>, state: StateMap) -> NodeKey {
        self.create_node(node_type, NodeData::decorator(state))
    }

    pub fn append(&mut self, parent: &NodeKey, child: &NodeKey) -> Result<()> {
        let len = self.element(parent)?.children().len();
        let already_here = self.children(parent).contains(child);
        self.insert_child(parent, if already_here { len - 1 } else { len }, child)
    }

    /// Insert `child` at `index` among `parent`'s children, detaching it from
    /// its current parent first.
    pub fn insert_child(&mut self, parent: &NodeKey, index: usize, child: &NodeKey) -> Result<()> {
        self.element(parent)?;
        self.get(child)?;
        if *child == self.root {
            return Err(EditorError::RootImmutable("moved"));
        }
        if self.is_ancestor_or_self(child, parent) {
            return Err(EditorError::Cycle {
                parent: parent.clone(),
                child: child.clone(),
            });
        }

        self.detach(child);
        let children = self.children_mut(parent)?;
        if index > children.len() {
            let len = children.len();
            return Err(EditorError::IndexOutOfBounds {
                key: parent.clone(),
                index,
                len,
            });
        }
        children.insert(index, child.clone());
        self.get_mut(child)?.parent = Some(parent.clone());
        self.mark_dirty(child);
        Ok(())
    }

    /// Replace `parent`'s children with exactly `keys`, in order.
    ///
    /// Keys currently attached elsewhere are moved here; previous children
    /// missing from `keys` are detached.
    pub fn set_children(&mut self, parent: &NodeKey, keys: &[NodeKey]) -> Result<()> {
        self.element(parent)?;
        let mut seen = HashSet::new();
        for key in keys {
            self.get(key)?;
            if !seen.insert(key) {
                return Err(EditorError::DuplicateChild {
                    parent: parent.clone(),
                    child: key.clone(),
                });
            }
            if self.is_ancestor_or_self(key, parent) {
                return Err(EditorError::Cycle {
                    parent: parent.clone(),
                    child: key.clone(),
                });
            }
        }
        if self.children(parent) == keys {
            return Ok(());
        }

        let old: Vec<NodeKey> = self.children(parent).to_vec();
        for key in &old {
            if let Some(node) = self.nodes.get_mut(key) {
                node.parent = None;
            }
        }
        for key in keys {
            if !old.contains(key) {
                self.detach(key);
            }
        }
        *self.children_mut(parent)? = keys.to_vec();
        for key in keys {
            self.get_mut(key)?.parent = Some(parent.clone());
        }
        self.mark_dirty(parent);
        Ok(())
    }

    /// Remove `key` and its whole subtree from the document.
    pub fn remove(&mut self, key: &NodeKey) -> Result<Vec<NodeKey>> {
        if *key == self.root {
            return Err(EditorError::RootImmutable("removed"));
        }
        self.get(key)?;
        self.detach(key);

        let mut removed = Vec::new();
        let mut queue = VecDeque::from([key.clone()]);
        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.nodes.remove(&current) {
                queue.extend(node.children().iter().cloned());
                self.dirty_elements.remove(&current);
                self.dirty_leaves.remove(&current);
                removed.push(current);
            }
        }
        Ok(removed)
    }

    pub fn set_text(&mut self, key: &NodeKey, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        match &mut self.get_mut(key)?.data {
            NodeData::Text { text, .. } => {
                if *text == value {
                    return Ok(());
                }
                *text = value;
            }
            _ => return Err(wrong_kind(key, "text")),
        }
        self.mark_dirty(key);
        Ok(())
    }

    pub fn set_format(&mut self, key: &NodeKey, value: TextFormat) -> Result<()> {
        match &mut self.get_mut(key)?.data {
            NodeData::Text { format, .. } => {
                if *format == value {
                    return Ok(());
                }
                *format = value;
            }
            _ => return Err(wrong_kind(key, "text")),
        }
        self.mark_dirty(key);
        Ok(())
    }

    /// Replace a decorator's state map with another map (a new identity).
    pub fn set_state_map(&mut self, key: &NodeKey, value: StateMap) -> Result<()> {
        match &mut self.get_mut(key)?.data {
            NodeData::Decorator { state } => *state = value,
            _ => return Err(wrong_kind(key, "decorator")),
        }
        self.mark_dirty(key);
        Ok(())
    }

    pub fn set_property(&mut self, key: &NodeKey, name: impl Into<String>, value: Value) -> Result<()> {
        let name = name.into();
        let node = self.get_mut(key)?;
        if node.properties.get(&name) == Some(&value) {
            return Ok(());
        }
        node.properties.insert(name, value);
        self.mark_dirty(key);
        Ok(())
    }

    pub fn remove_property(&mut self, key: &NodeKey, name: &str) -> Result<()> {
        if self.get_mut(key)?.properties.remove(name).is_some() {
            self.mark_dirty(key);
        }
        Ok(())
    }

    /// Mark `key` dirty and every ancestor as a dirty element.
    pub fn mark_dirty(&mut self, key: &NodeKey) {
        let Some(node) = self.nodes.get(key) else {
            return;
        };
        if node.kind().is_element() {
            self.dirty_elements.insert(key.clone());
        } else {
            self.dirty_leaves.insert(key.clone());
        }
        let mut parent = node.parent.clone();
        while let Some(current) = parent {
            parent = self.nodes.get(&current).and_then(|n| n.parent.clone());
            self.dirty_elements.insert(current);
        }
    }

    // ========== Queries ==========

    /// Concatenated text of a subtree.
    pub fn text_content(&self, key: &NodeKey) -> String {
        let mut out = String::new();
        self.collect_text(key, &mut out);
        out
    }

    fn collect_text(&self, key: &NodeKey, out: &mut String) {
        if let Some(node) = self.nodes.get(key) {
            if let Some(text) = node.text() {
                out.push_str(text);
            }
            for child in node.children() {
                self.collect_text(child, out);
            }
        }
    }

    /// Key-independent JSON outline of a subtree, for comparing documents
    /// across peers.
    pub fn outline(&self, key: &NodeKey) -> Value {
        let Some(node) = self.nodes.get(key) else {
            return Value::Null;
        };
        let mut out = json!({
            "type": node.node_type,
            "kind": node.kind().as_str(),
        });
        if !node.properties.is_empty() {
            out["properties"] = json!(node.properties);
        }
        match &node.data {
            NodeData::Root { children } | NodeData::Element { children } => {
                out["children"] = Value::Array(children.iter().map(|c| self.outline(c)).collect());
            }
            NodeData::Text { text, format } => {
                out["text"] = json!(text);
                out["format"] = json!(format.bits());
            }
            NodeData::Decorator { state } => {
                out["state"] = json!(state.entries());
            }
        }
        out
    }

    // ========== Internals ==========

    fn get(&self, key: &NodeKey) -> Result<&LocalNode> {
        self.nodes
            .get(key)
            .ok_or_else(|| EditorError::NodeNotFound(key.clone()))
    }

    fn get_mut(&mut self, key: &NodeKey) -> Result<&mut LocalNode> {
        self.nodes
            .get_mut(key)
            .ok_or_else(|| EditorError::NodeNotFound(key.clone()))
    }

    fn element(&self, key: &NodeKey) -> Result<&LocalNode> {
        let node = self.get(key)?;
        if node.kind().is_element() {
            Ok(node)
        } else {
            Err(EditorError::NotAnElement(key.clone()))
        }
    }

    fn children_mut(&mut self, key: &NodeKey) -> Result<&mut Vec<NodeKey>> {
        self.get_mut(key)?
            .children_mut()
            .ok_or_else(|| EditorError::NotAnElement(key.clone()))
    }

    /// Whether `ancestor` is `key` or one of its ancestors.
    fn is_ancestor_or_self(&self, ancestor: &NodeKey, key: &NodeKey) -> bool {
        let mut current = Some(key);
        while let Some(k) = current {
            if k == ancestor {
                return true;
            }
            current = self.nodes.get(k).and_then(|n| n.parent.as_ref());
        }
        false
    }

    fn detach(&mut self, key: &NodeKey) {
        let Some(parent) = self.nodes.get(key).and_then(|n| n.parent.clone()) else {
            return;
        };
        if let Some(children) = self.nodes.get_mut(&parent).and_then(|n| n.children_mut()) {
            children.retain(|c| c != key);
        }
        if let Some(node) = self.nodes.get_mut(key) {
            node.parent = None;
        }
        self.mark_dirty(&parent);
    }
}

fn wrong_kind(key: &NodeKey, expected: &'static str) -> EditorError {
    EditorError::WrongKind {
        key: key.clone(),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraph_with(editor: &mut EditorState, text: &str) -> (NodeKey, NodeKey) {
        let root = editor.root_key().clone();
        let p = editor.create_element("paragraph");
        let t = editor.create_text(text);
        editor.append(&p, &t).unwrap();
        editor.append(&root, &p).unwrap();
        (p, t)
    }

    #[test]
    fn test_update_reports_dirty_nodes_and_ancestors() {
        let mut editor = EditorState::new();
        let ((p, t), _) = editor
            .update(|s| Ok::<_, EditorError>(paragraph_with(s, "Hello")))
            .unwrap();

        let (_, update) = editor.update(|s| s.set_text(&t, "Hello World")).unwrap();

        assert!(update.dirty_leaves.contains(&t));
        assert!(update.dirty_elements.contains(&p));
        assert!(update.dirty_elements.contains(editor.root_key()));
        assert_eq!(update.prev_nodes[&t].text(), Some("Hello"));
        assert_eq!(editor.text_content(editor.root_key()), "Hello World");
    }

    #[test]
    fn test_failed_update_rolls_back() {
        let mut editor = EditorState::new();
        let ((_, t), _) = editor
            .update(|s| Ok::<_, EditorError>(paragraph_with(s, "Hello")))
            .unwrap();

        let result = editor.update(|s| {
            s.set_text(&t, "changed")?;
            s.remove(&NodeKey::from("missing")).map(|_| ())
        });

        assert!(matches!(result, Err(EditorError::NodeNotFound(_))));
        assert_eq!(editor.node(&t).unwrap().text(), Some("Hello"));
    }

    #[test]
    fn test_detached_nodes_are_collected() {
        let mut editor = EditorState::new();
        let (orphan, _) = editor
            .update(|s| Ok::<_, EditorError>(s.create_text("orphan")))
            .unwrap();
        assert!(!editor.contains(&orphan));
    }

    #[test]
    fn test_insert_rejects_cycles() {
        let mut editor = EditorState::new();
        let ((p, _), _) = editor
            .update(|s| Ok::<_, EditorError>(paragraph_with(s, "x")))
            .unwrap();
        let result = editor.update(|s| {
            let inner = s.create_element("quote");
            s.append(&p, &inner)?;
            s.append(&inner, &p)
        });
        assert!(matches!(result, Err(EditorError::Cycle { .. })));
    }

    #[test]
    fn test_set_children_moves_between_parents() {
        let mut editor = EditorState::new();
        let (((p1, t1), (p2, t2)), _) = editor
            .update(|s| {
                let a = paragraph_with(s, "a");
                let b = paragraph_with(s, "b");
                Ok::<_, EditorError>((a, b))
            })
            .unwrap();

        editor
            .update(|s| s.set_children(&p2, &[t1.clone(), t2.clone()]))
            .unwrap();

        assert!(editor.children(&p1).is_empty());
        assert_eq!(editor.children(&p2), &[t1.clone(), t2]);
        assert_eq!(editor.node(&t1).unwrap().parent(), Some(&p2));
    }

    #[test]
    fn test_remove_drops_subtree() {
        let mut editor = EditorState::new();
        let ((p, t), _) = editor
            .update(|s| Ok::<_, EditorError>(paragraph_with(s, "gone")))
            .unwrap();
        let (removed, update) = editor.update(|s| s.remove(&p)).unwrap();

        assert_eq!(removed.len(), 2);
        assert!(!editor.contains(&t));
        assert!(update.dirty_elements.contains(editor.root_key()));
    }
}
