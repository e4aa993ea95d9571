//! Local document nodes.

use super::StateMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Locally-unique node key. Stable for the node's lifetime, meaningless to
/// other peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

bitflags::bitflags! {
    /// Formatting flags of a text node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextFormat: u32 {
        const BOLD = 1;
        const ITALIC = 1 << 1;
        const STRIKETHROUGH = 1 << 2;
        const UNDERLINE = 1 << 3;
        const CODE = 1 << 4;
        const LINK = 1 << 5;
        const HASHTAG = 1 << 6;
        const OVERFLOWED = 1 << 7;
    }
}

/// Configuration attributes of a node, synchronized key by key.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// The variant tag of a node, also written into the shared tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Root,
    Element,
    Text,
    Decorator,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Element => "element",
            NodeKind::Text => "text",
            NodeKind::Decorator => "decorator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "root" => Some(NodeKind::Root),
            "element" => Some(NodeKind::Element),
            "text" => Some(NodeKind::Text),
            "decorator" => Some(NodeKind::Decorator),
            _ => None,
        }
    }

    /// Root and element nodes hold children.
    pub fn is_element(&self) -> bool {
        matches!(self, NodeKind::Root | NodeKind::Element)
    }
}

/// Variant payload of a local node.
#[derive(Debug, Clone)]
pub enum NodeData {
    Root { children: Vec<NodeKey> },
    Element { children: Vec<NodeKey> },
    Text { text: String, format: TextFormat },
    Decorator { state: StateMap },
}

impl NodeData {
    pub fn element() -> Self {
        NodeData::Element {
            children: Vec::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        NodeData::Text {
            text: text.into(),
            format: TextFormat::empty(),
        }
    }

    pub fn decorator(state: StateMap) -> Self {
        NodeData::Decorator { state }
    }
}

/// A node of the local editor tree.
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub(crate) key: NodeKey,
    pub(crate) parent: Option<NodeKey>,
    pub(crate) node_type: String,
    pub(crate) properties: Properties,
    pub(crate) data: NodeData,
}

impl LocalNode {
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn parent(&self) -> Option<&NodeKey> {
        self.parent.as_ref()
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn data(&self) -> &NodeData {
        &self.data
    }

    pub fn kind(&self) -> NodeKind {
        match self.data {
            NodeData::Root { .. } => NodeKind::Root,
            NodeData::Element { .. } => NodeKind::Element,
            NodeData::Text { .. } => NodeKind::Text,
            NodeData::Decorator { .. } => NodeKind::Decorator,
        }
    }

    /// Ordered child keys; empty for leaves.
    pub fn children(&self) -> &[NodeKey] {
        match &self.data {
            NodeData::Root { children } | NodeData::Element { children } => children,
            _ => &[],
        }
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut Vec<NodeKey>> {
        match &mut self.data {
            NodeData::Root { children } | NodeData::Element { children } => Some(children),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.data {
            NodeData::Text { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn format(&self) -> Option<TextFormat> {
        match &self.data {
            NodeData::Text { format, .. } => Some(*format),
            _ => None,
        }
    }

    pub fn state(&self) -> Option<&StateMap> {
        match &self.data {
            NodeData::Decorator { state } => Some(state),
            _ => None,
        }
    }
}
