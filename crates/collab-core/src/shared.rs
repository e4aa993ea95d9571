//! Shared tree adapter over Loro.
//!
//! Every synchronized node is a `LoroTree` node. Its meta map carries the
//! node variant and type plus the generic properties:
//! - `__kind`: `"element"`, `"text"` or `"decorator"`
//! - `__type`: node type tag
//! - `__text`: `LoroText` content of a text node
//! - `__format`: text format bitmask
//! - `__state`: `LoroMap` holding a decorator's state
//!
//! The local root maps to the tree's virtual root, whose properties live in a
//! separate document-level map.

use crate::error::{CollabError, Result};
use crate::local::{NodeKind, Properties, TextFormat};
use loro::{Container, LoroMap, LoroText, LoroTree, LoroValue, TreeID, TreeParentId, ValueOrContainer};

pub const KIND_KEY: &str = "__kind";
pub const TYPE_KEY: &str = "__type";
pub const TEXT_KEY: &str = "__text";
pub const FORMAT_KEY: &str = "__format";
pub const STATE_KEY: &str = "__state";

/// Reserved meta keys start with this prefix; everything else is a property.
const RESERVED_PREFIX: &str = "__";

/// Name of the document-level map holding the root's properties. Loro
/// rejects `/` and NUL in root container names.
pub(crate) fn root_meta_name(tree_name: &str) -> String {
    format!("{tree_name}_root")
}

/// Whether `name` can name a root container.
pub(crate) fn is_valid_root_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\0'])
}

pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

/// A shared node owned by a collab node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedNodeRef {
    /// The tree's virtual root.
    Root,
    Node(TreeID),
}

impl SharedNodeRef {
    pub fn tree_id(&self) -> Option<TreeID> {
        match self {
            SharedNodeRef::Root => None,
            SharedNodeRef::Node(id) => Some(*id),
        }
    }
}

impl From<SharedNodeRef> for TreeParentId {
    fn from(node: SharedNodeRef) -> Self {
        match node {
            SharedNodeRef::Root => TreeParentId::Root,
            SharedNodeRef::Node(id) => TreeParentId::Node(id),
        }
    }
}

// ========== Tree helpers ==========

/// Live children of `parent`, in shared order.
pub fn children(tree: &LoroTree, parent: SharedNodeRef) -> Vec<TreeID> {
    match parent {
        SharedNodeRef::Root => tree.roots(),
        SharedNodeRef::Node(id) => tree.children(id).unwrap_or_default(),
    }
}

/// Whether `id` exists and has not been deleted.
pub fn is_alive(tree: &LoroTree, id: TreeID) -> bool {
    !tree.is_node_deleted(&id).unwrap_or(true)
}

/// Parent of a live node. `None` for deleted or unknown nodes.
pub fn parent_of(tree: &LoroTree, id: TreeID) -> Option<SharedNodeRef> {
    match tree.parent(id) {
        Some(TreeParentId::Root) => Some(SharedNodeRef::Root),
        Some(TreeParentId::Node(parent)) => Some(SharedNodeRef::Node(parent)),
        _ => None,
    }
}

// ========== Meta access ==========

pub fn get_string(meta: &LoroMap, key: &str) -> Option<String> {
    meta.get(key).and_then(|v| {
        if let ValueOrContainer::Value(val) = v {
            val.as_string().map(|s| s.to_string())
        } else {
            None
        }
    })
}

pub fn get_i64(meta: &LoroMap, key: &str) -> Option<i64> {
    meta.get(key).and_then(|v| match v {
        ValueOrContainer::Value(LoroValue::I64(n)) => Some(n),
        ValueOrContainer::Value(LoroValue::Double(n)) => Some(n as i64),
        _ => None,
    })
}

pub fn get_text(meta: &LoroMap, key: &str) -> Option<LoroText> {
    match meta.get(key) {
        Some(ValueOrContainer::Container(Container::Text(text))) => Some(text),
        _ => None,
    }
}

pub fn get_map(meta: &LoroMap, key: &str) -> Option<LoroMap> {
    match meta.get(key) {
        Some(ValueOrContainer::Container(Container::Map(map))) => Some(map),
        _ => None,
    }
}

/// Variant tag recorded on a shared node.
pub fn kind_of(meta: &LoroMap) -> Option<NodeKind> {
    get_string(meta, KIND_KEY).and_then(|s| NodeKind::parse(&s))
}

pub fn format_of(meta: &LoroMap) -> TextFormat {
    get_i64(meta, FORMAT_KEY)
        .map(|bits| TextFormat::from_bits_retain(bits as u32))
        .unwrap_or_default()
}

/// Generic properties stored on a meta map. Reserved keys are skipped.
pub fn read_properties(meta: &LoroMap) -> Properties {
    let mut props = Properties::new();
    if let LoroValue::Map(map) = meta.get_value() {
        for (key, value) in map.iter() {
            if is_reserved_key(key) {
                continue;
            }
            if let Ok(json) = loro_value_to_json(value) {
                props.insert(key.clone(), json);
            }
        }
    }
    props
}

/// Entries of a decorator's shared state map.
pub fn read_entries(map: &LoroMap) -> Properties {
    let mut entries = Properties::new();
    if let LoroValue::Map(value) = map.get_deep_value() {
        for (key, value) in value.iter() {
            if let Ok(json) = loro_value_to_json(value) {
                entries.insert(key.clone(), json);
            }
        }
    }
    entries
}

/// Read a single state entry, converted to JSON.
pub fn read_entry(map: &LoroMap, key: &str) -> Option<serde_json::Value> {
    match map.get(key)? {
        ValueOrContainer::Value(value) => loro_value_to_json(&value).ok(),
        ValueOrContainer::Container(_) => None,
    }
}

pub fn write_entry(map: &LoroMap, key: &str, value: serde_json::Value) -> Result<()> {
    map.insert(key, value)?;
    Ok(())
}

pub fn delete_entry(map: &LoroMap, key: &str) -> Result<()> {
    map.delete(key)?;
    Ok(())
}

/// Convert a Loro value to JSON. Containers become `null`.
pub fn loro_value_to_json(value: &LoroValue) -> std::result::Result<serde_json::Value, CollabError> {
    match value {
        LoroValue::Null => Ok(serde_json::Value::Null),
        LoroValue::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        LoroValue::I64(n) => Ok(serde_json::json!(*n)),
        LoroValue::Double(n) => Ok(serde_json::json!(*n)),
        LoroValue::String(s) => Ok(serde_json::Value::String(s.to_string())),
        LoroValue::List(arr) => {
            let items: std::result::Result<Vec<_>, _> = arr.iter().map(loro_value_to_json).collect();
            Ok(serde_json::Value::Array(items?))
        }
        LoroValue::Map(map) => {
            let obj: std::result::Result<serde_json::Map<String, serde_json::Value>, _> = map
                .iter()
                .map(|(k, v)| Ok::<_, CollabError>((k.to_string(), loro_value_to_json(v)?)))
                .collect();
            Ok(serde_json::Value::Object(obj?))
        }
        LoroValue::Binary(_) => Err(CollabError::Serialization(
            "binary values are not representable as JSON".into(),
        )),
        _ => Ok(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loro::LoroDoc;
    use serde_json::json;

    #[test]
    fn test_properties_skip_reserved_keys() {
        let doc = LoroDoc::new();
        let meta = doc.get_map("meta");
        meta.insert(KIND_KEY, "element").unwrap();
        meta.insert(TYPE_KEY, "heading").unwrap();
        meta.insert("tag", "h2").unwrap();
        meta.insert("indent", json!(2)).unwrap();

        let props = read_properties(&meta);
        assert_eq!(props.len(), 2);
        assert_eq!(props["tag"], json!("h2"));
        assert_eq!(props["indent"], json!(2));
        assert_eq!(kind_of(&meta), Some(NodeKind::Element));
    }

    #[test]
    fn test_nested_json_roundtrip() {
        let doc = LoroDoc::new();
        let map = doc.get_map("state");
        let value = json!({"src": "cat.png", "size": [640, 480], "alt": null});
        write_entry(&map, "image", value.clone()).unwrap();
        assert_eq!(read_entry(&map, "image"), Some(value));
    }

    #[test]
    fn test_format_defaults_to_empty() {
        let doc = LoroDoc::new();
        let meta = doc.get_map("meta");
        assert_eq!(format_of(&meta), TextFormat::empty());
        meta.insert(FORMAT_KEY, 3i64).unwrap();
        assert_eq!(format_of(&meta), TextFormat::BOLD | TextFormat::ITALIC);
    }

    #[test]
    fn test_root_properties_survive_import() {
        let name = root_meta_name("root");
        assert!(is_valid_root_name(&name));

        let a = LoroDoc::new();
        a.set_peer_id(1).unwrap();
        a.get_map(name.as_str()).insert("direction", "ltr").unwrap();
        a.commit();
        let update = a.export(loro::ExportMode::Snapshot).unwrap();

        let b = LoroDoc::new();
        b.import(&update).unwrap();
        let props = read_properties(&b.get_map(name.as_str()));
        assert_eq!(props.get("direction"), Some(&json!("ltr")));
    }

    #[test]
    fn test_invalid_root_names() {
        assert!(!is_valid_root_name(""));
        assert!(!is_valid_root_name("doc/tree"));
        assert!(is_valid_root_name("doc-tree"));
    }

    #[test]
    fn test_children_follow_shared_order() {
        let doc = LoroDoc::new();
        let tree = doc.get_tree("root");
        tree.enable_fractional_index(0);
        let a = tree.create_at(TreeParentId::Root, 0).unwrap();
        let b = tree.create_at(TreeParentId::Root, 0).unwrap();
        assert_eq!(children(&tree, SharedNodeRef::Root), vec![b, a]);

        tree.delete(b).unwrap();
        assert!(!is_alive(&tree, b));
        assert_eq!(children(&tree, SharedNodeRef::Root), vec![a]);
        assert_eq!(parent_of(&tree, a), Some(SharedNodeRef::Root));
    }
}
