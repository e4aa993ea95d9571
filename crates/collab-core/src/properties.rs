//! Generic property synchronization between local nodes and meta maps.
//!
//! Both directions diff against the current value on the receiving side, so
//! running a sync twice writes nothing the second time.

use crate::error::{CollabError, Result};
use crate::local::{EditorState, NodeKey, Properties};
use crate::shared;
use loro::LoroMap;
use tracing::debug;

/// Write `next` into `meta`. Returns the number of keys written or deleted.
pub fn sync_properties_to_shared(meta: &LoroMap, next: &Properties) -> Result<usize> {
    let current = shared::read_properties(meta);
    let mut changed = 0;

    for key in current.keys() {
        if !next.contains_key(key) {
            meta.delete(key)?;
            changed += 1;
        }
    }

    for (key, value) in next {
        if shared::is_reserved_key(key) {
            debug!("Skipping reserved property key {}", key);
            continue;
        }
        if current.get(key) != Some(value) {
            meta.insert(key, value.clone())?;
            changed += 1;
        }
    }

    Ok(changed)
}

/// Mirror the properties stored in `meta` onto local node `key`. Returns
/// whether anything changed.
pub fn sync_properties_to_local(meta: &LoroMap, editor: &mut EditorState, key: &NodeKey) -> Result<bool> {
    let incoming = shared::read_properties(meta);
    let local = editor
        .node(key)
        .ok_or_else(|| CollabError::desync(key, "local node missing during property sync"))?
        .properties()
        .clone();

    let mut changed = false;
    for name in local.keys() {
        if !incoming.contains_key(name) {
            editor.remove_property(key, name)?;
            changed = true;
        }
    }
    for (name, value) in incoming {
        if local.get(&name) != Some(&value) {
            editor.set_property(key, name, value)?;
            changed = true;
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::EditorError;
    use loro::LoroDoc;
    use serde_json::json;

    #[test]
    fn test_sync_to_shared_is_idempotent() {
        let doc = LoroDoc::new();
        let meta = doc.get_map("meta");
        let mut props = Properties::new();
        props.insert("tag".into(), json!("h1"));
        props.insert("indent".into(), json!(1));

        assert_eq!(sync_properties_to_shared(&meta, &props).unwrap(), 2);
        assert_eq!(sync_properties_to_shared(&meta, &props).unwrap(), 0);

        props.remove("indent");
        assert_eq!(sync_properties_to_shared(&meta, &props).unwrap(), 1);
        assert_eq!(shared::read_properties(&meta), props);
    }

    #[test]
    fn test_sync_to_local_mirrors_removals() {
        let doc = LoroDoc::new();
        let meta = doc.get_map("meta");
        meta.insert("tag", "h2").unwrap();

        let mut editor = EditorState::new();
        let (key, _) = editor
            .update(|s| {
                let root = s.root_key().clone();
                let key = s.create_element("heading");
                s.set_property(&key, "stale", json!(true))?;
                s.append(&root, &key)?;
                Ok::<_, EditorError>(key)
            })
            .unwrap();

        let (changed, _) = editor
            .update(|s| sync_properties_to_local(&meta, s, &key))
            .unwrap();
        assert!(changed);
        let props = editor.node(&key).unwrap().properties();
        assert_eq!(props.get("tag"), Some(&json!("h2")));
        assert!(!props.contains_key("stale"));
    }
}
