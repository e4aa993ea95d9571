//! Text collab node.

use crate::binding::{Binding, ContainerRole};
use crate::diff::{self, TextSplice};
use crate::error::{CollabError, Result};
use crate::local::{EditorState, LocalNode, NodeKey};
use crate::properties;
use crate::shared::{self, SharedNodeRef};
use loro::{ContainerID, ContainerTrait, LoroText, TreeID};
use tracing::debug;

#[derive(Debug)]
pub struct CollabTextNode {
    key: NodeKey,
    id: TreeID,
    pub(super) parent: Option<NodeKey>,
    node_type: String,
    text: LoroText,
}

impl CollabTextNode {
    pub fn new(key: NodeKey, id: TreeID, parent: Option<NodeKey>, node_type: String, text: LoroText) -> Self {
        Self {
            key,
            id,
            parent,
            node_type,
            text,
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

    pub fn text_id(&self) -> ContainerID {
        self.text.id()
    }

    /// Current shared content.
    pub fn content(&self) -> String {
        self.text.to_string()
    }

    /// Write the local node into the shared node: properties, then a single
    /// splice for the changed middle of the text, then the format if it
    /// differs. Returns the splice issued, if any.
    pub fn sync_from_local(&self, binding: &Binding, next: &LocalNode) -> Result<Option<TextSplice>> {
        let next_text = next
            .text()
            .ok_or_else(|| CollabError::desync(&self.key, "collab text bound to a non-text node"))?;
        let meta = binding.meta(self.shared())?;
        properties::sync_properties_to_shared(&meta, next.properties())?;

        let splice = diff::text_splice(&self.text.to_string(), next_text);
        if let Some(splice) = &splice {
            debug!(
                "Splicing {} at {}: -{} +{:?}",
                self.key, splice.offset, splice.delete, splice.insert
            );
            self.text.splice(splice.offset, splice.delete, &splice.insert)?;
        }

        let format = next.format().unwrap_or_default();
        if shared::format_of(&meta) != format {
            meta.insert(shared::FORMAT_KEY, format.bits() as i64)?;
        }
        Ok(splice)
    }

    /// Adopt the merged shared text, format and properties. Only what differs
    /// is written to the local node.
    pub fn sync_from_shared(&mut self, binding: &mut Binding, editor: &mut EditorState) -> Result<bool> {
        let meta = binding.meta(self.shared())?;
        if let Some(text) = shared::get_text(&meta, shared::TEXT_KEY) {
            if text.id() != self.text.id() {
                binding.unlink_container(&self.text.id());
                binding.link_container(text.id(), &self.key, ContainerRole::Text);
                self.text = text;
            }
        }

        let mut changed = properties::sync_properties_to_local(&meta, editor, &self.key)?;
        let local = editor
            .node(&self.key)
            .ok_or_else(|| CollabError::desync(&self.key, "local text node missing"))?;
        let content = self.text.to_string();
        let format = shared::format_of(&meta);
        let text_differs = local.text() != Some(content.as_str());
        let format_differs = local.format() != Some(format);

        if text_differs {
            editor.set_text(&self.key, content)?;
            changed = true;
        }
        if format_differs {
            editor.set_format(&self.key, format)?;
            changed = true;
        }
        Ok(changed)
    }
}
