//! Synchronizer passes between the local tree and the shared tree.
//!
//! Local to shared runs once per local edit transaction, inside the
//! `local_write` suppression window, and ends with a commit. Shared to local
//! runs once per import as a single editor transaction tagged
//! `Collaboration`, so a failure rolls the local tree back as a whole. Both
//! passes settle structure before content.

use crate::binding::Binding;
use crate::bridge::ChangeSet;
use crate::collab::CollabNode;
use crate::error::{CollabError, Result};
use crate::events::CollabEvent;
use crate::local::{EditorState, EditorUpdate, NodeKey, UpdateOrigin};
use crate::shared::{self, SharedNodeRef};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

/// What a local-to-shared pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocalSyncReport {
    pub created: usize,
    pub destroyed: usize,
    pub text_edits: usize,
}

impl LocalSyncReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// What a shared-to-local pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteApplyReport {
    pub created: usize,
    pub removed: usize,
    pub updated: usize,
}

impl RemoteApplyReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// State threaded through a local-to-shared pass.
pub struct LocalPass<'a> {
    pub editor: &'a EditorState,
    pub update: &'a EditorUpdate,
    pub report: LocalSyncReport,
}

impl<'a> LocalPass<'a> {
    pub fn new(editor: &'a EditorState, update: &'a EditorUpdate) -> Self {
        Self {
            editor,
            update,
            report: LocalSyncReport::default(),
        }
    }
}

/// State threaded through a shared-to-local pass.
pub struct SharedPass<'a> {
    pub editor: &'a mut EditorState,
    pub report: RemoteApplyReport,
}

impl<'a> SharedPass<'a> {
    pub fn new(editor: &'a mut EditorState) -> Self {
        Self {
            editor,
            report: RemoteApplyReport::default(),
        }
    }
}

/// Write a local transaction into the shared tree and commit it.
///
/// Transactions produced by applying shared changes are skipped.
pub fn sync_local_to_shared(
    binding: &mut Binding,
    editor: &EditorState,
    update: &EditorUpdate,
) -> Result<LocalSyncReport> {
    if update.origin == UpdateOrigin::Collaboration || update.is_empty() {
        return Ok(LocalSyncReport::default());
    }

    let _guard = binding.suppression().local_write();
    let result = write_local(binding, editor, update);
    // Commit even on failure so nothing written here is observed later.
    binding.commit();

    match result {
        Ok(report) => {
            debug!(
                "Local sync: {} created, {} destroyed, {} text edits",
                report.created, report.destroyed, report.text_edits
            );
            if !report.is_empty() {
                binding.emit(CollabEvent::LocalSynced {
                    created: report.created,
                    destroyed: report.destroyed,
                    text_edits: report.text_edits,
                });
            }
            Ok(report)
        }
        Err(e) => {
            if e.is_fatal() {
                binding.report_error(&e);
            }
            Err(e)
        }
    }
}

fn write_local(binding: &mut Binding, editor: &EditorState, update: &EditorUpdate) -> Result<LocalSyncReport> {
    let mut pass = LocalPass::new(editor, update);
    let root = binding.root_key().clone();
    if update.is_dirty(&root) {
        binding.with_node(&root, |node, binding| node.sync_from_local(binding, &mut pass))?;
    }
    binding.flush_deletes()?;
    Ok(pass.report)
}

/// Apply routed shared changes to the local tree.
pub fn sync_shared_to_local(
    binding: &mut Binding,
    editor: &mut EditorState,
    changes: &ChangeSet,
) -> Result<RemoteApplyReport> {
    if changes.is_empty() {
        return Ok(RemoteApplyReport::default());
    }

    let _guard = binding.suppression().applying_shared();
    let result = editor.update_with_origin(UpdateOrigin::Collaboration, |state| {
        let mut pass = SharedPass::new(state);
        apply_changes(binding, &mut pass, changes)?;
        Ok::<_, CollabError>(pass.report)
    });

    let mut report = match result {
        Ok((report, _)) => report,
        Err(e) => {
            // The editor rolled back; drop collab nodes created for it.
            binding.prune_orphans(editor);
            if e.is_fatal() {
                binding.report_error(&e);
            }
            return Err(e);
        }
    };
    report.removed += binding.prune_orphans(editor);

    debug!(
        "Remote apply: {} created, {} removed, {} updated",
        report.created, report.removed, report.updated
    );
    if !report.is_empty() {
        binding.emit(CollabEvent::RemoteApplied {
            created: report.created,
            removed: report.removed,
            updated: report.updated,
        });
    }
    Ok(report)
}

fn apply_changes(binding: &mut Binding, pass: &mut SharedPass<'_>, changes: &ChangeSet) -> Result<()> {
    // Structure first, parents before their descendants.
    let mut parents: Vec<NodeKey> = changes
        .children
        .iter()
        .filter(|key| pass.editor.contains(key))
        .cloned()
        .collect();
    parents.sort_by_cached_key(|key| (depth(pass.editor, key), key.clone()));

    for parent in &parents {
        if !binding.contains(parent) || !pass.editor.contains(parent) {
            debug!("Skipping child sync for vanished parent {}", parent);
            continue;
        }
        binding.with_node(parent, |node, binding| match node {
            CollabNode::Element(element) => element.sync_children_from_shared(binding, pass),
            other => Err(CollabError::desync(
                other.key(),
                "child change routed to a leaf node",
            )),
        })?;
    }

    // Then content of the nodes that survived.
    let mut touched: Vec<&NodeKey> = changes
        .content
        .iter()
        .chain(changes.state_keys.keys())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    touched.sort();

    let no_keys = HashSet::new();
    for key in touched {
        if !binding.contains(key) {
            continue;
        }
        let keys = match changes.state_keys.get(key) {
            Some(keys) => keys.as_ref(),
            None => Some(&no_keys),
        };
        let updated = binding.with_node(key, |node, binding| {
            node.sync_content_from_shared(binding, pass.editor, keys)
        })?;
        if updated {
            pass.report.updated += 1;
        }
    }
    Ok(())
}

fn depth(editor: &EditorState, key: &NodeKey) -> usize {
    let mut depth = 0;
    let mut current = editor.node(key).and_then(|n| n.parent());
    while let Some(parent) = current {
        depth += 1;
        current = editor.node(parent).and_then(|n| n.parent());
    }
    depth
}

/// Reconcile the local tree with the shared tree when collaboration starts.
///
/// A non-empty shared tree wins and replaces the local root's children.
/// Otherwise the whole local tree is published.
pub fn bootstrap(binding: &mut Binding, editor: &mut EditorState) -> Result<()> {
    if shared::children(binding.tree(), SharedNodeRef::Root).is_empty() {
        info!("Publishing local document to the shared tree");
        let update = editor.full_update();
        sync_local_to_shared(binding, editor, &update)?;
    } else {
        info!("Loading local document from the shared tree");
        load_from_shared(binding, editor)?;
    }
    // Events raised by the import that preceded bootstrap are already applied.
    binding.drain_changes();
    Ok(())
}

/// Rebuild the local tree from the shared tree, reusing collab nodes that
/// are still registered.
pub fn load_from_shared(binding: &mut Binding, editor: &mut EditorState) -> Result<RemoteApplyReport> {
    let mut changes = ChangeSet::default();
    changes.children.insert(binding.root_key().clone());
    changes.content.insert(binding.root_key().clone());
    sync_shared_to_local(binding, editor, &changes)
}
