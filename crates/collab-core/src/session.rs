//! CollabSession: an editor document bound to a shared document.
//!
//! The session runs local edit transactions and syncs each one into the
//! shared tree before returning. It imports remote updates and applies them
//! to the local tree before returning, and speaks the peer protocol. The
//! transport is the caller's business.

use crate::binding::Binding;
use crate::bridge::ChangeSet;
use crate::config::{CollabConfig, DesyncPolicy};
use crate::error::{CollabError, Result};
use crate::events::{CollabEvent, Subscription};
use crate::local::{EditorError, EditorState, UpdateOrigin};
use crate::peer_id::PeerId;
use crate::protocol::CollabMessage;
use crate::sync::{self, LocalSyncReport, RemoteApplyReport};
use loro::{ExportMode, LoroDoc, VersionVector};
use tracing::{debug, info, warn};

pub struct CollabSession {
    editor: EditorState,
    binding: Binding,
    /// Version last handed out by `take_pending_update`.
    last_broadcast: VersionVector,
}

impl CollabSession {
    /// Start collaborating on an empty document.
    pub fn start(config: CollabConfig) -> Result<Self> {
        Self::with_editor(EditorState::new(), config)
    }

    /// Start collaborating on an existing local document. Its content is
    /// published to the (empty) shared tree.
    pub fn with_editor(mut editor: EditorState, config: CollabConfig) -> Result<Self> {
        let mut binding = Binding::new(config, editor.root_key().clone())?;
        sync::bootstrap(&mut binding, &mut editor)?;
        Ok(Self {
            editor,
            binding,
            last_broadcast: VersionVector::default(),
        })
    }

    /// Join an existing collaboration from a snapshot. The local document is
    /// built from the shared tree.
    pub fn from_snapshot(snapshot: &[u8], config: CollabConfig) -> Result<Self> {
        let doc = LoroDoc::new();
        doc.import(snapshot)?;
        let mut editor = EditorState::new();
        let mut binding = Binding::with_doc(doc, config, editor.root_key().clone())?;
        sync::bootstrap(&mut binding, &mut editor)?;
        let last_broadcast = binding.doc().state_vv();
        Ok(Self {
            editor,
            binding,
            last_broadcast,
        })
    }

    pub fn editor(&self) -> &EditorState {
        &self.editor
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn peer_id(&self) -> PeerId {
        self.binding.peer_id()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self, callback: impl Fn(CollabEvent) + Send + Sync + 'static) -> Subscription {
        self.binding.events().subscribe(callback)
    }

    pub fn set_error_hook(&mut self, hook: impl Fn(&CollabError) + Send + Sync + 'static) {
        self.binding.set_error_hook(hook);
    }

    // ========== Local edits ==========

    /// Run a local edit transaction and sync it into the shared tree.
    ///
    /// Under `DesyncPolicy::Resync` a divergence found while syncing rebuilds
    /// the local tree from the shared tree, which drops the edit.
    pub fn update<T>(
        &mut self,
        f: impl FnOnce(&mut EditorState) -> std::result::Result<T, EditorError>,
    ) -> Result<T> {
        let (value, update) = self.editor.update(f)?;
        match sync::sync_local_to_shared(&mut self.binding, &self.editor, &update) {
            Ok(report) => {
                self.log_local(&report);
                Ok(value)
            }
            Err(e) => {
                self.recover(e)?;
                Ok(value)
            }
        }
    }

    fn log_local(&self, report: &LocalSyncReport) {
        if !report.is_empty() {
            debug!("Peer {} synced local edit: {:?}", self.peer_id(), report);
        }
    }

    // ========== Remote updates ==========

    /// Import a remote update or snapshot and apply it to the local tree.
    pub fn import(&mut self, data: &[u8]) -> Result<RemoteApplyReport> {
        self.flush();
        let caught_up = self.binding.doc().state_vv() == self.last_broadcast;
        self.binding.doc().import(data)?;
        if caught_up {
            // Nothing local is pending, so peers need none of this back.
            self.last_broadcast = self.binding.doc().state_vv();
        }
        self.apply_pending()
    }

    fn apply_pending(&mut self) -> Result<RemoteApplyReport> {
        let changes = self.binding.drain_changes();
        if changes.is_empty() {
            return Ok(RemoteApplyReport::default());
        }
        let set = ChangeSet::route(&self.binding, changes);
        match sync::sync_shared_to_local(&mut self.binding, &mut self.editor, &set) {
            Ok(report) => Ok(report),
            Err(e) => {
                self.recover(e)?;
                Ok(RemoteApplyReport::default())
            }
        }
    }

    /// Apply the desync policy to a failed sync. Returns the error when it is
    /// not recovered from.
    fn recover(&mut self, err: CollabError) -> Result<()> {
        if !err.is_fatal() {
            self.binding.report_error(&err);
            return Err(err);
        }
        match self.binding.config().desync_policy {
            DesyncPolicy::Fail => Err(err),
            DesyncPolicy::Resync => {
                warn!("Resynchronizing peer {} after: {}", self.peer_id(), err);
                self.resync()
            }
        }
    }

    /// Drop every collab node and rebuild the local tree from the shared tree.
    pub fn resync(&mut self) -> Result<()> {
        self.binding.reset();
        let root = self.editor.root_key().clone();
        self.editor
            .update_with_origin(UpdateOrigin::Collaboration, |state| {
                for child in state.children(&root).to_vec() {
                    state.remove(&child)?;
                }
                Ok::<_, EditorError>(())
            })?;
        let report = sync::load_from_shared(&mut self.binding, &mut self.editor)?;
        info!("Peer {} resynchronized: {:?}", self.peer_id(), report);
        Ok(())
    }

    // ========== Export ==========

    /// Commit anything written outside a local transaction, such as state-map
    /// edits made directly on a decorator's state.
    fn flush(&self) {
        let _guard = self.binding.suppression().local_write();
        self.binding.commit();
    }

    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.flush();
        self.binding
            .doc()
            .export(ExportMode::Snapshot)
            .map_err(|e| CollabError::Export(e.to_string()))
    }

    /// Updates a peer at `version` (an encoded version vector) is missing.
    pub fn export_updates_since(&self, version: &[u8]) -> Result<Vec<u8>> {
        let version = VersionVector::decode(version).map_err(|e| CollabError::Decode(e.to_string()))?;
        self.flush();
        self.binding
            .doc()
            .export(ExportMode::updates(&version))
            .map_err(|e| CollabError::Export(e.to_string()))
    }

    /// Encoded version vector of the shared document.
    pub fn version(&self) -> Vec<u8> {
        self.binding.doc().state_vv().encode()
    }

    /// Updates produced since the last call, for broadcasting.
    pub fn take_pending_update(&mut self) -> Result<Option<Vec<u8>>> {
        self.flush();
        let current = self.binding.doc().state_vv();
        if current == self.last_broadcast {
            return Ok(None);
        }
        let updates = self
            .binding
            .doc()
            .export(ExportMode::updates(&self.last_broadcast))
            .map_err(|e| CollabError::Export(e.to_string()))?;
        self.last_broadcast = current;
        Ok(Some(updates))
    }

    // ========== Peer protocol ==========

    pub fn prepare_sync_request(&self) -> Result<Vec<u8>> {
        CollabMessage::SyncRequest {
            version: self.version(),
        }
        .encode()
    }

    /// Encoded `Update` message for the pending updates, if any.
    pub fn prepare_update(&mut self) -> Result<Option<Vec<u8>>> {
        match self.take_pending_update()? {
            Some(data) => Ok(Some(CollabMessage::Update { data }.encode()?)),
            None => Ok(None),
        }
    }

    /// Process a peer message and return the reply to send back, if any.
    pub fn handle_message(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let msg = CollabMessage::decode(data)?;
        debug!("Peer {} handling {}", self.peer_id(), msg.name());
        match msg {
            CollabMessage::SyncRequest { version } => {
                let reply = CollabMessage::SyncExchange {
                    updates: self.export_updates_since(&version)?,
                    version: self.version(),
                };
                Ok(Some(reply.encode()?))
            }
            CollabMessage::SyncExchange { updates, version } => {
                self.import(&updates)?;
                let reply = CollabMessage::SyncResponse {
                    updates: self.export_updates_since(&version)?,
                };
                Ok(Some(reply.encode()?))
            }
            CollabMessage::SyncResponse { updates } => {
                self.import(&updates)?;
                Ok(None)
            }
            CollabMessage::Update { data } => {
                self.import(&data)?;
                Ok(None)
            }
        }
    }

    /// Stop collaborating: destroy every collab node and observer. The local
    /// document is handed back.
    pub fn stop(mut self) -> EditorState {
        self.binding.teardown();
        info!("Collaboration stopped for peer {}", self.peer_id());
        self.editor
    }
}

impl std::fmt::Debug for CollabSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabSession")
            .field("binding", &self.binding)
            .field("nodes", &self.editor.nodes().len())
            .finish()
    }
}
