//! collab-core: binds a local editor document tree to a Loro shared tree.
//!
//! This crate provides:
//! - A minimal local document model (`EditorState`) with edit transactions
//! - Collab nodes pairing each local node with a shared tree node
//! - Property, text and decorator-state synchronization in both directions
//! - Echo suppression so applied remote changes are never written back
//! - A session type and peer protocol for exchanging updates

pub mod binding;
pub mod bridge;
pub mod collab;
pub mod config;
pub mod diff;
pub mod error;
pub mod events;
pub mod local;
pub mod peer_id;
pub mod properties;
pub mod protocol;
pub mod session;
pub mod shared;
pub mod sync;

pub use binding::{Binding, ContainerRole};
pub use bridge::{ChangeSet, SharedChange, Suppression};
pub use collab::{CollabDecoratorNode, CollabElementNode, CollabNode, CollabTextNode, DecoratorState};
pub use config::{CollabConfig, DesyncPolicy};
pub use diff::TextSplice;
pub use error::{CollabError, Result};
pub use events::{CollabEvent, EventBus, Subscription};
pub use local::{
    EditorError, EditorState, EditorUpdate, LocalNode, NodeData, NodeKey, NodeKind, StateMap, TextFormat,
    UpdateOrigin,
};
pub use peer_id::{PeerId, PeerIdError};
pub use protocol::CollabMessage;
pub use session::CollabSession;
pub use shared::SharedNodeRef;
pub use sync::{LocalSyncReport, RemoteApplyReport};
