//! Error types for the synchronization core.

use crate::local::NodeKey;
use thiserror::Error;

/// Errors raised while synchronizing the local tree with the shared tree.
///
/// `Desync` and `MissingSharedState` are invariant violations: the two trees
/// have diverged and continuing would corrupt state silently. Everything else
/// is propagated from the CRDT backend or the wire codec.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CollabError {
    /// A sync touched a local node or proxy that does not exist.
    #[error("structural desynchronization at {key}: {reason}")]
    Desync { key: NodeKey, reason: String },

    /// The nested shared map of a decorator is not where it must be.
    #[error("shared state map missing for decorator {key}")]
    MissingSharedState { key: NodeKey },

    /// The proxy was destroyed and cannot be synchronized again.
    #[error("collab node {key} was already destroyed")]
    Destroyed { key: NodeKey },

    /// The local editor rejected a mutation.
    #[error("editor error: {0}")]
    Editor(#[from] crate::local::EditorError),

    /// Loro CRDT error.
    #[error("loro error: {0}")]
    Loro(String),

    /// Failed to export shared state.
    #[error("failed to export shared state: {0}")]
    Export(String),

    /// Failed to decode a peer message or version vector.
    #[error("failed to decode: {0}")]
    Decode(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The configuration cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CollabError {
    pub(crate) fn desync(key: &NodeKey, reason: impl Into<String>) -> Self {
        CollabError::Desync {
            key: key.clone(),
            reason: reason.into(),
        }
    }

    /// Whether this error means the local and shared trees have diverged.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CollabError::Desync { .. } | CollabError::MissingSharedState { .. }
        )
    }
}

impl From<loro::LoroError> for CollabError {
    fn from(e: loro::LoroError) -> Self {
        CollabError::Loro(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;
