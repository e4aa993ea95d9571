//! Session configuration.

use crate::error::{CollabError, Result};
use crate::peer_id::PeerId;
use serde::{Deserialize, Serialize};

/// What a session does when the local and shared trees are found to diverge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesyncPolicy {
    /// Report the error and return it to the caller. The session stays as is.
    #[default]
    Fail,
    /// Report the error, then rebuild the local tree from the shared tree.
    Resync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Loro peer id. A random one is generated when absent.
    pub peer_id: Option<PeerId>,
    /// Name of the shared tree container.
    pub tree_name: String,
    /// Jitter passed to Loro's fractional index. Zero keeps positions compact.
    pub fractional_index_jitter: u8,
    pub desync_policy: DesyncPolicy,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            tree_name: "root".to_string(),
            fractional_index_jitter: 0,
            desync_policy: DesyncPolicy::Fail,
        }
    }
}

impl CollabConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CollabError::Serialization(e.to_string()))
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn with_desync_policy(mut self, policy: DesyncPolicy) -> Self {
        self.desync_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CollabConfig::from_json(r#"{"desync_policy":"resync"}"#).unwrap();
        assert_eq!(config.desync_policy, DesyncPolicy::Resync);
        assert_eq!(config.tree_name, "root");
        assert!(config.peer_id.is_none());
    }

    #[test]
    fn test_peer_id_parsed_from_hex() {
        let config = CollabConfig::from_json(r#"{"peer_id":"00000000000000ff"}"#).unwrap();
        assert_eq!(config.peer_id, Some(PeerId::from(255)));
    }

    #[test]
    fn test_invalid_json_is_serialization_error() {
        let err = CollabConfig::from_json("{").unwrap_err();
        assert!(matches!(err, CollabError::Serialization(_)));
    }
}
