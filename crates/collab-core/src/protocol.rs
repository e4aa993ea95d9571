//! Peer protocol for exchanging shared-tree updates.
//!
//! The exchange is symmetric and takes one round-trip:
//!
//! 1. Peer A sends `SyncRequest` with its version vector.
//! 2. Peer B answers with `SyncExchange`: the updates A is missing plus B's
//!    own version vector.
//! 3. Peer A imports those updates and answers with `SyncResponse` carrying
//!    the updates B is missing.
//!
//! After that, every local edit is broadcast as an `Update`. Messages are
//! bincode-encoded; the update payloads are opaque Loro bytes.

use crate::error::{CollabError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollabMessage {
    /// Ask a peer for the updates we are missing.
    SyncRequest {
        /// Encoded Loro version vector of the sender.
        version: Vec<u8>,
    },

    /// Answer to a request, bundled with the responder's own version so the
    /// requester can send back what the responder is missing.
    SyncExchange {
        /// Updates the requester is missing.
        updates: Vec<u8>,
        /// Encoded version vector of the responder.
        version: Vec<u8>,
    },

    /// Final step of an exchange.
    SyncResponse { updates: Vec<u8> },

    /// Real-time update produced by a local edit.
    Update { data: Vec<u8> },
}

impl CollabMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CollabError::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| CollabError::Decode(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            CollabMessage::SyncRequest { .. } => "SyncRequest",
            CollabMessage::SyncExchange { .. } => "SyncExchange",
            CollabMessage::SyncResponse { .. } => "SyncResponse",
            CollabMessage::Update { .. } => "Update",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bincode_roundtrip() {
        let msg = CollabMessage::SyncExchange {
            updates: vec![1, 2, 3],
            version: vec![9],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(CollabMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = CollabMessage::decode(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, CollabError::Decode(_)));
    }
}
