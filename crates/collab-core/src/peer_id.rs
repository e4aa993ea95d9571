//! PeerId: Unique identifier for a collaborating editor instance.
//!
//! Wraps a u64 internally (the Loro peer id) but displays as a 16-character
//! hex string for human readability.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("Invalid peer ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
    #[error("Peer ID must not be zero")]
    Zero,
}

/// A unique identifier for a peer in a collaboration session.
///
/// The id becomes the Loro peer id of the shared document, so it takes part in
/// the tie-break Loro applies to concurrent sibling inserts at the same
/// position: siblings with equal fractional index are ordered by the
/// `(lamport, peer)` of the op that placed them. Every peer derives the same
/// order from the same merged state.
///
/// # Examples
/// ```
/// use collab_core::PeerId;
///
/// let peer_id = PeerId::generate();
/// assert_ne!(peer_id.as_u64(), 0);
///
/// let parsed: PeerId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// assert_eq!(parsed.to_string(), "a1b2c3d4e5f67890");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Generate a new random peer ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    /// Get the underlying u64 value (for Loro API).
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PeerIdError::InvalidFormat);
        }
        let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
        if id == 0 {
            return Err(PeerIdError::Zero);
        }
        Ok(Self(id))
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<PeerId> for u64 {
    fn from(peer_id: PeerId) -> u64 {
        peer_id.0
    }
}

// Serialize as hex string for consistency in logs, errors, JSON
impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_nonzero_and_unique() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a.as_u64(), 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_roundtrip() {
        let id = PeerId::from(0x00ff_0000_0000_0001);
        let s = id.to_string();
        assert_eq!(s, "00ff000000000001");
        assert_eq!(s.parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn test_uppercase_hex_accepted() {
        let id: PeerId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_invalid_formats_rejected() {
        assert!(matches!("xyz".parse::<PeerId>(), Err(PeerIdError::InvalidFormat)));
        assert!(matches!(
            "g1b2c3d4e5f67890".parse::<PeerId>(),
            Err(PeerIdError::InvalidFormat)
        ));
        assert!(matches!(
            "0000000000000000".parse::<PeerId>(),
            Err(PeerIdError::Zero)
        ));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = PeerId::from(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"000000000000002a\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
