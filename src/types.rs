//! Core identifier and error types shared across the mesh stack.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique peer identifier, a 128-bit UUID.
///
/// Totally ordered so that routing decisions which need a deterministic
/// tie-break (equal-cost next hops, simultaneous connection establishment)
/// can compare identifiers directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Generate a random peer ID.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a peer ID from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the peer ID as raw bytes.
    pub fn to_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// Get the peer ID as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Truncated hex for log readability (first 8 bytes)
        for byte in &self.0.as_bytes()[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Errors surfaced by routing and connection establishment.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Attempted to connect to a peer with no known addresses.
    #[error("no known address for peer {0}")]
    NoAddress(PeerId),

    /// The routing table has no path to one or more destinations.
    #[error("no route to destinations {0:?}")]
    NoRoute(Vec<PeerId>),

    /// An expected handshake packet was missing, malformed, or mis-typed.
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    /// At least one subconnection of a multicast could not be established
    /// or confirmed; the whole composite was torn down.
    #[error("multicast establishment failed; all subconnections torn down")]
    PartialMulticastFailure,

    /// The underlying connection closed mid-operation.
    #[error("underlying connection closed")]
    TransportClosed,

    /// An internal channel was dropped before the operation completed.
    #[error("internal channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_roundtrip() {
        let id = PeerId::random();
        assert_eq!(id, PeerId::from_bytes(id.to_bytes()));
    }

    #[test]
    fn peer_id_ordering_is_byte_order() {
        let low = PeerId::from_bytes([0u8; 16]);
        let high = PeerId::from_bytes([0xff; 16]);
        assert!(low < high);
    }

    #[test]
    fn peer_id_display_is_truncated_hex() {
        let id = PeerId::from_bytes([0xab; 16]);
        assert_eq!(id.to_string(), "abababababababab");
    }
}
