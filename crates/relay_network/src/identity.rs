//! Peer identity: connection handles, routing ids and version info.

use std::fmt;
use std::num::NonZeroU16;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire protocol revision. Peers with a different value are rejected during
/// the capability handshake.
pub const PROTOCOL_VERSION: i32 = 3;

/// A unique handle for one peer connection.
///
/// Handles are never reused: reconnecting to the same endpoint yields a new
/// `PeerId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub Uuid);

impl PeerId {
    /// Generate a new random peer handle (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session identifier prefixed to every datagram so the shared socket can
/// demultiplex traffic. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutingId(NonZeroU16);

impl RoutingId {
    /// Build a routing id, rejecting the reserved value 0.
    pub fn new(raw: u16) -> Option<Self> {
        NonZeroU16::new(raw).map(Self)
    }

    /// The raw 16-bit value written on the wire.
    pub fn get(self) -> u16 {
        self.0.get()
    }
}

impl fmt::Display for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version information exchanged in the capability handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeVersion {
    /// Wire protocol revision; must match exactly.
    pub protocol_version: i32,
    /// Free-form implementation version, reported for diagnostics only.
    pub implementation_version: String,
}

impl NodeVersion {
    pub fn new(protocol_version: i32, implementation_version: impl Into<String>) -> Self {
        Self {
            protocol_version,
            implementation_version: implementation_version.into(),
        }
    }

    /// The version of this build.
    pub fn current() -> Self {
        Self::new(PROTOCOL_VERSION, env!("CARGO_PKG_VERSION"))
    }

    /// Whether a peer reporting `other` can talk to us.
    pub fn is_compatible_with(&self, other: &NodeVersion) -> bool {
        self.protocol_version == other.protocol_version
    }
}

impl Default for NodeVersion {
    fn default() -> Self {
        Self::current()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generation() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert_eq!(format!("{a}"), a.as_uuid().to_string());
    }

    #[test]
    fn test_routing_id_rejects_zero() {
        assert!(RoutingId::new(0).is_none());
        assert_eq!(RoutingId::new(1).unwrap().get(), 1);
        assert_eq!(RoutingId::new(u16::MAX).unwrap().get(), u16::MAX);
    }

    #[test]
    fn test_version_compatibility() {
        let ours = NodeVersion::current();
        assert_eq!(ours.protocol_version, PROTOCOL_VERSION);
        assert!(ours.is_compatible_with(&NodeVersion::new(PROTOCOL_VERSION, "0.0.1")));
        assert!(!ours.is_compatible_with(&NodeVersion::new(PROTOCOL_VERSION + 1, "9.9.9")));
    }

    #[test]
    fn test_version_serialize_roundtrip() {
        let version = NodeVersion::new(7, "1.0.0-beta");
        let json = serde_json::to_string(&version).unwrap();
        let back: NodeVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, version);
    }
}
