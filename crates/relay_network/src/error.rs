//! Network error types.
//!
//! Errors are split by how the mesh reacts to them: [`ProtocolError`]s drop a
//! single message, [`HandshakeError`]s end one connection, and the transport
//! variants of [`NetworkError`] end a connection or fail the calling operation.

use std::net::SocketAddr;
use std::time::Duration;

use crate::identity::{NodeVersion, PeerId};

/// Errors that can occur in the relay_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level failure on an established connection.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An outbound connection attempt failed.
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The address could not be parsed or resolved.
    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    /// The address resolves to this node's own listening endpoint.
    #[error("Cannot connect to self ({0})")]
    SelfConnection(SocketAddr),

    /// A peer with the same resolved endpoint is already connected.
    #[error("Already connected to peer ({0})")]
    AlreadyConnected(SocketAddr),

    /// The requested peer was not found in the registry.
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// The peer connection has already been torn down.
    #[error("Peer {0} is disconnected")]
    PeerDisconnected(PeerId),

    /// Malformed data on the wire.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Capability exchange failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// A datagram carried a routing id no connected peer owns.
    #[error("Unknown routing id {0}")]
    UnknownRoutingId(u16),

    /// The datagram path cannot carry this message right now.
    #[error("Datagram unavailable: {0}")]
    DatagramUnavailable(String),

    /// No port in the sweep range could be bound.
    #[error("No available port in {start}..={end}")]
    NoAvailablePort { start: u16, end: u16 },

    /// The node is already listening.
    #[error("Already listening on port {0}")]
    AlreadyListening(u16),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// A configuration value is outside its safe range.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Broad classification used when the error is published as an event.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Protocol(_) => FailureKind::Protocol,
            Self::Handshake(_) => FailureKind::Handshake,
            Self::UnknownRoutingId(_) => FailureKind::Routing,
            Self::NoAvailablePort { .. } | Self::AlreadyListening(_) => FailureKind::Resource,
            Self::Config(_) | Self::Serialization(_) => FailureKind::Resource,
            _ => FailureKind::Transport,
        }
    }
}

/// Category of a failure reported through the event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Bind/accept/connect/read/write failure.
    Transport,
    /// Malformed envelope, unknown type or oversized payload.
    Protocol,
    /// Capability mismatch or handshake timeout.
    Handshake,
    /// Datagram tagged with an unknown routing id.
    Routing,
    /// A local resource (port, config) could not be obtained.
    Resource,
}

/// Malformed wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type id {0}")]
    UnknownMessageType(u8),

    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Malformed sub-type: {0}")]
    InvalidSubType(String),

    #[error("Malformed string: {0}")]
    InvalidString(String),

    #[error("Truncated data: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Datagram too short to carry a routing id ({0} bytes)")]
    DatagramTooShort(usize),

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Whether this error leaves a stream reader unable to locate the next
    /// frame boundary.
    pub fn desynchronizes_stream(&self) -> bool {
        matches!(
            self,
            Self::UnknownMessageType(_) | Self::PayloadTooLarge { .. } | Self::Truncated { .. }
        )
    }
}

/// Capability exchange failures. Always terminal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error(
        "Protocol version mismatch: local {} ({}), remote {} ({})",
        .local.protocol_version,
        .local.implementation_version,
        .remote.protocol_version,
        .remote.implementation_version
    )]
    VersionMismatch { local: NodeVersion, remote: NodeVersion },

    #[error("No capability handshake received within {0:?}")]
    Timeout(Duration),

    #[error("Connection closed before the handshake completed")]
    Aborted,
}
