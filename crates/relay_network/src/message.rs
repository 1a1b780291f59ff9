//! Network message protocol: envelope-based typed messaging.
//!
//! A [`Message`] is the unit carried over both transports. Its
//! [`MessageType`] decides statically whether it takes part in flood relay
//! and therefore whether it carries a dedup identifier on the wire.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of message carried in a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MessageType {
    // ── Connection control (never relayed) ─────────────────────────
    /// Protocol/implementation version exchange.
    CapabilityHandshake = 0,
    /// Tells the peer which routing id and port to use for datagrams.
    DatagramHandshake = 1,
    /// Datagram path health probe and its acknowledgment.
    HealthProbe = 2,

    // ── Relayed ────────────────────────────────────────────────────
    /// Free-form application payload.
    Generic = 3,
    /// Entity snapshot (full or delta).
    EntityUpdate = 4,
    /// Entity removal notice.
    EntityRemove = 5,
    /// Opaque payload routed by its sub-type string.
    Opaque = 6,
}

impl MessageType {
    /// Every message type, in wire id order.
    pub const ALL: [MessageType; 7] = [
        Self::CapabilityHandshake,
        Self::DatagramHandshake,
        Self::HealthProbe,
        Self::Generic,
        Self::EntityUpdate,
        Self::EntityRemove,
        Self::Opaque,
    ];

    /// The one-byte wire id.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Look up a type by its wire id.
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    /// Whether a host relays this message to its other peers.
    pub fn forwards(self) -> bool {
        matches!(
            self,
            Self::Generic | Self::EntityUpdate | Self::EntityRemove | Self::Opaque
        )
    }

    /// Whether the envelope carries a 128-bit dedup identifier.
    pub fn carries_dedup_id(self) -> bool {
        self.forwards()
    }

    /// Whether the envelope carries a sub-type string.
    pub fn carries_sub_type(self) -> bool {
        self == Self::Opaque
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CapabilityHandshake => "capability_handshake",
            Self::DatagramHandshake => "datagram_handshake",
            Self::HealthProbe => "health_probe",
            Self::Generic => "generic",
            Self::EntityUpdate => "entity_update",
            Self::EntityRemove => "entity_remove",
            Self::Opaque => "opaque",
        };
        f.write_str(name)
    }
}

/// Which transport a message should travel over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// The reliable, ordered stream.
    #[default]
    Stream,
    /// The best-effort datagram path (falls back to the stream when unhealthy).
    Datagram,
}

/// A network message envelope carrying a typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageType,
    dedup_id: Option<Uuid>,
    sub_type: Option<String>,
    payload: Bytes,
    transport: Transport,
}

impl Message {
    /// Create a message of the given kind. Forward-eligible kinds get a fresh
    /// dedup identifier.
    ///
    /// Opaque messages should be built with [`Message::opaque`]; built here
    /// they get an empty sub-type.
    pub fn new(kind: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            dedup_id: kind.carries_dedup_id().then(Uuid::new_v4),
            sub_type: kind.carries_sub_type().then(String::new),
            payload: payload.into(),
            transport: Transport::Stream,
        }
    }

    /// Create an opaque message routed by `sub_type` on the receiving side.
    pub fn opaque(sub_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let mut message = Self::new(MessageType::Opaque, payload);
        message.sub_type = Some(sub_type.into());
        message
    }

    /// Set the preferred transport.
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Rebuild a message from its decoded wire parts.
    pub(crate) fn from_parts(
        kind: MessageType,
        dedup_id: Option<Uuid>,
        sub_type: Option<String>,
        payload: Bytes,
        transport: Transport,
    ) -> Self {
        Self {
            kind,
            dedup_id,
            sub_type,
            payload,
            transport,
        }
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    /// Dedup identifier; present exactly when the kind forwards.
    pub fn dedup_id(&self) -> Option<Uuid> {
        self.dedup_id
    }

    /// Sub-type string; present exactly for opaque messages.
    pub fn sub_type(&self) -> Option<&str> {
        self.sub_type.as_deref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// For locally built messages, the preferred transport; for received
    /// messages, the transport they arrived on.
    pub fn transport(&self) -> Transport {
        self.transport
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
