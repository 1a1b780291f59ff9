//! Typed payloads for the connection-control and removal messages.
//!
//! Entity snapshots have their own format in [`crate::entity`]; opaque and
//! generic payloads are application bytes.

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::codec::{put_bool, put_string, put_uuid, WireReader};
use crate::error::ProtocolError;
use crate::identity::{NodeVersion, RoutingId};
use crate::message::{Message, MessageType, Transport};

/// `protocolVersion:i32 | implementationVersion:string`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityHandshake {
    pub version: NodeVersion,
}

impl CapabilityHandshake {
    pub fn new(version: NodeVersion) -> Self {
        Self { version }
    }

    pub fn to_message(&self) -> Message {
        let mut buf = BytesMut::new();
        buf.put_i32(self.version.protocol_version);
        put_string(&mut buf, &self.version.implementation_version);
        Message::new(MessageType::CapabilityHandshake, buf.freeze())
    }

    pub fn decode(message: &Message) -> Result<Self, ProtocolError> {
        expect_kind(message, MessageType::CapabilityHandshake)?;
        let mut reader = WireReader::new(message.payload());
        let protocol_version = reader.get_i32()?;
        let implementation_version = reader.get_string()?;
        Ok(Self::new(NodeVersion::new(
            protocol_version,
            implementation_version,
        )))
    }
}

/// `routingId:u16 | port:u32`. A port of 0 means "same as the stream port".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHandshake {
    pub routing_id: RoutingId,
    pub port: u16,
}

impl DatagramHandshake {
    pub fn new(routing_id: RoutingId, port: u16) -> Self {
        Self { routing_id, port }
    }

    pub fn to_message(&self) -> Message {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u16(self.routing_id.get());
        buf.put_u32(u32::from(self.port));
        Message::new(MessageType::DatagramHandshake, buf.freeze())
    }

    pub fn decode(message: &Message) -> Result<Self, ProtocolError> {
        expect_kind(message, MessageType::DatagramHandshake)?;
        let mut reader = WireReader::new(message.payload());
        let raw_id = reader.get_u16()?;
        let routing_id = RoutingId::new(raw_id)
            .ok_or_else(|| ProtocolError::Malformed("routing id 0 is reserved".into()))?;
        let raw_port = reader.get_u32()?;
        let port = u16::try_from(raw_port)
            .map_err(|_| ProtocolError::Malformed(format!("port {raw_port} out of range")))?;
        Ok(Self { routing_id, port })
    }
}

/// `isResponse:bool | timestampMs:i64 | sequence:i32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthProbe {
    pub is_response: bool,
    pub timestamp_ms: i64,
    pub sequence: i32,
}

impl HealthProbe {
    pub fn request(sequence: i32) -> Self {
        Self {
            is_response: false,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            sequence,
        }
    }

    /// The acknowledgment echoing this probe's timestamp and sequence.
    pub fn response(&self) -> Self {
        Self {
            is_response: true,
            ..*self
        }
    }

    /// Probes travel over the datagram path, acknowledgments over the stream.
    pub fn to_message(&self) -> Message {
        let mut buf = BytesMut::with_capacity(13);
        put_bool(&mut buf, self.is_response);
        buf.put_i64(self.timestamp_ms);
        buf.put_i32(self.sequence);
        let transport = if self.is_response {
            Transport::Stream
        } else {
            Transport::Datagram
        };
        Message::new(MessageType::HealthProbe, buf.freeze()).with_transport(transport)
    }

    pub fn decode(message: &Message) -> Result<Self, ProtocolError> {
        expect_kind(message, MessageType::HealthProbe)?;
        let mut reader = WireReader::new(message.payload());
        Ok(Self {
            is_response: reader.get_bool()?,
            timestamp_ms: reader.get_i64()?,
            sequence: reader.get_i32()?,
        })
    }
}

/// `entityId:u128`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRemoval {
    pub entity_id: Uuid,
}

impl EntityRemoval {
    pub fn new(entity_id: Uuid) -> Self {
        Self { entity_id }
    }

    pub fn to_message(&self) -> Message {
        let mut buf = BytesMut::with_capacity(16);
        put_uuid(&mut buf, self.entity_id);
        Message::new(MessageType::EntityRemove, buf.freeze())
    }

    pub fn decode(message: &Message) -> Result<Self, ProtocolError> {
        expect_kind(message, MessageType::EntityRemove)?;
        let mut reader = WireReader::new(message.payload());
        Ok(Self::new(reader.get_uuid()?))
    }
}

fn expect_kind(message: &Message, kind: MessageType) -> Result<(), ProtocolError> {
    if message.kind() != kind {
        return Err(ProtocolError::Malformed(format!(
            "expected {kind} payload, got {}",
            message.kind()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_capability_handshake_layout() {
        let handshake = CapabilityHandshake::new(NodeVersion::new(3, "1.0"));
        let msg = handshake.to_message();
        assert_eq!(msg.payload().as_ref(), &[0, 0, 0, 3, 0, 3, b'1', b'.', b'0']);
        assert_eq!(CapabilityHandshake::decode(&msg).unwrap(), handshake);
    }

    #[test]
    fn test_datagram_handshake_port_bounds() {
        let routing_id = RoutingId::new(4).unwrap();
        let msg = DatagramHandshake::new(routing_id, 0).to_message();
        let decoded = DatagramHandshake::decode(&msg).unwrap();
        assert_eq!(decoded.routing_id, routing_id);
        assert_eq!(decoded.port, 0);

        let mut raw = BytesMut::new();
        raw.put_u16(4);
        raw.put_u32(70_000);
        let bad = Message::new(MessageType::DatagramHandshake, raw.freeze());
        assert!(matches!(
            DatagramHandshake::decode(&bad),
            Err(ProtocolError::Malformed(_))
        ));

        let zero = Message::new(MessageType::DatagramHandshake, vec![0, 0, 0, 0, 0, 1]);
        assert!(DatagramHandshake::decode(&zero).is_err());
    }

    #[test]
    fn test_probe_transport_preference() {
        let probe = HealthProbe::request(12);
        assert_eq!(probe.to_message().transport(), Transport::Datagram);

        let ack = probe.response();
        assert!(ack.is_response);
        assert_eq!(ack.sequence, 12);
        assert_eq!(ack.timestamp_ms, probe.timestamp_ms);
        let msg = ack.to_message();
        assert_eq!(msg.transport(), Transport::Stream);
        assert_eq!(HealthProbe::decode(&msg).unwrap(), ack);
    }

    #[test]
    fn test_entity_removal() {
        let id = Uuid::new_v4();
        let msg = EntityRemoval::new(id).to_message();
        assert!(msg.dedup_id().is_some());
        assert_eq!(EntityRemoval::decode(&msg).unwrap().entity_id, id);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let msg = Message::new(MessageType::Generic, Bytes::from_static(&[0; 16]));
        assert!(EntityRemoval::decode(&msg).is_err());
    }

    #[test]
    fn test_truncated_probe() {
        let msg = Message::new(MessageType::HealthProbe, vec![1, 0, 0]);
        assert!(matches!(
            HealthProbe::decode(&msg),
            Err(ProtocolError::Truncated { .. })
        ));
    }
}
