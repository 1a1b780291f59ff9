//! Binary wire codec for the message envelope.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! type:u8 | [dedup:u128 if forwarding] | [len:u16, utf8 if opaque] | len:u32 | payload
//! ```
//!
//! Datagrams carry an extra `routing_id:u16` in front of the envelope.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{NetworkError, ProtocolError};
use crate::identity::RoutingId;
use crate::message::{Message, MessageType, Transport};

/// Largest payload accepted on either transport (64 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Size of the routing id prefix on datagrams.
pub const ROUTING_PREFIX_LEN: usize = 2;

/// Encode a message into a fresh buffer.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(encoded_len(message));
    encode_into(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a datagram: routing prefix followed by the envelope.
pub fn encode_datagram(routing_id: RoutingId, message: &Message) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(ROUTING_PREFIX_LEN + encoded_len(message));
    buf.put_u16(routing_id.get());
    encode_into(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Number of bytes [`encode`] will produce.
pub fn encoded_len(message: &Message) -> usize {
    let mut len = 1 + 4 + message.payload().len();
    if message.kind().carries_dedup_id() {
        len += 16;
    }
    if message.kind().carries_sub_type() {
        len += 2 + message.sub_type().map_or(0, str::len);
    }
    len
}

/// Append the envelope for `message` to `buf`.
pub fn encode_into(message: &Message, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let kind = message.kind();
    let payload = message.payload();
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    buf.put_u8(kind.id());
    if kind.carries_dedup_id() {
        buf.put_u128(message.dedup_id().unwrap_or_else(Uuid::nil).as_u128());
    }
    if kind.carries_sub_type() {
        let sub_type = message.sub_type().unwrap_or_default();
        if sub_type.len() > u16::MAX as usize {
            return Err(ProtocolError::InvalidSubType(format!(
                "{} bytes exceeds the u16 length prefix",
                sub_type.len()
            )));
        }
        buf.put_u16(sub_type.len() as u16);
        buf.put_slice(sub_type.as_bytes());
    }
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(())
}

/// Decode a complete envelope from `data`. Trailing bytes are ignored.
pub fn decode(data: &[u8], received_via: Transport) -> Result<Message, ProtocolError> {
    let mut reader = WireReader::new(data);

    let type_id = reader.get_u8()?;
    let kind = MessageType::from_id(type_id).ok_or(ProtocolError::UnknownMessageType(type_id))?;

    let dedup_id = if kind.carries_dedup_id() {
        Some(reader.get_uuid()?)
    } else {
        None
    };

    let sub_type = if kind.carries_sub_type() {
        let len = reader.get_u16()? as usize;
        let raw = reader.get_slice(len)?;
        Some(parse_sub_type(raw.to_vec())?)
    } else {
        None
    };

    let len = reader.get_u32()? as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let payload = Bytes::copy_from_slice(reader.get_slice(len)?);

    Ok(Message::from_parts(kind, dedup_id, sub_type, payload, received_via))
}

/// Split a received datagram into its routing id and envelope bytes.
pub fn split_datagram(data: &[u8]) -> Result<(u16, &[u8]), ProtocolError> {
    if data.len() < ROUTING_PREFIX_LEN {
        return Err(ProtocolError::DatagramTooShort(data.len()));
    }
    let routing_id = u16::from_be_bytes([data[0], data[1]]);
    Ok((routing_id, &data[ROUTING_PREFIX_LEN..]))
}

/// Read one envelope from a stream.
///
/// I/O failures come back as [`NetworkError::Io`]. Malformed frames come back
/// as [`NetworkError::Protocol`]; when the error does not desynchronise the
/// stream the whole frame has been consumed and the caller may keep reading.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let type_id = reader.read_u8().await?;
    let kind = MessageType::from_id(type_id).ok_or(ProtocolError::UnknownMessageType(type_id))?;

    let dedup_id = if kind.carries_dedup_id() {
        Some(Uuid::from_u128(reader.read_u128().await?))
    } else {
        None
    };

    let sub_type = if kind.carries_sub_type() {
        let len = reader.read_u16().await? as usize;
        let mut raw = vec![0u8; len];
        reader.read_exact(&mut raw).await?;
        Some(parse_sub_type(raw))
    } else {
        None
    };

    let len = reader.read_u32().await? as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_SIZE,
        }
        .into());
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    // The frame is fully consumed, so a bad sub-type only costs this message.
    let sub_type = sub_type.transpose()?;
    Ok(Message::from_parts(
        kind,
        dedup_id,
        sub_type,
        Bytes::from(payload),
        Transport::Stream,
    ))
}

/// Frame `message` onto a stream and flush it.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn parse_sub_type(raw: Vec<u8>) -> Result<String, ProtocolError> {
    String::from_utf8(raw).map_err(|e| ProtocolError::InvalidSubType(e.to_string()))
}

// ---------------------------------------------------------------------------
// Payload primitives
// ---------------------------------------------------------------------------

/// Append a `len:u16 | utf8` string. Longer strings are cut at the last
/// character boundary that fits.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    let mut len = value.len().min(u16::MAX as usize);
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    buf.put_u16(len as u16);
    buf.put_slice(&value.as_bytes()[..len]);
}

/// Append a UUID as a big-endian `u128`.
pub fn put_uuid(buf: &mut BytesMut, value: Uuid) {
    buf.put_u128(value.as_u128());
}

/// Append a boolean as one byte.
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Bounds-checked big-endian reader over a byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn ensure(&self, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.len() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_i32(&mut self) -> Result<i32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn get_i64(&mut self) -> Result<i64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn get_f32(&mut self) -> Result<f32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_f32())
    }

    pub fn get_uuid(&mut self) -> Result<Uuid, ProtocolError> {
        self.ensure(16)?;
        Ok(Uuid::from_u128(self.buf.get_u128()))
    }

    pub fn get_slice(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn get_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.get_u16()? as usize;
        let raw = self.get_slice(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| ProtocolError::InvalidString(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn assert_same(decoded: &Message, original: &Message) {
        assert_eq!(decoded.kind(), original.kind());
        assert_eq!(decoded.dedup_id(), original.dedup_id());
        assert_eq!(decoded.sub_type(), original.sub_type());
        assert_eq!(decoded.payload(), original.payload());
    }

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::new(MessageType::CapabilityHandshake, vec![0, 0, 0, 3]),
            Message::new(MessageType::HealthProbe, Bytes::new()),
            Message::new(MessageType::EntityUpdate, vec![0xAB; 300]),
            Message::opaque("pingwheel:ping", b"hello".to_vec()),
            Message::opaque("", Bytes::new()),
        ]
    }

    #[test]
    fn test_roundtrip_preserves_every_field() {
        for original in sample_messages() {
            let bytes = encode(&original).unwrap();
            assert_eq!(bytes.len(), encoded_len(&original));
            let decoded = decode(&bytes, Transport::Stream).unwrap();
            assert_same(&decoded, &original);
        }
    }

    #[test]
    fn test_layout_of_opaque_message() {
        let msg = Message::opaque("ab", vec![7u8]);
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes[0], 6);
        assert_eq!(&bytes[1..17], &msg.dedup_id().unwrap().as_u128().to_be_bytes());
        assert_eq!(&bytes[17..19], &[0, 2]);
        assert_eq!(&bytes[19..21], b"ab");
        assert_eq!(&bytes[21..25], &[0, 0, 0, 1]);
        assert_eq!(bytes[25], 7);
    }

    #[test]
    fn test_non_forwarding_has_no_dedup_id() {
        let msg = Message::new(MessageType::DatagramHandshake, vec![1, 2]);
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes.as_ref(), &[1, 0, 0, 0, 2, 1, 2]);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = decode(&[42, 0, 0, 0, 0], Transport::Stream).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownMessageType(42));
    }

    #[test]
    fn test_decode_rejects_oversized_payload() {
        let mut raw = vec![MessageType::HealthProbe.id()];
        raw.extend_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_be_bytes());
        let err = decode(&raw, Transport::Datagram).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let msg = Message::new(MessageType::Generic, vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            encode(&msg),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_invalid_sub_type() {
        let mut raw = vec![MessageType::Opaque.id()];
        raw.extend_from_slice(&[0u8; 16]);
        raw.extend_from_slice(&[0, 2, 0xFF, 0xFE]);
        raw.extend_from_slice(&[0, 0, 0, 0]);
        let err = decode(&raw, Transport::Datagram).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSubType(_)));
    }

    #[test]
    fn test_decode_truncated() {
        let msg = Message::new(MessageType::Generic, vec![1, 2, 3, 4]);
        let bytes = encode(&msg).unwrap();
        let err = decode(&bytes[..bytes.len() - 1], Transport::Stream).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn test_datagram_prefix() {
        let msg = Message::new(MessageType::Generic, vec![5]);
        let routing_id = RoutingId::new(0x0102).unwrap();
        let datagram = encode_datagram(routing_id, &msg).unwrap();
        assert_eq!(&datagram[..2], &[0x01, 0x02]);

        let (id, body) = split_datagram(&datagram).unwrap();
        assert_eq!(id, 0x0102);
        let decoded = decode(body, Transport::Datagram).unwrap();
        assert_same(&decoded, &msg);
        assert_eq!(decoded.transport(), Transport::Datagram);
    }

    #[test]
    fn test_split_datagram_too_short() {
        assert_eq!(
            split_datagram(&[1]).unwrap_err(),
            ProtocolError::DatagramTooShort(1)
        );
    }

    #[tokio::test]
    async fn test_stream_roundtrip_multiple_messages() {
        let messages = sample_messages();
        let mut wire = Vec::new();
        for msg in &messages {
            write_message(&mut wire, msg).await.unwrap();
        }

        let mut cursor = Cursor::new(wire);
        for expected in &messages {
            let decoded = read_message(&mut cursor).await.unwrap();
            assert_same(&decoded, expected);
        }
        let eof = read_message(&mut cursor).await.unwrap_err();
        assert!(matches!(eof, NetworkError::Io(_)));
    }

    #[tokio::test]
    async fn test_stream_survives_bad_sub_type() {
        let mut wire = vec![MessageType::Opaque.id()];
        wire.extend_from_slice(&[0u8; 16]);
        wire.extend_from_slice(&[0, 1, 0xFF]);
        wire.extend_from_slice(&[0, 0, 0, 2, 9, 9]);
        let good = Message::new(MessageType::Generic, vec![1]);
        wire.extend_from_slice(&encode(&good).unwrap());

        let mut cursor = Cursor::new(wire);
        match read_message(&mut cursor).await {
            Err(NetworkError::Protocol(e)) => assert!(!e.desynchronizes_stream()),
            other => panic!("expected protocol error, got {other:?}"),
        }
        let next = read_message(&mut cursor).await.unwrap();
        assert_same(&next, &good);
    }

    #[tokio::test]
    async fn test_stream_unknown_type_desynchronizes() {
        let mut cursor = Cursor::new(vec![99u8, 0, 0, 0, 0]);
        match read_message(&mut cursor).await {
            Err(NetworkError::Protocol(e)) => assert!(e.desynchronizes_stream()),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_wire_reader_primitives() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "zone:overworld");
        put_bool(&mut buf, true);
        let id = Uuid::new_v4();
        put_uuid(&mut buf, id);
        buf.put_i64(-5);
        buf.put_f32(1.5);

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.get_string().unwrap(), "zone:overworld");
        assert!(reader.get_bool().unwrap());
        assert_eq!(reader.get_uuid().unwrap(), id);
        assert_eq!(reader.get_i64().unwrap(), -5);
        assert_eq!(reader.get_f32().unwrap(), 1.5);
        assert_eq!(reader.remaining(), 0);
        assert!(matches!(
            reader.get_u8(),
            Err(ProtocolError::Truncated { needed: 1, remaining: 0 })
        ));
    }

    #[test]
    fn test_long_string_cut_on_char_boundary() {
        let long = "é".repeat(40_000);
        let mut buf = BytesMut::new();
        put_string(&mut buf, &long);

        let mut reader = WireReader::new(&buf);
        let decoded = reader.get_string().unwrap();
        assert_eq!(decoded.len(), 65_534);
        assert_eq!(decoded.chars().count(), 32_767);
        assert_eq!(reader.remaining(), 0);
    }
}
