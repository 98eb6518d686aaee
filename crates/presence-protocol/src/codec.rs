//! Codec for encoding and decoding presence frames.
//!
//! This module provides MessagePack-based serialization with length-prefixed framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::event::{EventKind, OfflinePayload, Payload, PresenceEvent};
use crate::frames::{Envelope, Handshake};
use crate::version::PROTOCOL_VERSION;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The frame carries an event kind this build does not know.
    #[error("Unknown event kind: {0:#04x}")]
    UnknownKind(u8),

    /// The frame was produced by an incompatible protocol version.
    #[error("Incompatible protocol version {0}")]
    IncompatibleVersion(u8),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a presence event to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded [`Envelope`]
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(event: &PresenceEvent) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode_into(event, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a presence event into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(event: &PresenceEvent, buf: &mut BytesMut) -> Result<(), CodecError> {
    let envelope = Envelope {
        v: PROTOCOL_VERSION.major,
        room: event.room.clone(),
        event: event.kind().into(),
        timestamp: event.timestamp,
        payload: encode_payload(&event.payload)?,
    };
    put_frame(&envelope, buf)
}

/// Decode a presence event from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<PresenceEvent, CodecError> {
    let body = frame_body(data)?;
    decode_envelope(body)
}

/// Try to decode a presence event from a buffer, advancing it if a complete
/// frame is present.
///
/// Returns `Ok(Some(event))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error. A frame
/// that fails to decode is still consumed from the buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<PresenceEvent>, CodecError> {
    match split_frame(buf)? {
        Some(body) => decode_envelope(&body).map(Some),
        None => Ok(None),
    }
}

/// Encode a handshake frame.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn encode_handshake(handshake: &Handshake) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    put_frame(handshake, &mut buf)?;
    Ok(buf.freeze())
}

/// Try to decode a handshake frame from a buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_handshake_from(buf: &mut BytesMut) -> Result<Option<Handshake>, CodecError> {
    match split_frame(buf)? {
        Some(body) => {
            let handshake: Handshake = rmp_serde::from_slice(&body)?;
            if !PROTOCOL_VERSION.accepts(handshake.version) {
                return Err(CodecError::IncompatibleVersion(handshake.version));
            }
            Ok(Some(handshake))
        }
        None => Ok(None),
    }
}

/// Encode a kind-specific payload.
///
/// # Errors
///
/// Returns an error if MessagePack encoding fails.
pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>, CodecError> {
    let bytes = match payload {
        Payload::Online(p) => rmp_serde::to_vec_named(p)?,
        Payload::Offline(p) => p.name.as_bytes().to_vec(),
        Payload::Movement(p) => rmp_serde::to_vec_named(p)?,
        Payload::Sync(p) => rmp_serde::to_vec_named(p)?,
        Payload::Ding(p) | Payload::Latency(p) => rmp_serde::to_vec_named(p)?,
    };
    Ok(bytes)
}

/// Decode a kind-specific payload.
///
/// # Errors
///
/// Returns an error if the bytes do not match the schema of `kind`.
pub fn decode_payload(kind: EventKind, data: &[u8]) -> Result<Payload, CodecError> {
    let payload = match kind {
        EventKind::Online => Payload::Online(from_slice(data)?),
        EventKind::Offline => {
            let name = std::str::from_utf8(data)
                .map_err(|e| CodecError::Invalid(format!("offline user id: {e}")))?;
            Payload::Offline(OfflinePayload {
                name: name.to_string(),
            })
        }
        EventKind::Movement => Payload::Movement(from_slice(data)?),
        EventKind::Sync => Payload::Sync(from_slice(data)?),
        EventKind::Ding => Payload::Ding(from_slice(data)?),
        EventKind::Latency => Payload::Latency(from_slice(data)?),
    };
    Ok(payload)
}

fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(data)?)
}

fn decode_envelope(body: &[u8]) -> Result<PresenceEvent, CodecError> {
    let envelope: Envelope = rmp_serde::from_slice(body)?;

    if !PROTOCOL_VERSION.accepts(envelope.v) {
        return Err(CodecError::IncompatibleVersion(envelope.v));
    }

    let kind = EventKind::try_from(envelope.event).map_err(CodecError::UnknownKind)?;
    let payload = decode_payload(kind, &envelope.payload)?;

    Ok(PresenceEvent {
        room: envelope.room,
        timestamp: envelope.timestamp,
        payload,
    })
}

fn put_frame<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<(), CodecError> {
    let body = rmp_serde::to_vec_named(value)?;

    if body.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(body.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);

    Ok(())
}

fn frame_body(data: &[u8]) -> Result<&[u8], CodecError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(CodecError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(CodecError::Incomplete(total_size - data.len()));
    }

    Ok(&data[LENGTH_PREFIX_SIZE..total_size])
}

/// Split the next complete frame body off the front of `buf`.
///
/// Returns `Ok(None)` if the buffer does not hold a complete frame yet.
///
/// # Errors
///
/// Returns an error if the length prefix exceeds [`MAX_FRAME_SIZE`].
pub fn split_frame(buf: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(length));
    }

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    Ok(Some(buf.split_to(length)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{OnlinePayload, Position, ProbePayload, SyncPayload};
    use crate::frames::Role;
    use serde_json::json;

    fn probe(value: serde_json::Value) -> ProbePayload {
        ProbePayload::new(value.as_object().cloned().unwrap_or_default())
    }

    fn sample_events() -> Vec<PresenceEvent> {
        vec![
            PresenceEvent::online(
                "room1",
                1_700_000_000_000,
                OnlinePayload {
                    name: "alice".into(),
                    avatar: "cat.png".into(),
                    country: "NL".into(),
                    mesh: Some("eu-west".into()),
                },
            ),
            PresenceEvent::offline("room1", 1_700_000_000_001, "alice"),
            PresenceEvent::movement("lobby", 42, "bob", Position::new(-1.5, 0.25)),
            PresenceEvent::sync(
                "lobby",
                43,
                SyncPayload {
                    name: "bob".into(),
                    position: Position::new(100.0, 200.5),
                    avatar: "dog.png".into(),
                    country: "JP".into(),
                },
            ),
            PresenceEvent::ding("void", 44, probe(json!({"name": "bob", "seq": 7}))),
            PresenceEvent::latency(
                "void",
                45,
                probe(json!({"name": "bob", "latency": 1_700_000_000_123_i64, "rtt": 12.5})),
            ),
        ]
    }

    #[test]
    fn test_encode_decode_every_kind() {
        for event in sample_events() {
            let encoded = encode(&event).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(event, decoded);
        }
    }

    #[test]
    fn test_offline_payload_is_bare_user_id() {
        let event = PresenceEvent::offline("r2", 10, "carol");
        assert_eq!(encode_payload(&event.payload).unwrap(), b"carol".to_vec());
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&PresenceEvent::offline("r", 1, "u")).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(CodecError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_is_consumed() {
        let bogus = Envelope {
            v: PROTOCOL_VERSION.major,
            room: "r".into(),
            event: 0x42,
            timestamp: 1,
            payload: Vec::new(),
        };
        let mut buf = BytesMut::new();
        put_frame(&bogus, &mut buf).unwrap();
        let valid = PresenceEvent::offline("r", 2, "dave");
        encode_into(&valid, &mut buf).unwrap();

        match decode_from(&mut buf) {
            Err(CodecError::UnknownKind(0x42)) => {}
            other => panic!("Expected UnknownKind error, got {:?}", other),
        }
        assert_eq!(decode_from(&mut buf).unwrap(), Some(valid));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incompatible_version() {
        let envelope = Envelope {
            v: PROTOCOL_VERSION.major + 1,
            room: "r".into(),
            event: EventKind::Offline.into(),
            timestamp: 1,
            payload: b"x".to_vec(),
        };
        let mut buf = BytesMut::new();
        put_frame(&envelope, &mut buf).unwrap();

        assert!(matches!(
            decode(&buf),
            Err(CodecError::IncompatibleVersion(_))
        ));
    }

    #[test]
    fn test_payload_schema_mismatch() {
        let envelope = Envelope {
            v: PROTOCOL_VERSION.major,
            room: "r".into(),
            event: EventKind::Movement.into(),
            timestamp: 1,
            payload: vec![0xc1],
        };
        let mut buf = BytesMut::new();
        put_frame(&envelope, &mut buf).unwrap();

        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn test_frame_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        let err = decode_from(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(n) if n == MAX_FRAME_SIZE + 1));
        // Header is left in place for the caller to skip
        assert_eq!(buf.len(), LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn test_streaming_decode() {
        let events = sample_events();

        let mut buf = BytesMut::new();
        for event in &events {
            encode_into(event, &mut buf).unwrap();
        }

        // Feed one byte at a time
        let mut stream = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in buf.iter() {
            stream.put_u8(*byte);
            if let Some(event) = decode_from(&mut stream).unwrap() {
                decoded.push(event);
            }
        }

        assert_eq!(decoded, events);
        assert!(stream.is_empty());
    }

    #[test]
    fn test_handshake_roundtrip() {
        let hs = Handshake::new(Role::Source, "relay").with_credential("app-key-secret:a|b");
        let encoded = encode_handshake(&hs).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        assert_eq!(decode_handshake_from(&mut buf).unwrap(), Some(hs));
    }
}
