//! Control messages exchanged between peers.
//!
//! A control message occupies one frame: the frame's kind byte selects the
//! variant and the payload is the postcard-encoded variant body. The union
//! is open — kind bytes above [`KIND_STREAM_DATA`] are reserved for
//! future operations (fetch, delete) without transport changes.
//!
//! # Transfer protocol
//!
//! A replicated store is three messages plus the raw bytes:
//!
//! 1. sender → receiver: `StoreFile { key, size }` announces the transfer
//! 2. receiver → sender: `StreamReady { key }` acknowledges it
//! 3. sender → receiver: `StreamData { key, size }` written back-to-back
//!    with exactly `size` raw payload bytes, under one writer lock
//!
//! Only `StreamData` parks the receiving read loop. Binding the park to a
//! marker written atomically with the payload means no other frame — an
//! ack for an unrelated transfer going the other way, say — can land
//! inside the raw-byte window and be swallowed as file content.

use serde::{Deserialize, Serialize};

/// Frame kind byte for [`ControlMessage::StoreFile`].
pub const KIND_STORE_FILE: u8 = 0x01;
/// Frame kind byte for [`ControlMessage::StreamReady`].
pub const KIND_STREAM_READY: u8 = 0x02;
/// Frame kind byte for [`ControlMessage::StreamData`].
pub const KIND_STREAM_DATA: u8 = 0x03;

/// Classified message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Announces an upcoming raw-byte transfer.
    StoreFile,
    /// Receiver's signal that it is ready for the announced transfer.
    StreamReady,
    /// Marks the start of the raw bytes, which follow immediately.
    StreamData,
}

impl MessageKind {
    /// Classify a frame's kind byte. `None` for unknown kinds.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            KIND_STORE_FILE => Some(MessageKind::StoreFile),
            KIND_STREAM_READY => Some(MessageKind::StreamReady),
            KIND_STREAM_DATA => Some(MessageKind::StreamData),
            _ => None,
        }
    }

    /// The wire byte for this kind.
    pub fn as_byte(&self) -> u8 {
        match self {
            MessageKind::StoreFile => KIND_STORE_FILE,
            MessageKind::StreamReady => KIND_STREAM_READY,
            MessageKind::StreamData => KIND_STREAM_DATA,
        }
    }

    /// Whether a raw byte stream follows this message on the same
    /// connection, requiring the read loop to park until it is consumed.
    pub fn carries_stream(&self) -> bool {
        matches!(self, MessageKind::StreamData)
    }
}

/// Body of a [`ControlMessage::StoreFile`] announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFileMessage {
    /// Storage key the incoming bytes belong to.
    pub key: String,
    /// Exact number of raw bytes that follow on the connection.
    pub size: u64,
}

/// Body of a [`ControlMessage::StreamReady`] acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamReadyMessage {
    /// Key from the `StoreFile` this readiness answers.
    pub key: String,
}

/// Body of a [`ControlMessage::StreamData`] marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDataMessage {
    /// Key the raw bytes belong to.
    pub key: String,
    /// Exact number of raw bytes that follow this frame.
    pub size: u64,
}

/// A peer-to-peer control message. See the module docs for the transfer
/// protocol these variants implement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    StoreFile(StoreFileMessage),
    StreamReady(StreamReadyMessage),
    StreamData(StreamDataMessage),
}

/// Errors when decoding a control message.
#[derive(Debug)]
pub enum DecodeError {
    /// The frame's kind byte names no known message.
    UnknownKind(u8),
    /// The payload did not deserialize as the kind's body.
    Payload(postcard::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnknownKind(byte) => write!(f, "unknown message kind 0x{byte:02x}"),
            DecodeError::Payload(e) => write!(f, "malformed message payload: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<postcard::Error> for DecodeError {
    fn from(e: postcard::Error) -> Self {
        DecodeError::Payload(e)
    }
}

impl ControlMessage {
    /// Build a `StoreFile` announcement.
    pub fn store_file(key: impl Into<String>, size: u64) -> Self {
        ControlMessage::StoreFile(StoreFileMessage {
            key: key.into(),
            size,
        })
    }

    /// Build a `StreamReady` acknowledgement.
    pub fn stream_ready(key: impl Into<String>) -> Self {
        ControlMessage::StreamReady(StreamReadyMessage { key: key.into() })
    }

    /// Build a `StreamData` marker.
    pub fn stream_data(key: impl Into<String>, size: u64) -> Self {
        ControlMessage::StreamData(StreamDataMessage {
            key: key.into(),
            size,
        })
    }

    /// This message's kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::StoreFile(_) => MessageKind::StoreFile,
            ControlMessage::StreamReady(_) => MessageKind::StreamReady,
            ControlMessage::StreamData(_) => MessageKind::StreamData,
        }
    }

    /// Encode as a kind byte plus postcard payload, ready for framing.
    pub fn encode(&self) -> (u8, Vec<u8>) {
        let payload = match self {
            ControlMessage::StoreFile(msg) => {
                postcard::to_allocvec(msg).expect("serialization should not fail")
            }
            ControlMessage::StreamReady(msg) => {
                postcard::to_allocvec(msg).expect("serialization should not fail")
            }
            ControlMessage::StreamData(msg) => {
                postcard::to_allocvec(msg).expect("serialization should not fail")
            }
        };
        (self.kind().as_byte(), payload)
    }

    /// Decode from a frame's kind byte and payload.
    pub fn decode(kind: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        match MessageKind::from_byte(kind) {
            Some(MessageKind::StoreFile) => {
                Ok(ControlMessage::StoreFile(postcard::from_bytes(payload)?))
            }
            Some(MessageKind::StreamReady) => {
                Ok(ControlMessage::StreamReady(postcard::from_bytes(payload)?))
            }
            Some(MessageKind::StreamData) => {
                Ok(ControlMessage::StreamData(postcard::from_bytes(payload)?))
            }
            None => Err(DecodeError::UnknownKind(kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_file_roundtrips() {
        let msg = ControlMessage::store_file("mybestpicture", 1234);
        let (kind, payload) = msg.encode();
        assert_eq!(kind, KIND_STORE_FILE);

        let decoded = ControlMessage::decode(kind, &payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn stream_ready_roundtrips() {
        let msg = ControlMessage::stream_ready("mybestpicture");
        let (kind, payload) = msg.encode();
        assert_eq!(kind, KIND_STREAM_READY);

        let decoded = ControlMessage::decode(kind, &payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = ControlMessage::decode(0x7f, b"").unwrap_err();
        assert!(matches!(err, DecodeError::UnknownKind(0x7f)));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        // a StreamReady body is not a valid StoreFile body
        let (_, payload) = ControlMessage::stream_ready("k").encode();
        let truncated = &payload[..payload.len() - 1];
        let err = ControlMessage::decode(KIND_STORE_FILE, truncated).unwrap_err();
        assert!(matches!(err, DecodeError::Payload(_)));
    }

    #[test]
    fn stream_data_roundtrips() {
        let msg = ControlMessage::stream_data("mybestpicture", 1234);
        let (kind, payload) = msg.encode();
        assert_eq!(kind, KIND_STREAM_DATA);

        let decoded = ControlMessage::decode(kind, &payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn only_stream_data_carries_a_stream() {
        assert!(MessageKind::StreamData.carries_stream());
        assert!(!MessageKind::StoreFile.carries_stream());
        assert!(!MessageKind::StreamReady.carries_stream());
    }

    #[test]
    fn kind_bytes_roundtrip() {
        for kind in [
            MessageKind::StoreFile,
            MessageKind::StreamReady,
            MessageKind::StreamData,
        ] {
            assert_eq!(MessageKind::from_byte(kind.as_byte()), Some(kind));
        }
        assert_eq!(MessageKind::from_byte(0x00), None);
    }
}
