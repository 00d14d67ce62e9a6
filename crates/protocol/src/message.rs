//! Layout of Message frame payloads.
//!
//! ```text
//! [8-byte timestamp (ns, BE)][2-byte attempts (BE)][16-byte id][body...]
//! ```

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Length of a message id in bytes.
pub const MESSAGE_ID_LENGTH: usize = 16;

/// Bytes preceding the body in a Message frame payload.
pub const MESSAGE_HEADER_SIZE: usize = 8 + 2 + MESSAGE_ID_LENGTH;

/// Opaque daemon-assigned message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MESSAGE_ID_LENGTH]);

impl MessageId {
    /// Wraps raw id bytes.
    pub fn new(bytes: [u8; MESSAGE_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Builds an id from a slice, which must be exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; MESSAGE_ID_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::Deserialization(format!(
                "message id must be {} bytes, got {}",
                MESSAGE_ID_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Raw id bytes, as written in FIN/REQ/TOUCH.
    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    // Daemon ids are ASCII hex in practice.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// A message as carried in a Message frame, with no connection attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Daemon-side creation time, nanoseconds since the Unix epoch.
    pub timestamp: u64,
    /// Number of delivery attempts, including this one.
    pub attempts: u16,
    /// Message identifier.
    pub id: MessageId,
    /// Application payload.
    pub body: Bytes,
}

impl RawMessage {
    /// Decode a Message frame payload.
    pub fn decode(payload: &Bytes) -> Result<Self> {
        if payload.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::Deserialization(format!(
                "message payload too short: need at least {} bytes, have {}",
                MESSAGE_HEADER_SIZE,
                payload.len()
            )));
        }

        let timestamp = u64::from_be_bytes(payload[0..8].try_into().map_err(|_| {
            ProtocolError::Deserialization("bad timestamp field".to_string())
        })?);
        let attempts = u16::from_be_bytes([payload[8], payload[9]]);
        let id = MessageId::from_slice(&payload[10..MESSAGE_HEADER_SIZE])?;
        let body = payload.slice(MESSAGE_HEADER_SIZE..);

        Ok(Self {
            timestamp,
            attempts,
            id,
            body,
        })
    }

    /// Encode into a Message frame payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + self.body.len());
        buf.put_u64(self.timestamp);
        buf.put_u16(self.attempts);
        buf.put_slice(self.id.as_bytes());
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// The daemon timestamp as wall-clock time.
    pub fn timestamp_as_system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.timestamp)
    }
}
