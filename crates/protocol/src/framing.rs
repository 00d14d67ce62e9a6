//! Frame codec for the daemon's length-prefixed response stream.
//!
//! # Frame Format
//!
//! Each frame sent by the daemon consists of:
//! - 4 bytes: size (big-endian signed, counts the type field and payload)
//! - 4 bytes: frame type (big-endian signed, 0 = response, 1 = error, 2 = message)
//! - N bytes: payload, where N = size - 4
//!
//! Commands travel the other way as newline-terminated text lines and are
//! handled by [`crate::command`].

use bytes::Bytes;

use crate::error::{ProtocolError, Result};

/// Protocol version preamble written once after the TCP connect.
pub const MAGIC_V2: [u8; 4] = *b"  V2";

/// Frame header size: 4 (size) + 4 (type) = 8 bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Width of the type field, which the size field includes.
const FRAME_TYPE_SIZE: usize = 4;

/// Maximum frame size accepted from the wire (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Response payload the daemon sends as a keep-alive probe.
pub const HEARTBEAT_RESPONSE: &[u8] = b"_heartbeat_";

/// Response payload acknowledging a command.
pub const OK_RESPONSE: &[u8] = b"OK";

/// Wire tag identifying the frame variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Control acknowledgements and heartbeats.
    Response,
    /// Daemon-reported fault, payload is descriptive text.
    Error,
    /// Application message delivery.
    Message,
}

impl FrameType {
    /// Returns the wire value of this frame type.
    pub fn as_i32(self) -> i32 {
        match self {
            FrameType::Response => 0,
            FrameType::Error => 1,
            FrameType::Message => 2,
        }
    }

    /// Maps a wire value to a frame type.
    pub fn from_i32(value: i32) -> Result<Self> {
        match value {
            0 => Ok(FrameType::Response),
            1 => Ok(FrameType::Error),
            2 => Ok(FrameType::Message),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

/// A decoded wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Response frame (e.g. `OK`, `_heartbeat_`, `CLOSE_WAIT`).
    Response(Bytes),
    /// Error frame (e.g. `E_FIN_FAILED ...`).
    Error(Bytes),
    /// Message frame; see [`crate::message::RawMessage`] for the layout.
    Message(Bytes),
}

impl Frame {
    /// Builds a frame of the given type around a payload.
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        match frame_type {
            FrameType::Response => Frame::Response(payload),
            FrameType::Error => Frame::Error(payload),
            FrameType::Message => Frame::Message(payload),
        }
    }

    /// Returns the frame's type tag.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Response(_) => FrameType::Response,
            Frame::Error(_) => FrameType::Error,
            Frame::Message(_) => FrameType::Message,
        }
    }

    /// Returns the raw payload.
    pub fn payload(&self) -> &Bytes {
        match self {
            Frame::Response(p) | Frame::Error(p) | Frame::Message(p) => p,
        }
    }

    /// True for the daemon's `_heartbeat_` response.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(p) if p.as_ref() == HEARTBEAT_RESPONSE)
    }

    /// True for an `OK` response.
    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Response(p) if p.as_ref() == OK_RESPONSE)
    }

    /// Payload rendered as text, for logs and error messages.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(self.payload()).into_owned()
    }
}

/// Encoder and decoder for daemon frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec with the default size limit.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Encode a frame the way the daemon puts it on the wire.
    pub fn encode(&self, frame: &Frame) -> Vec<u8> {
        let payload = frame.payload();
        let size = (FRAME_TYPE_SIZE + payload.len()) as i32;

        let mut output = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        output.extend_from_slice(&size.to_be_bytes());
        output.extend_from_slice(&frame.frame_type().as_i32().to_be_bytes());
        output.extend_from_slice(payload);
        output
    }

    /// Decode a frame from bytes.
    ///
    /// Returns the decoded frame and the number of bytes consumed. A buffer
    /// that ends before the frame does is reported as a closed connection:
    /// the stream stopped where a frame had to be.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        match self.try_decode(data)? {
            Some(decoded) => Ok(decoded),
            None if data.len() < FRAME_HEADER_SIZE => Err(ProtocolError::ConnectionClosed(
                format!(
                    "truncated frame header: need {} bytes, have {}",
                    FRAME_HEADER_SIZE,
                    data.len()
                ),
            )),
            None => Err(ProtocolError::ConnectionClosed(format!(
                "truncated frame payload: have {} bytes",
                data.len()
            ))),
        }
    }

    /// Try to decode a frame from bytes, returning None if there isn't enough data.
    ///
    /// Header errors (bad type, bad size) are reported as soon as the header
    /// is available, without waiting for the payload.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let size = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let raw_type = i32::from_be_bytes([data[4], data[5], data[6], data[7]]);

        if size < FRAME_TYPE_SIZE as i32 {
            return Err(ProtocolError::InvalidFrameSize(size));
        }
        let payload_len = size as usize - FRAME_TYPE_SIZE;
        let total = FRAME_HEADER_SIZE + payload_len;
        if total > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            });
        }

        let frame_type = FrameType::from_i32(raw_type)?;

        if data.len() < total {
            return Ok(None);
        }

        let payload = Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..total]);
        Ok(Some((Frame::new(frame_type, payload), total)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_frame(frame_type: i32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(&frame_type.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_frame_type_wire_values() {
        assert_eq!(FrameType::Response.as_i32(), 0);
        assert_eq!(FrameType::Error.as_i32(), 1);
        assert_eq!(FrameType::Message.as_i32(), 2);
        assert_eq!(FrameType::from_i32(2).unwrap(), FrameType::Message);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = FrameCodec::new();
        for frame in [
            Frame::Response(Bytes::from_static(b"OK")),
            Frame::Error(Bytes::from_static(b"E_INVALID bad")),
            Frame::Message(Bytes::from(vec![7u8; 40])),
            Frame::Response(Bytes::new()),
        ] {
            let encoded = codec.encode(&frame);
            let (decoded, consumed) = codec.decode(&encoded).unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn test_ok_response_layout() {
        let encoded = FrameCodec::new().encode(&Frame::Response(Bytes::from_static(b"OK")));
        assert_eq!(encoded, vec![0, 0, 0, 6, 0, 0, 0, 0, b'O', b'K']);
    }

    #[test]
    fn test_heartbeat_and_ok_detection() {
        let heartbeat = Frame::Response(Bytes::from_static(HEARTBEAT_RESPONSE));
        assert!(heartbeat.is_heartbeat());
        assert!(!heartbeat.is_ok());

        let ok = Frame::Response(Bytes::from_static(OK_RESPONSE));
        assert!(ok.is_ok());

        // An error frame with the same text is not a heartbeat.
        let err = Frame::Error(Bytes::from_static(HEARTBEAT_RESPONSE));
        assert!(!err.is_heartbeat());
    }

    #[test]
    fn test_decode_truncated_header_is_connection_closed() {
        let codec = FrameCodec::new();
        for len in 0..FRAME_HEADER_SIZE {
            let data = vec![0u8; len];
            let err = codec.decode(&data).unwrap_err();
            assert!(
                matches!(err, ProtocolError::ConnectionClosed(_)),
                "len {} gave {:?}",
                len,
                err
            );
        }
    }

    #[test]
    fn test_decode_truncated_payload_is_connection_closed() {
        let codec = FrameCodec::new();
        let full = raw_frame(0, b"hello");
        let err = codec.decode(&full[..full.len() - 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_decode_unknown_frame_type() {
        let codec = FrameCodec::new();
        let data = raw_frame(3, b"x");
        assert!(matches!(
            codec.decode(&data),
            Err(ProtocolError::UnknownFrameType(3))
        ));

        let data = raw_frame(-1, b"");
        assert!(matches!(
            codec.decode(&data),
            Err(ProtocolError::UnknownFrameType(-1))
        ));
    }

    #[test]
    fn test_unknown_type_reported_before_payload_arrives() {
        let codec = FrameCodec::new();
        let data = raw_frame(9, b"a long payload");
        let result = codec.try_decode(&data[..FRAME_HEADER_SIZE]);
        assert!(matches!(result, Err(ProtocolError::UnknownFrameType(9))));
    }

    #[test]
    fn test_decode_invalid_size() {
        let codec = FrameCodec::new();
        let mut data = Vec::new();
        data.extend_from_slice(&3i32.to_be_bytes());
        data.extend_from_slice(&0i32.to_be_bytes());
        assert!(matches!(
            codec.decode(&data),
            Err(ProtocolError::InvalidFrameSize(3))
        ));
    }

    #[test]
    fn test_decode_oversized_length() {
        let codec = FrameCodec::with_max_frame_size(64);
        let data = raw_frame(2, &[0u8; 100]);
        assert!(matches!(
            codec.decode(&data),
            Err(ProtocolError::FrameTooLarge { size: 108, max: 64 })
        ));
    }

    #[test]
    fn test_try_decode_partial_data() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Frame::Error(Bytes::from_static(b"E_FIN_FAILED")));

        for i in 0..encoded.len() {
            assert!(
                codec.try_decode(&encoded[..i]).unwrap().is_none(),
                "should return None for partial data (len={})",
                i
            );
        }
        assert!(codec.try_decode(&encoded).unwrap().is_some());
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let codec = FrameCodec::new();
        let first = Frame::Response(Bytes::from_static(b"OK"));
        let second = Frame::Message(Bytes::from(vec![1u8; 30]));

        let mut combined = codec.encode(&first);
        combined.extend_from_slice(&codec.encode(&second));

        let (decoded1, consumed1) = codec.decode(&combined).unwrap();
        assert_eq!(decoded1, first);

        let (decoded2, consumed2) = codec.decode(&combined[consumed1..]).unwrap();
        assert_eq!(decoded2, second);
        assert_eq!(consumed1 + consumed2, combined.len());
    }

    #[test]
    fn test_payload_text() {
        let frame = Frame::Error(Bytes::from_static(b"E_BAD_TOPIC"));
        assert_eq!(frame.payload_text(), "E_BAD_TOPIC");
    }
}
