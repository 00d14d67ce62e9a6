//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all wire-level failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Frame errors
    /// Frame type field holds a value the protocol does not define.
    #[error("unknown frame type: {0}")]
    UnknownFrameType(i32),

    /// Frame size field is smaller than the type field it must include.
    #[error("invalid frame size: {0}")]
    InvalidFrameSize(i32),

    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Command errors
    /// Topic or channel name rejected by the daemon's naming rules.
    #[error("invalid {kind} name: {name:?}")]
    InvalidName {
        /// Either "topic" or "channel".
        kind: &'static str,
        /// The rejected name.
        name: String,
    },

    /// MPUB requires at least one message.
    #[error("cannot publish an empty batch")]
    EmptyBatch,

    /// Command line could not be parsed.
    #[error("malformed command: {0}")]
    MalformedCommand(String),

    // Handshake errors
    /// Daemon rejected or garbled the IDENTIFY exchange.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Daemon sent a response the client does not understand.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Any other I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Whether this error describes a broken or silent transport, as opposed
    /// to a violation of the protocol itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionClosed(_) | ProtocolError::Timeout(_) | ProtocolError::Io(_)
        )
    }
}

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}
