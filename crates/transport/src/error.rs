//! Errors surfaced by a connection to application code.

use protocol::{MessageId, ProtocolError};
use thiserror::Error;

/// Connection error type.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Wire-level failure: framing, handshake or protocol violation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket failure outside of frame decoding.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The message outlived the daemon's message timeout and can no longer
    /// be finished, requeued or touched.
    #[error("cannot modify expired message {id}")]
    ExpiredMessage {
        /// Id of the expired message.
        id: MessageId,
    },

    /// The message was delivered on a socket that has since died, or the
    /// connection is between sockets. The daemon will redeliver it.
    #[error("message {id} belongs to a dead socket")]
    StaleMessage {
        /// Id of the stale message.
        id: MessageId,
    },

    /// Every attempt allowed by the retry policy failed.
    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        source: Box<ConnectionError>,
    },

    /// The connection was closed by its owner.
    #[error("connection closed")]
    Closed,
}

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;
