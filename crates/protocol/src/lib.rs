//! # NSQ Protocol Library
//!
//! This crate provides the wire-level pieces of the NSQ TCP protocol (V2)
//! with no I/O and no runtime attached.
//!
//! ## Overview
//!
//! - **Frame Codec**: size/type prefixed frames sent by the daemon
//! - **Commands**: newline-terminated commands sent by the client, with
//!   their binary trailers
//! - **Message Layout**: timestamp, attempts, id and body of delivered messages
//! - **IDENTIFY**: handshake metadata
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Commands (client → daemon)       │  SUB, RDY, FIN, PUB, ...
//! ├─────────────────────────────────────────┤
//! │          Frames (daemon → client)       │  Response, Error, Message
//! ├─────────────────────────────────────────┤
//! │     TCP, after the "  V2" preamble      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Command, Frame, FrameCodec};
//!
//! let publish = Command::publish("events", "hello").unwrap();
//! let wire = publish.encode().unwrap();
//! assert!(wire.starts_with(b"PUB events\n"));
//!
//! let codec = FrameCodec::new();
//! let reply = codec.encode(&Frame::Response("OK".into()));
//! let (frame, _) = codec.decode(&reply).unwrap();
//! assert!(frame.is_ok());
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Frame codec
//! - [`command`]: Command encoding and parsing, name validation
//! - [`message`]: Message frame payload layout
//! - [`identify`]: IDENTIFY metadata
//! - [`error`]: Error types

pub mod command;
pub mod error;
pub mod framing;
pub mod identify;
pub mod message;

pub use command::{validate_channel_name, validate_topic_name, Command, MAX_NAME_LENGTH};
pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameCodec, FrameType, FRAME_HEADER_SIZE, HEARTBEAT_RESPONSE, MAGIC_V2, MAX_FRAME_SIZE,
    OK_RESPONSE,
};
pub use identify::{IdentifyConfig, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_MSG_TIMEOUT_MS};
pub use message::{MessageId, RawMessage, MESSAGE_HEADER_SIZE, MESSAGE_ID_LENGTH};
