//! # NSQ Transport Library
//!
//! This crate keeps a self-healing TCP connection to a single NSQ daemon
//! and exposes it to publishers and consumers.
//!
//! ## Overview
//!
//! - **Connection**: handshake, read/write loops, death detection and
//!   reconnection with backoff
//! - **Flow Control**: RDY credit accounting with a 20% low-water mark
//! - **Messages**: delivered messages that can be finished, requeued or
//!   touched until their timeout passes
//! - **Configuration**: TOML file with environment overrides
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  publish / ack   ┌────────────────┐
//! │ application  │ ───────────────▶ │ outbound queue │──▶ write loop ──┐
//! └──────────────┘                  └────────────────┘                 │
//!        ▲                                                              ▼
//!        │ inbound queue                                              nsqd
//!        │                                                              │
//!        └─────────────────────────── read loop ◀──────────────────────┘
//!                                        │ death
//!                                        ▼
//!                                     monitor ──▶ teardown, backoff, reconnect
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use transport::{Connection, ConnectionOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     let options = ConnectionOptions::default().with_max_in_flight(10);
//!     let consumer =
//!         Connection::subscribe("127.0.0.1", 4150, "events", "archive", tx, options).await?;
//!
//!     while let Some(message) = rx.recv().await {
//!         println!("{:?}", message.body_str());
//!         message.finish()?;
//!     }
//!
//!     consumer.close().await?;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod flow;
pub mod message;
pub mod reader;

pub use backoff::RetryPolicy;
pub use config::{Config, ConfigError};
pub use connection::{
    AfterConnect, Connection, ConnectionOptions, ConnectionState, Link, Subscription, USER_AGENT,
};
pub use error::{ConnectionError, Result};
pub use flow::{AckOutcome, FlowController};
pub use message::Message;
pub use reader::FrameReader;
