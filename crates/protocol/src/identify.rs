//! IDENTIFY metadata sent once per connection during the handshake.

use serde::{Deserialize, Serialize};

/// Default heartbeat interval requested from the daemon, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Default per-client output buffer size, in bytes.
pub const DEFAULT_OUTPUT_BUFFER_SIZE: u64 = 16_000;

/// Default output buffer flush timeout, in milliseconds.
pub const DEFAULT_OUTPUT_BUFFER_TIMEOUT_MS: u64 = 250;

/// Default message timeout, in milliseconds.
pub const DEFAULT_MSG_TIMEOUT_MS: u64 = 60_000;

/// JSON document carried by the IDENTIFY command.
///
/// Feature negotiation, TLS, compression and sampling are always requested
/// off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyConfig {
    /// Identifier for this client (first resolved address of the host).
    pub client_id: String,
    /// Local hostname.
    pub hostname: String,
    /// Whether the daemon should answer with its own JSON settings.
    pub feature_negotiation: bool,
    /// Milliseconds between daemon heartbeats.
    pub heartbeat_interval: u64,
    /// Daemon-side output buffer size in bytes.
    pub output_buffer: u64,
    /// Daemon-side output buffer flush timeout in milliseconds.
    pub output_buffer_timeout: u64,
    /// TLS upgrade.
    pub tls_v1: bool,
    /// Snappy compression.
    pub snappy: bool,
    /// Deflate compression.
    pub deflate: bool,
    /// Percentage of messages to sample (0 disables sampling).
    pub sample_rate: u8,
    /// Library identifier.
    pub user_agent: String,
    /// Milliseconds before the daemon considers a delivered message timed out.
    pub msg_timeout: u64,
}

impl IdentifyConfig {
    /// Create IDENTIFY metadata with the default negotiable settings.
    pub fn new(
        client_id: impl Into<String>,
        hostname: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            hostname: hostname.into(),
            feature_negotiation: false,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_MS,
            output_buffer: DEFAULT_OUTPUT_BUFFER_SIZE,
            output_buffer_timeout: DEFAULT_OUTPUT_BUFFER_TIMEOUT_MS,
            tls_v1: false,
            snappy: false,
            deflate: false,
            sample_rate: 0,
            user_agent: user_agent.into(),
            msg_timeout: DEFAULT_MSG_TIMEOUT_MS,
        }
    }

    /// Sets the requested message timeout.
    pub fn with_msg_timeout(mut self, msg_timeout_ms: u64) -> Self {
        self.msg_timeout = msg_timeout_ms;
        self
    }

    /// Sets the requested heartbeat interval.
    pub fn with_heartbeat_interval(mut self, heartbeat_interval_ms: u64) -> Self {
        self.heartbeat_interval = heartbeat_interval_ms;
        self
    }

    /// Serialize to the JSON body of the IDENTIFY command.
    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
