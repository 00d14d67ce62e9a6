//! Delivered messages and their acknowledgements.

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use protocol::{Command, MessageId, RawMessage};

use crate::connection::Link;
use crate::error::{ConnectionError, Result};

/// A message delivered by the daemon.
///
/// The message remembers the connection and the socket it arrived on.
/// Finishing, requeueing and touching queue commands on that connection and
/// are refused once the daemon-side timeout has passed or the socket has
/// died, since the daemon will redeliver it either way.
#[derive(Debug, Clone)]
pub struct Message {
    raw: RawMessage,
    msg_timeout: Duration,
    link: Weak<Link>,
    session: u64,
}

impl Message {
    pub(crate) fn new(raw: RawMessage, link: &Arc<Link>) -> Self {
        Self {
            raw,
            msg_timeout: link.msg_timeout(),
            link: Arc::downgrade(link),
            session: link.session_id(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.raw.id
    }

    /// Delivery attempts so far, including this one.
    pub fn attempts(&self) -> u16 {
        self.raw.attempts
    }

    /// Daemon timestamp in nanoseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.raw.timestamp
    }

    pub fn timestamp_as_system_time(&self) -> SystemTime {
        self.raw.timestamp_as_system_time()
    }

    pub fn body(&self) -> &Bytes {
        &self.raw.body
    }

    /// Body as UTF-8, if it is.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.raw.body).ok()
    }

    /// Timeout negotiated for the connection the message came from.
    pub fn msg_timeout(&self) -> Duration {
        self.msg_timeout
    }

    /// Instant past which the message can no longer be acknowledged.
    pub fn expires_at(&self) -> SystemTime {
        self.timestamp_as_system_time() + self.msg_timeout
    }

    /// Whether `now` is at or past the timestamp plus the message timeout.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        let now_nanos = now
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or(0);
        self.is_expired_at_nanos(now_nanos)
    }

    fn is_expired_at_nanos(&self, now_nanos: u128) -> bool {
        now_nanos >= self.raw.timestamp as u128 + self.msg_timeout.as_nanos()
    }

    /// Marks the message processed.
    pub fn finish(&self) -> Result<()> {
        self.ensure_live()?;
        self.link()?
            .ack(self.session, self.raw.id, Command::Fin(self.raw.id))
    }

    /// Returns the message to the queue, redelivered after `delay`.
    ///
    /// Delays that overflow a `u64` of milliseconds are clamped.
    pub fn requeue(&self, delay: Duration) -> Result<()> {
        self.ensure_live()?;
        let timeout_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.link()?.ack(
            self.session,
            self.raw.id,
            Command::Req {
                id: self.raw.id,
                timeout_ms,
            },
        )
    }

    /// Resets the daemon-side timeout. Does not change flow accounting.
    pub fn touch(&self) -> Result<()> {
        self.ensure_live()?;
        self.link()?
            .send_for(self.session, self.raw.id, Command::Touch(self.raw.id))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_expired(SystemTime::now()) {
            return Err(ConnectionError::ExpiredMessage { id: self.raw.id });
        }
        Ok(())
    }

    fn link(&self) -> Result<Arc<Link>> {
        self.link.upgrade().ok_or(ConnectionError::Closed)
    }
}
