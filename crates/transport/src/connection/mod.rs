//! Self-healing connection to a single daemon.
//!
//! A [`Connection`] owns three background tasks per live socket: a read
//! loop that decodes frames, a write loop that drains the outbound queue,
//! and a monitor that tears the socket down when either loop reports a
//! failure and reconnects with backoff. Callers only ever touch the
//! outbound queue, so they never block on the network.

mod link;
mod monitor;
mod session;

pub use link::Link;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use protocol::{Command, IdentifyConfig, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_MSG_TIMEOUT_MS};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::RetryPolicy;
use crate::error::Result;
use crate::message::Message;

/// User agent advertised in IDENTIFY.
pub const USER_AGENT: &str = concat!("nsq-rs/", env!("CARGO_PKG_VERSION"));

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for the IDENTIFY exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pause after a successful reconnect.
pub const DEFAULT_RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket yet.
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Magic sent, waiting for the IDENTIFY reply.
    Identifying,
    /// Handshake complete; commands flow.
    Connected,
    /// A loop failed; the socket is being torn down.
    Died,
    /// Backing off between reconnection attempts.
    Reconnecting,
    /// The retry budget ran out. Terminal.
    Failed,
    /// Closed by its owner. Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Identifying => "identifying",
            ConnectionState::Connected => "connected",
            ConnectionState::Died => "died",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Strategy run after every successful handshake, including reconnects.
///
/// Runs synchronously while the loops are already up; it should only queue
/// commands through [`Link::send`] and [`Link::replenish`].
pub trait AfterConnect: Send + Sync + 'static {
    /// Prepares a freshly identified session.
    fn after_connect(&self, link: &Link) -> Result<()>;
}

/// Subscribes to a topic/channel pair and grants a full ceiling of credit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    topic: String,
    channel: String,
}

impl Subscription {
    /// Validates the names and builds the strategy.
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Result<Self> {
        let topic = topic.into();
        let channel = channel.into();
        protocol::validate_topic_name(&topic)?;
        protocol::validate_channel_name(&channel)?;
        Ok(Self { topic, channel })
    }

    /// Topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl AfterConnect for Subscription {
    fn after_connect(&self, link: &Link) -> Result<()> {
        info!(
            "Subscribing to {}/{} on {}:{}",
            self.topic,
            self.channel,
            link.host(),
            link.port()
        );
        link.send(Command::Sub {
            topic: self.topic.clone(),
            channel: self.channel.clone(),
        })?;
        link.replenish()
    }
}

/// Knobs for a [`Connection`].
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Initial credit ceiling.
    pub max_in_flight: u64,
    /// Message timeout requested in IDENTIFY.
    pub msg_timeout: Duration,
    /// Heartbeat interval requested in IDENTIFY.
    pub heartbeat_interval: Duration,
    /// Bound on a single socket read; `None` means half the heartbeat interval.
    pub read_timeout: Option<Duration>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Time allowed for the IDENTIFY reply.
    pub handshake_timeout: Duration,
    /// Pause after a successful reconnect.
    pub reconnect_pause: Duration,
    /// Backoff for the first connect and for reconnects.
    pub retry: RetryPolicy,
    /// Overrides the client id sent in IDENTIFY.
    pub client_id: Option<String>,
    /// Overrides the hostname sent in IDENTIFY.
    pub hostname: Option<String>,
    /// User agent sent in IDENTIFY.
    pub user_agent: String,
    /// Where delivered messages go.
    pub inbound: Option<mpsc::UnboundedSender<Message>>,
    /// Strategy run after each handshake.
    pub after_connect: Option<Arc<dyn AfterConnect>>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            msg_timeout: Duration::from_millis(DEFAULT_MSG_TIMEOUT_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            read_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            reconnect_pause: DEFAULT_RECONNECT_PAUSE,
            retry: RetryPolicy::default(),
            client_id: None,
            hostname: None,
            user_agent: USER_AGENT.to_string(),
            inbound: None,
            after_connect: None,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("max_in_flight", &self.max_in_flight)
            .field("msg_timeout", &self.msg_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("read_timeout", &self.read_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("reconnect_pause", &self.reconnect_pause)
            .field("retry", &self.retry)
            .field("client_id", &self.client_id)
            .field("hostname", &self.hostname)
            .field("user_agent", &self.user_agent)
            .field("inbound", &self.inbound.is_some())
            .field("after_connect", &self.after_connect.is_some())
            .finish()
    }
}

impl ConnectionOptions {
    /// Sets the credit ceiling.
    pub fn with_max_in_flight(mut self, max_in_flight: u64) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Sets the message timeout requested in IDENTIFY.
    pub fn with_msg_timeout(mut self, msg_timeout: Duration) -> Self {
        self.msg_timeout = msg_timeout;
        self
    }

    /// Sets the heartbeat interval requested in IDENTIFY.
    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Bounds each socket read explicitly.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }

    /// Sets the TCP connect timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Sets the time allowed for the IDENTIFY reply.
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Sets the pause after a successful reconnect.
    pub fn with_reconnect_pause(mut self, reconnect_pause: Duration) -> Self {
        self.reconnect_pause = reconnect_pause;
        self
    }

    /// Sets the backoff policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the client id sent in IDENTIFY.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Overrides the hostname sent in IDENTIFY.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Sets where delivered messages go.
    pub fn with_inbound(mut self, inbound: mpsc::UnboundedSender<Message>) -> Self {
        self.inbound = Some(inbound);
        self
    }

    /// Sets the strategy run after each handshake.
    pub fn with_after_connect(mut self, hook: impl AfterConnect) -> Self {
        self.after_connect = Some(Arc::new(hook));
        self
    }

    /// Read bound actually used by the read loop.
    pub fn effective_read_timeout(&self) -> Duration {
        self.read_timeout.unwrap_or(self.heartbeat_interval / 2)
    }

    /// Builds the IDENTIFY body, resolving the local identity if needed.
    async fn identify_config(&self) -> IdentifyConfig {
        let hostname = match &self.hostname {
            Some(hostname) => hostname.clone(),
            None => local_hostname(),
        };
        let client_id = match &self.client_id {
            Some(client_id) => client_id.clone(),
            None => resolve_client_id(&hostname).await,
        };

        IdentifyConfig::new(client_id, hostname, self.user_agent.clone())
            .with_msg_timeout(self.msg_timeout.as_millis() as u64)
            .with_heartbeat_interval(self.heartbeat_interval.as_millis() as u64)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// First address the hostname resolves to, or the hostname itself.
async fn resolve_client_id(hostname: &str) -> String {
    match tokio::net::lookup_host((hostname, 0)).await {
        Ok(mut addrs) => addrs
            .next()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| hostname.to_string()),
        Err(e) => {
            warn!("Could not resolve {}: {}", hostname, e);
            hostname.to_string()
        }
    }
}

/// Handle to a self-healing daemon connection.
///
/// Dropping the handle closes the connection in the background; call
/// [`Connection::close`] to wait for CLS to be written.
pub struct Connection {
    link: Arc<Link>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("link", &self.link).finish()
    }
}

impl Connection {
    /// Connects, identifies and runs the after-connect strategy.
    ///
    /// Failed attempts are retried under `options.retry`; once that budget
    /// is spent the last error is returned as
    /// [`ConnectionError::RetriesExhausted`].
    pub async fn open(host: impl Into<String>, port: u16, options: ConnectionOptions) -> Result<Self> {
        let host = host.into();
        let identify = options.identify_config().await;
        let retry = options.retry.clone();
        let (link, deaths) = Link::new(host, port, identify, options);
        let shutdown = CancellationToken::new();

        info!("Connecting to nsqd at {}:{}", link.host(), link.port());
        let first = retry
            .retry(&shutdown, |attempt| {
                if attempt > 1 {
                    info!(attempt, "Retrying connection to {}:{}", link.host(), link.port());
                }
                session::establish(Arc::clone(&link))
            })
            .await;

        let session = match first {
            Ok(session) => session,
            Err(e) => {
                link.set_state(ConnectionState::Failed);
                return Err(e);
            }
        };

        let monitor = tokio::spawn(monitor::run(
            Arc::clone(&link),
            session,
            deaths,
            shutdown.clone(),
        ));

        Ok(Self {
            link,
            shutdown,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    /// Opens a consumer connection delivering into `inbound`.
    pub async fn subscribe(
        host: impl Into<String>,
        port: u16,
        topic: impl Into<String>,
        channel: impl Into<String>,
        inbound: mpsc::UnboundedSender<Message>,
        options: ConnectionOptions,
    ) -> Result<Self> {
        let subscription = Subscription::new(topic, channel)?;
        let options = options
            .with_inbound(inbound)
            .with_after_connect(subscription);
        Self::open(host, port, options).await
    }

    /// Queues a PUB.
    pub fn publish(&self, topic: impl Into<String>, body: impl Into<Bytes>) -> Result<()> {
        self.link.send(Command::publish(topic, body)?)
    }

    /// Queues an MPUB; an empty batch is rejected.
    pub fn publish_batch(&self, topic: impl Into<String>, bodies: Vec<Bytes>) -> Result<()> {
        self.link.send(Command::multi_publish(topic, bodies)?)
    }

    /// Changes the credit ceiling.
    ///
    /// A subscribed, connected consumer is re-issued credit right away;
    /// otherwise the new ceiling applies at the next RDY.
    pub fn set_max_in_flight(&self, max_in_flight: u64) -> Result<()> {
        self.link.set_max_in_flight(max_in_flight);
        if self.link.after_connect().is_some() && self.state() == ConnectionState::Connected {
            self.link.replenish()?;
        }
        Ok(())
    }

    /// Credit ceiling.
    pub fn max_in_flight(&self) -> u64 {
        self.link.max_in_flight()
    }

    /// Credit believed to be consumed.
    pub fn presumed_in_flight(&self) -> u64 {
        self.link.presumed_in_flight()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Watches lifecycle transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.link.watch_state()
    }

    /// The shared link, for custom [`AfterConnect`] strategies and tests.
    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// Sends CLS, drains pending commands and closes the socket.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let monitor = self.monitor.lock().await.take();
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                warn!("Connection monitor ended abnormally: {}", e);
            }
        }
        self.link.set_state(ConnectionState::Closed);
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    pub(crate) use super::link::tests::detached_link;
}
