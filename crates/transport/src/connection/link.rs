//! State shared by a connection's tasks and the handles given to callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use protocol::{Command, IdentifyConfig, MessageId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::{AfterConnect, ConnectionOptions, ConnectionState};
use crate::error::{ConnectionError, Result};
use crate::flow::FlowController;
use crate::message::Message;

/// Why a read or write loop gave up on its socket.
#[derive(Debug)]
pub(crate) struct DeathSignal {
    /// Which loop reported the failure.
    pub source: &'static str,
    /// The failure itself.
    pub error: ConnectionError,
}

/// Shared half of a connection.
///
/// The outbound queue is the only path to the socket: any task may push,
/// and only the write loop of the current session pops. Messages keep a
/// weak reference to this type so they can be acknowledged without keeping
/// the connection alive, plus the number of the socket that delivered them;
/// acks are only accepted for messages from the socket currently connected.
pub struct Link {
    host: String,
    port: u16,
    identify: IdentifyConfig,
    options: ConnectionOptions,
    outbound_tx: mpsc::UnboundedSender<Command>,
    outbound_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Command>>>,
    /// Publishes salvaged from a dead session, written first by the next one.
    carried: Mutex<Vec<Command>>,
    death_tx: mpsc::UnboundedSender<DeathSignal>,
    flow: Mutex<FlowController>,
    state: watch::Sender<ConnectionState>,
    /// Bumped each time a socket completes the handshake.
    session: AtomicU64,
    inbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Link {
    /// Creates the shared state and the receiving end of the death queue.
    pub(crate) fn new(
        host: String,
        port: u16,
        identify: IdentifyConfig,
        mut options: ConnectionOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DeathSignal>) {
        // Held only here so that closing the inbound queue really ends it.
        let inbound = options.inbound.take();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (death_tx, death_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let link = Arc::new(Self {
            host,
            port,
            identify,
            flow: Mutex::new(FlowController::new(options.max_in_flight)),
            inbound: Mutex::new(inbound),
            options,
            outbound_tx,
            outbound_rx: Arc::new(tokio::sync::Mutex::new(outbound_rx)),
            carried: Mutex::new(Vec::new()),
            death_tx,
            state,
            session: AtomicU64::new(0),
        });
        (link, death_rx)
    }

    /// Daemon host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Daemon port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{}:{} {} -> {}", self.host, self.port, previous, state);
        }
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub(crate) fn identify(&self) -> &IdentifyConfig {
        &self.identify
    }

    pub(crate) fn after_connect(&self) -> Option<&Arc<dyn AfterConnect>> {
        self.options.after_connect.as_ref()
    }

    /// Timeout the daemon applies to delivered messages.
    pub fn msg_timeout(&self) -> Duration {
        Duration::from_millis(self.identify.msg_timeout)
    }

    /// Interval at which the daemon sends heartbeats.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.identify.heartbeat_interval)
    }

    /// Credit ceiling.
    pub fn max_in_flight(&self) -> u64 {
        lock(&self.flow).max_in_flight()
    }

    /// Credit believed to be consumed.
    pub fn presumed_in_flight(&self) -> u64 {
        lock(&self.flow).presumed_in_flight()
    }

    pub(crate) fn set_max_in_flight(&self, max_in_flight: u64) {
        lock(&self.flow).set_max_in_flight(max_in_flight);
    }

    /// Number of the socket currently serving the connection.
    pub(crate) fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Starts a new socket generation. Messages from earlier ones go stale.
    pub(crate) fn begin_session(&self) -> u64 {
        self.session.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fails unless `session` is the live, connected socket.
    fn ensure_current(&self, session: u64, id: MessageId) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(ConnectionError::Closed);
        }
        if state != ConnectionState::Connected || self.session_id() != session {
            debug!(
                %id,
                session,
                current = self.session_id(),
                %state,
                "refusing command for stale message"
            );
            return Err(ConnectionError::StaleMessage { id });
        }
        Ok(())
    }

    /// Queues a command about message `id`, delivered on socket `session`.
    pub(crate) fn send_for(&self, session: u64, id: MessageId, command: Command) -> Result<()> {
        self.ensure_current(session, id)?;
        self.send(command)
    }

    /// Queues a command for the write loop.
    pub fn send(&self, command: Command) -> Result<()> {
        if self.state().is_terminal() {
            return Err(ConnectionError::Closed);
        }
        trace!(command = command.name(), "queued");
        self.outbound_tx
            .send(command)
            .map_err(|_| ConnectionError::Closed)
    }

    /// Queues RDY for the full ceiling and presumes it consumed.
    pub fn replenish(&self) -> Result<()> {
        let mut flow = lock(&self.flow);
        let count = flow.replenish();
        self.send(Command::Rdy(count))
    }

    /// Queues a FIN or REQ for message `id`, then re-issues credit if the
    /// low-water mark was reached.
    ///
    /// The flow lock is held across both pushes so the RDY always follows
    /// the ack that triggered it. Acks for messages from an earlier socket
    /// touch neither the queue nor the flow accounting.
    pub(crate) fn ack(&self, session: u64, id: MessageId, command: Command) -> Result<()> {
        let mut flow = lock(&self.flow);
        self.ensure_current(session, id)?;
        self.send(command)?;
        let outcome = flow.on_ack_sent();
        if let Some(count) = outcome.rdy {
            debug!(
                presumed_in_flight = outcome.presumed_in_flight,
                count, "re-issuing credit"
            );
            self.send(Command::Rdy(count))?;
        }
        Ok(())
    }

    pub(crate) fn signal_death(&self, source: &'static str, error: ConnectionError) {
        // The monitor owns the receiver for as long as reconnection matters.
        let _ = self.death_tx.send(DeathSignal { source, error });
    }

    /// Hands a delivered message to the caller's inbound queue.
    pub(crate) fn deliver(&self, message: Message) {
        let inbound = lock(&self.inbound);
        match inbound.as_ref() {
            Some(tx) => {
                if tx.send(message).is_err() {
                    warn!("inbound queue closed, dropping message");
                }
            }
            None => warn!(id = %message.id(), "message received with no inbound queue"),
        }
    }

    /// Releases the inbound queue so consumers see the end of the stream.
    pub(crate) fn close_inbound(&self) {
        lock(&self.inbound).take();
    }

    pub(crate) fn outbound_queue(
        &self,
    ) -> Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Command>>> {
        Arc::clone(&self.outbound_rx)
    }

    pub(crate) fn take_carried(&self) -> Vec<Command> {
        std::mem::take(&mut *lock(&self.carried))
    }

    /// Sorts out the outbound queue after a session died, and once more
    /// right before the next session's loops start.
    ///
    /// Commands tied to the dead socket's protocol state are dropped; the
    /// next session re-subscribes and re-issues credit on its own, and
    /// message ids do not carry over. Publishes are kept.
    pub(crate) async fn salvage_outbound(&self) {
        let mut queue = self.outbound_rx.lock().await;
        let mut carried = lock(&self.carried);
        let mut dropped = 0usize;
        while let Ok(command) = queue.try_recv() {
            match command {
                Command::Pub { .. } | Command::Mpub { .. } => carried.push(command),
                _ => dropped += 1,
            }
        }
        if dropped > 0 || !carried.is_empty() {
            debug!(
                dropped,
                kept = carried.len(),
                "salvaged outbound queue after connection death"
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn drain_outbound(&self) -> Vec<Command> {
        let mut commands = self.take_carried();
        if let Ok(mut queue) = self.outbound_rx.try_lock() {
            while let Ok(command) = queue.try_recv() {
                commands.push(command);
            }
        }
        commands
    }
}
