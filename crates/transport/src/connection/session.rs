//! One socket's worth of connection: handshake, read loop, write loop.

use std::sync::Arc;
use std::time::Duration;

use protocol::{Command, Frame, ProtocolError, RawMessage, MAGIC_V2};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{ConnectionState, Link};
use crate::error::{ConnectionError, Result};
use crate::message::Message;
use crate::reader::FrameReader;

/// Response the daemon sends after CLS once in-flight messages settle.
const CLOSE_WAIT_RESPONSE: &[u8] = b"CLOSE_WAIT";

/// How long teardown waits for each loop to stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// How the write loop should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopMode {
    /// Write whatever is already queued first.
    Drain,
    /// Stop right away.
    Abort,
}

/// Handles to the tasks serving one socket.
pub(crate) struct Session {
    stop_read: CancellationToken,
    stop_write: Option<oneshot::Sender<StopMode>>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<Option<OwnedWriteHalf>>,
}

/// Connects, identifies and starts the loops.
pub(crate) async fn establish(link: Arc<Link>) -> Result<Session> {
    let options = link.options();

    link.set_state(ConnectionState::Connecting);
    let stream = timeout(
        options.connect_timeout,
        TcpStream::connect((link.host(), link.port())),
    )
    .await
    .map_err(|_| {
        ProtocolError::Timeout(format!("connecting to {}:{}", link.host(), link.port()))
    })?
    .map_err(ProtocolError::from)?;
    stream.set_nodelay(true).map_err(ProtocolError::from)?;

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    write_half
        .write_all(&MAGIC_V2)
        .await
        .map_err(ProtocolError::from)?;

    link.set_state(ConnectionState::Identifying);
    timeout(
        options.handshake_timeout,
        identify(&link, &mut reader, &mut write_half),
    )
    .await
    .map_err(|_| ProtocolError::Timeout("waiting for IDENTIFY response".to_string()))??;

    // Anything but publishes queued since the last teardown was meant for
    // the old socket; the new one must see SUB before any FIN or RDY.
    let session_id = link.begin_session();
    link.salvage_outbound().await;
    link.set_state(ConnectionState::Connected);
    info!(
        session = session_id,
        "Connected to nsqd at {}:{}",
        link.host(),
        link.port()
    );

    let session = Session::start(&link, reader, write_half);

    if let Some(hook) = link.after_connect() {
        if let Err(e) = hook.after_connect(&link) {
            warn!("After-connect strategy failed: {}", e);
            session.shutdown(StopMode::Abort, false).await;
            return Err(e);
        }
    }

    Ok(session)
}

/// Sends IDENTIFY and waits for OK, answering heartbeats meanwhile.
async fn identify(
    link: &Link,
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
) -> Result<()> {
    let command = Command::Identify(link.identify().clone()).encode()?;
    writer
        .write_all(&command)
        .await
        .map_err(ProtocolError::from)?;

    loop {
        let frame = reader.read_frame().await?;
        if frame.is_ok() {
            debug!("IDENTIFY accepted");
            return Ok(());
        }
        if frame.is_heartbeat() {
            trace!("heartbeat during handshake");
            let nop = Command::Nop.encode()?;
            writer.write_all(&nop).await.map_err(ProtocolError::from)?;
            continue;
        }

        let reason = match &frame {
            Frame::Error(_) => format!("daemon error {}", frame.payload_text()),
            Frame::Response(_) => format!("unexpected response {:?}", frame.payload_text()),
            Frame::Message(_) => "message frame before IDENTIFY completed".to_string(),
        };
        return Err(ProtocolError::HandshakeFailed(reason).into());
    }
}

impl Session {
    fn start(
        link: &Arc<Link>,
        reader: FrameReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> Self {
        let stop_read = CancellationToken::new();
        let (stop_write, stop_write_rx) = oneshot::channel();

        let read_task = tokio::spawn(read_loop(Arc::clone(link), reader, stop_read.clone()));
        let write_task = tokio::spawn(write_loop(Arc::clone(link), writer, stop_write_rx));

        Self {
            stop_read,
            stop_write: Some(stop_write),
            read_task,
            write_task,
        }
    }

    /// Stops both loops and closes the socket, writing CLS first if asked
    /// and the write half is still usable.
    pub(crate) async fn shutdown(mut self, mode: StopMode, send_cls: bool) {
        self.stop_read.cancel();
        if let Some(stop_write) = self.stop_write.take() {
            let _ = stop_write.send(mode);
        }

        let writer = match timeout(STOP_GRACE, &mut self.write_task).await {
            Ok(Ok(writer)) => writer,
            Ok(Err(e)) => {
                warn!("Write loop panicked: {}", e);
                None
            }
            Err(_) => {
                warn!("Write loop did not stop in time, aborting");
                self.write_task.abort();
                None
            }
        };

        if let Some(mut writer) = writer {
            if send_cls {
                match Command::Cls.encode() {
                    Ok(cls) => {
                        let written = timeout(STOP_GRACE, writer.write_all(&cls)).await;
                        if !matches!(written, Ok(Ok(()))) {
                            debug!("Could not write CLS to closing socket");
                        }
                    }
                    Err(e) => warn!("Failed to encode CLS: {}", e),
                }
            }
            let _ = writer.shutdown().await;
        }

        if timeout(STOP_GRACE, &mut self.read_task).await.is_err() {
            warn!("Read loop did not stop in time, aborting");
            self.read_task.abort();
        }
    }
}

async fn read_loop(link: Arc<Link>, mut reader: FrameReader<OwnedReadHalf>, stop: CancellationToken) {
    let read_timeout = link.options().effective_read_timeout();
    let idle_limit = link.heartbeat_interval() * 2;
    let mut last_frame = Instant::now();

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => {
                debug!("Read loop stopped");
                return;
            }
            next = timeout(read_timeout, reader.read_frame()) => next,
        };

        let outcome: Result<()> = match next {
            Err(_) if last_frame.elapsed() >= idle_limit => Err(ProtocolError::Timeout(format!(
                "no frame from daemon in {:?}",
                last_frame.elapsed()
            ))
            .into()),
            Err(_) => {
                trace!("read timed out, poking daemon with NOP");
                link.send(Command::Nop)
            }
            Ok(Ok(frame)) => {
                last_frame = Instant::now();
                dispatch(&link, frame)
            }
            Ok(Err(e)) => Err(e.into()),
        };

        if let Err(e) = outcome {
            link.signal_death("read loop", e);
            return;
        }
    }
}

/// Handles one frame received after the handshake.
fn dispatch(link: &Arc<Link>, frame: Frame) -> Result<()> {
    if frame.is_heartbeat() {
        trace!("heartbeat");
        return link.send(Command::Nop);
    }
    if frame.is_ok() {
        return Ok(());
    }

    match frame {
        Frame::Response(payload) if payload.as_ref() == CLOSE_WAIT_RESPONSE => {
            debug!("Daemon acknowledged CLS");
            Ok(())
        }
        Frame::Response(payload) => Err(ProtocolError::UnexpectedResponse(
            String::from_utf8_lossy(&payload).into_owned(),
        )
        .into()),
        Frame::Error(payload) => {
            warn!(
                "nsqd {}:{} reported error: {}",
                link.host(),
                link.port(),
                String::from_utf8_lossy(&payload)
            );
            Ok(())
        }
        Frame::Message(payload) => {
            let raw = RawMessage::decode(&payload)?;
            trace!(id = %raw.id, attempts = raw.attempts, "message");
            link.deliver(Message::new(raw, link));
            Ok(())
        }
    }
}

async fn write_loop(
    link: Arc<Link>,
    mut writer: OwnedWriteHalf,
    mut stop: oneshot::Receiver<StopMode>,
) -> Option<OwnedWriteHalf> {
    let queue = link.outbound_queue();
    let mut queue = queue.lock().await;

    for command in link.take_carried() {
        if let Err(e) = write_command(&mut writer, &command).await {
            link.signal_death("write loop", e);
            return None;
        }
    }

    loop {
        tokio::select! {
            biased;
            mode = &mut stop => {
                if let Ok(StopMode::Drain) = mode {
                    while let Ok(command) = queue.try_recv() {
                        if let Err(e) = write_command(&mut writer, &command).await {
                            debug!("Dropped pending commands while draining: {}", e);
                            return None;
                        }
                    }
                }
                debug!("Write loop stopped");
                return Some(writer);
            }
            command = queue.recv() => {
                let Some(command) = command else {
                    return Some(writer);
                };
                if let Err(e) = write_command(&mut writer, &command).await {
                    link.signal_death("write loop", e);
                    return None;
                }
            }
        }
    }
}

/// Writes one command. Commands that fail to encode are logged and skipped.
async fn write_command(writer: &mut OwnedWriteHalf, command: &Command) -> Result<()> {
    let bytes = match command.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Skipping {} that failed to encode: {}", command.name(), e);
            return Ok(());
        }
    };
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| ConnectionError::from(ProtocolError::from(e)))?;
    trace!(command = command.name(), "sent");
    Ok(())
}
