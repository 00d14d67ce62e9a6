//! In-process stand-in for nsqd, speaking the V2 protocol over loopback TCP.
//!
//! It answers IDENTIFY, SUB, PUB and MPUB with OK, delivers queued bodies
//! to subscribed peers within their RDY credit, and records every command
//! it receives so tests can assert on what the client wrote.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes, BytesMut};
use protocol::{Command, Frame, FrameCodec, MessageId, RawMessage, MAGIC_V2};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long `wait_for` polls before failing the test.
const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// How the fake answers the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handshake {
    #[default]
    Accept,
    /// Reply to IDENTIFY with an Error frame and hang up.
    Reject,
}

#[derive(Debug)]
enum Control {
    Kill,
    Wake,
    Frame(Frame),
}

#[derive(Default)]
struct Shared {
    handshake: Handshake,
    identify_delay: Mutex<Duration>,
    received: Mutex<Vec<(usize, Command)>>,
    pending: Mutex<VecDeque<Bytes>>,
    peers: Mutex<Vec<mpsc::UnboundedSender<Control>>>,
    accepted: AtomicUsize,
    next_id: AtomicU64,
}

impl Shared {
    fn record(&self, peer: usize, command: Command) {
        self.received.lock().unwrap().push((peer, command));
    }

    fn broadcast(&self, make: impl Fn() -> Control) {
        for peer in self.peers.lock().unwrap().iter() {
            let _ = peer.send(make());
        }
    }

    fn enqueue(&self, body: Bytes) {
        self.pending.lock().unwrap().push_back(body);
        self.broadcast(|| Control::Wake);
    }

    fn pop_pending(&self) -> Option<Bytes> {
        self.pending.lock().unwrap().pop_front()
    }

    fn next_id(&self) -> MessageId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let text = format!("{:016}", n);
        MessageId::from_slice(text.as_bytes()).unwrap()
    }
}

/// Handle to a running fake daemon.
pub struct FakeNsqd {
    addr: SocketAddr,
    shared: Arc<Shared>,
    acceptor: JoinHandle<()>,
}

impl FakeNsqd {
    pub async fn start() -> Self {
        Self::start_with(Handshake::Accept).await
    }

    pub async fn start_with(handshake: Handshake) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            handshake,
            ..Shared::default()
        });

        let acceptor = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        Self {
            addr,
            shared,
            acceptor,
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Queues a body for delivery to subscribed peers.
    pub fn enqueue(&self, body: impl Into<Bytes>) {
        self.shared.enqueue(body.into());
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Every command received, tagged with the 0-based connection index.
    pub fn commands(&self) -> Vec<(usize, Command)> {
        self.shared.received.lock().unwrap().clone()
    }

    /// Commands received on one connection.
    pub fn commands_on(&self, peer: usize) -> Vec<Command> {
        self.commands()
            .into_iter()
            .filter(|(index, _)| *index == peer)
            .map(|(_, command)| command)
            .collect()
    }

    /// Holds back the reply to every later IDENTIFY by `delay`.
    pub fn set_identify_delay(&self, delay: Duration) {
        *self.shared.identify_delay.lock().unwrap() = delay;
    }

    /// Drops every open socket without a goodbye.
    pub fn kill_connections(&self) {
        self.shared.broadcast(|| Control::Kill);
    }

    pub fn send_heartbeat(&self) {
        self.shared
            .broadcast(|| Control::Frame(Frame::Response(Bytes::from_static(b"_heartbeat_"))));
    }

    pub fn send_error(&self, text: &'static str) {
        self.shared
            .broadcast(|| Control::Frame(Frame::Error(Bytes::from_static(text.as_bytes()))));
    }

    /// Stops accepting and drops every open socket.
    pub fn shutdown(&self) {
        self.acceptor.abort();
        self.kill_connections();
    }

    /// Polls the command log until `done` holds.
    pub async fn wait_for(
        &self,
        what: &str,
        done: impl Fn(&[(usize, Command)]) -> bool,
    ) -> Vec<(usize, Command)> {
        let deadline = Instant::now() + WAIT_LIMIT;
        loop {
            let commands = self.commands();
            if done(&commands) {
                return commands;
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for {}; received {:?}", what, commands);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for FakeNsqd {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let index = shared.accepted.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        shared.peers.lock().unwrap().push(tx);
        tokio::spawn(serve(stream, index, Arc::clone(&shared), rx));
    }
}

struct Peer {
    index: usize,
    shared: Arc<Shared>,
    writer: OwnedWriteHalf,
    credit: u64,
    in_flight: HashMap<MessageId, Bytes>,
    subscribed: bool,
    closing: bool,
}

async fn serve(
    stream: TcpStream,
    index: usize,
    shared: Arc<Shared>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let (mut reader, writer) = stream.into_split();

    let mut magic = [0u8; 4];
    if reader.read_exact(&mut magic).await.is_err() || magic != MAGIC_V2 {
        return;
    }

    let mut peer = Peer {
        index,
        shared,
        writer,
        credit: 0,
        in_flight: HashMap::new(),
        subscribed: false,
        closing: false,
    };
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        loop {
            match Command::try_decode(&buffer) {
                Ok(Some((command, used))) => {
                    buffer.advance(used);
                    match peer.handle(command).await {
                        Ok(true) => {}
                        _ => return,
                    }
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
        if peer.deliver().await.is_err() {
            return;
        }

        tokio::select! {
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
            control = control.recv() => match control {
                Some(Control::Wake) => {}
                Some(Control::Frame(frame)) => {
                    if peer.write(&frame).await.is_err() {
                        return;
                    }
                }
                Some(Control::Kill) | None => return,
            },
        }
    }
}

impl Peer {
    async fn write(&mut self, frame: &Frame) -> std::io::Result<()> {
        let bytes = FrameCodec::new().encode(frame);
        self.writer.write_all(&bytes).await
    }

    async fn ok(&mut self) -> std::io::Result<()> {
        self.write(&Frame::Response(Bytes::from_static(b"OK"))).await
    }

    /// Returns whether the socket should stay open.
    async fn handle(&mut self, command: Command) -> std::io::Result<bool> {
        self.shared.record(self.index, command.clone());

        match command {
            Command::Identify(_) => {
                let delay = *self.shared.identify_delay.lock().unwrap();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if self.shared.handshake == Handshake::Reject {
                    self.write(&Frame::Error(Bytes::from_static(b"E_BAD_BODY rejected")))
                        .await?;
                    return Ok(false);
                }
                self.ok().await?;
            }
            Command::Sub { .. } => {
                self.subscribed = true;
                self.ok().await?;
            }
            Command::Rdy(count) => self.credit = count,
            Command::Fin(id) => {
                self.in_flight.remove(&id);
            }
            Command::Req { id, .. } => {
                if let Some(body) = self.in_flight.remove(&id) {
                    self.shared.enqueue(body);
                }
            }
            Command::Touch(_) | Command::Nop => {}
            Command::Pub { body, .. } => {
                self.shared.enqueue(body);
                self.ok().await?;
            }
            Command::Mpub { bodies, .. } => {
                for body in bodies {
                    self.shared.enqueue(body);
                }
                self.ok().await?;
            }
            Command::Cls => {
                self.closing = true;
                self.write(&Frame::Response(Bytes::from_static(b"CLOSE_WAIT")))
                    .await?;
            }
        }
        Ok(true)
    }

    async fn deliver(&mut self) -> std::io::Result<()> {
        if !self.subscribed || self.closing {
            return Ok(());
        }
        while (self.in_flight.len() as u64) < self.credit {
            let Some(body) = self.shared.pop_pending() else {
                break;
            };
            let raw = RawMessage {
                timestamp: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap()
                    .as_nanos() as u64,
                attempts: 1,
                id: self.shared.next_id(),
                body,
            };
            self.in_flight.insert(raw.id, raw.body.clone());
            self.write(&Frame::Message(raw.encode())).await?;
        }
        Ok(())
    }
}

/// Number of commands in `commands` matching `predicate`.
pub fn count(commands: &[Command], predicate: impl Fn(&Command) -> bool) -> usize {
    commands.iter().filter(|command| predicate(command)).count()
}
