//! Chat instance: username handshake, frame processing and local routing.
//!
//! Every accepted connection gets its own task. The first read is the
//! username; everything after it is newline-delimited JSON handled by
//! [`JsonLineCodec`]. Each frame is stamped by the instance's Lamport clock
//! and routed against this instance's registry only.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use futures::SinkExt;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, info, warn};

use super::clock::LamportClock;
use super::codec::JsonLineCodec;
use super::message::{AckStatus, ChatMessage, ClientFrame, FrameKind, Reply};
use super::registry::{ClientHandle, ConnectionId, ConnectionRegistry, Outbound};
use super::replication::Replicator;
use crate::config::ServerConfig;

/// Maximum size of the username handshake read.
pub const HANDSHAKE_MAX: usize = 1024;

/// State shared by all connection tasks of one instance.
#[derive(Debug)]
pub struct InstanceState {
    /// Label used in logs.
    pub name: String,
    pub registry: ConnectionRegistry,
    pub clock: LamportClock,
    pub replicator: Option<Replicator>,
    next_connection: AtomicU64,
}

impl InstanceState {
    pub fn new(name: impl Into<String>, replicator: Option<Replicator>) -> Self {
        Self {
            name: name.into(),
            registry: ConnectionRegistry::new(),
            clock: LamportClock::new(),
            replicator,
            next_connection: AtomicU64::new(1),
        }
    }

    fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }
}

/// Shared, thread-safe instance state.
pub type SharedState = Arc<InstanceState>;

/// A bound chat instance, ready to [`run`](ChatServer::run).
pub struct ChatServer {
    listener: TcpListener,
    state: SharedState,
}

impl ChatServer {
    /// Bind the listener so port conflicts fail fast.
    pub async fn bind(config: &ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let replicator = config
            .replicate_to
            .map(|sink| Replicator::new(sink, config.replication_timeout));
        info!(
            name = %config.name,
            addr = %listener.local_addr()?,
            replicate_to = ?config.replicate_to,
            "chat instance listening"
        );
        Ok(Self {
            listener,
            state: Arc::new(InstanceState::new(config.name.clone(), replicator)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Accept loop. Never returns under normal operation.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (socket, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(name = %self.state.name, error = %e, "accept error");
                    continue;
                }
            };
            debug!(name = %self.state.name, %addr, "new connection");
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(e) = handle_client(socket, addr, state).await {
                    warn!(%addr, "client error: {e}");
                }
            });
        }
    }
}

/// Read the username handshake.
///
/// The username is the first read, up to the first newline if there is one.
/// Bytes after that newline stay in `buf` as the start of the framed stream.
/// Returns `None` for a zero-byte or blank handshake.
async fn read_handshake(
    socket: &mut TcpStream,
    buf: &mut BytesMut,
) -> std::io::Result<Option<String>> {
    let n = socket.read_buf(buf).await?;
    if n == 0 {
        return Ok(None);
    }

    let raw = match buf.iter().position(|b| *b == b'\n') {
        Some(pos) => {
            let line = buf.split_to(pos);
            buf.advance(1);
            line
        }
        None => buf.split(),
    };

    let username = String::from_utf8_lossy(&raw).trim().to_owned();
    Ok((!username.is_empty()).then_some(username))
}

/// Handle a single client connection.
async fn handle_client(
    mut socket: TcpStream,
    addr: SocketAddr,
    state: SharedState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_MAX);
    let Some(username) = read_handshake(&mut socket, &mut buf).await? else {
        debug!(name = %state.name, %addr, "empty handshake, dropping connection");
        return Ok(());
    };

    let id = state.next_connection_id();
    let (handle, rx) = ClientHandle::new(id, username.clone(), addr);
    if let Some(old) = state.registry.register(handle).await {
        info!(
            name = %state.name,
            %username,
            old_addr = %old.addr,
            "username re-registered, superseding previous connection"
        );
    }
    info!(name = %state.name, %username, %addr, "connected");

    let mut parts = FramedParts::new::<Reply>(socket, JsonLineCodec);
    parts.read_buf = buf;
    let framed = Framed::from_parts(parts);

    let result = session(framed, rx, &username, &state).await;

    // Clean up on disconnect.
    state.registry.remove(&username, id).await;
    info!(name = %state.name, %username, %addr, "disconnected");
    result
}

/// Frame loop for a registered connection.
async fn session(
    mut framed: Framed<TcpStream, JsonLineCodec>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Outbound>,
    username: &str,
    state: &InstanceState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        tokio::select! {
            // Incoming frame from the client's TCP stream.
            frame = framed.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()), // Connection closed.
                };
                let reply = process_frame(state, username, frame).await;
                framed.send(reply).await?;
            }

            // Deliveries from other connections, or a supersede notice.
            out = rx.recv() => match out {
                Some(Outbound::Reply(reply)) => framed.send(reply).await?,
                Some(Outbound::Superseded) | None => {
                    debug!(%username, "superseded by a newer connection");
                    return Ok(());
                }
            }
        }
    }
}

/// Stamp one frame, route it, and return the reply for its sender.
pub async fn process_frame(state: &InstanceState, sender: &str, frame: ClientFrame) -> Reply {
    let clock = state.clock.tick();
    let msg = ChatMessage::from_frame(sender, frame, clock, chrono::Utc::now().timestamp());

    match msg.kind {
        FrameKind::Private => {
            replicate(state, &msg);
            let delivered = match state.registry.lookup(&msg.target).await {
                Some(target) => target.deliver(msg.delivery()),
                None => false,
            };
            debug!(from = %msg.sender, to = %msg.target, clock, delivered, "private");
            Reply::ack(if delivered {
                AckStatus::Delivered
            } else {
                AckStatus::Offline
            })
        }
        FrameKind::Join => Reply::info(format!("joined {}", msg.target)),
        FrameKind::Group => {
            replicate(state, &msg);
            debug!(from = %msg.sender, group = %msg.target, clock, "group");
            Reply::ack(AckStatus::GroupSent)
        }
    }
}

fn replicate(state: &InstanceState, msg: &ChatMessage) {
    if let (Some(replicator), Some(record)) = (&state.replicator, msg.replication_record()) {
        // Detached; the outcome is logged by the replication task.
        drop(replicator.replicate(record));
    }
}
