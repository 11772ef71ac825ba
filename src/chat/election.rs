//! Bully leader election among chat instances.
//!
//! The protocol logic lives in [`BullyNode`], a pure state machine: it takes
//! messages, timer expiries and send failures, and returns the messages to
//! send. [`ElectionService`] owns one node, does the networking, and
//! publishes status through a `watch` channel.
//!
//! # Protocol
//!
//! - A node that starts, or loses its leader, sends `ELECTION` to every
//!   higher id and waits for an `OK`.
//! - No `OK` within the answer timeout: it is the leader and broadcasts
//!   `COORDINATOR`.
//! - An `OK` arrived: it steps down and waits for `COORDINATOR`; if none
//!   comes within the coordinator timeout it starts over.
//! - Followers send `ALIVE` to the leader on every heartbeat. A failed send
//!   means the leader is gone.
//!
//! The highest reachable id always ends up leader.
//!
//! # Wire format
//!
//! One TCP connection per message, carrying one JSON line:
//! `{"kind":"ELECTION","from":2,"addr":"127.0.0.1:7002"}`. The sender's
//! listen address rides along so members that were never configured (a new
//! or rejoining node) become reachable.
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ElectionConfig;

/// Cluster member identifier. Higher wins.
pub type NodeId = u32;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionKind {
    /// Candidacy announcement, sent to higher ids.
    Election,
    /// Deference from a higher id: "I'm alive, stand down".
    Ok,
    /// Leader announcement, sent to everyone.
    Coordinator,
    /// Follower → leader liveness probe.
    Alive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionMessage {
    pub kind: ElectionKind,
    pub from: NodeId,
    /// Where `from` listens for election traffic.
    pub addr: SocketAddr,
}

impl ElectionMessage {
    /// Serialize to a JSON line (JSON + `\n`).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line (strips trailing newline/whitespace).
    pub fn from_line(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim_end())
    }
}

/// A message addressed to one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub to: NodeId,
    pub addr: SocketAddr,
    pub message: ElectionMessage,
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON message: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Timing for the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTimeouts {
    /// How long a candidate waits for an `OK`.
    pub answer: Duration,
    /// How long a deferring node waits for `COORDINATOR`.
    pub coordinator: Duration,
    /// Interval between `ALIVE` probes to the leader.
    pub heartbeat: Duration,
    /// Connect+write budget for one message.
    pub send: Duration,
}

impl Default for ElectionTimeouts {
    fn default() -> Self {
        Self {
            answer: Duration::from_millis(300),
            coordinator: Duration::from_secs(1),
            heartbeat: Duration::from_millis(250),
            send: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingAnswers { deadline: Instant },
    AwaitingCoordinator { deadline: Instant },
}

/// Observable election state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionStatus {
    pub id: NodeId,
    pub role: Role,
    pub leader: Option<NodeId>,
}

/// Bully protocol state for one node. No I/O.
#[derive(Debug, Clone)]
pub struct BullyNode {
    id: NodeId,
    addr: SocketAddr,
    role: Role,
    leader: Option<NodeId>,
    /// Every other member we know of, configured or learned.
    members: BTreeMap<NodeId, SocketAddr>,
    phase: Phase,
    timeouts: ElectionTimeouts,
}

impl BullyNode {
    pub fn new(
        id: NodeId,
        addr: SocketAddr,
        peers: impl IntoIterator<Item = (NodeId, SocketAddr)>,
        timeouts: ElectionTimeouts,
    ) -> Self {
        let members = peers.into_iter().filter(|(peer, _)| *peer != id).collect();
        Self {
            id,
            addr,
            role: Role::Follower,
            leader: None,
            members,
            phase: Phase::Idle,
            timeouts,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn members(&self) -> &BTreeMap<NodeId, SocketAddr> {
        &self.members
    }

    pub fn status(&self) -> ElectionStatus {
        ElectionStatus {
            id: self.id,
            role: self.role,
            leader: self.leader,
        }
    }

    /// When the current wait (answers or coordinator) expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Idle => None,
            Phase::AwaitingAnswers { deadline } | Phase::AwaitingCoordinator { deadline } => {
                Some(deadline)
            }
        }
    }

    fn envelope(&self, to: NodeId, kind: ElectionKind) -> Option<Envelope> {
        let addr = *self.members.get(&to)?;
        Some(Envelope {
            to,
            addr,
            message: ElectionMessage {
                kind,
                from: self.id,
                addr: self.addr,
            },
        })
    }

    /// Announce candidacy to every higher member.
    pub fn start_election(&mut self, now: Instant) -> Vec<Envelope> {
        let higher: Vec<NodeId> = self
            .members
            .range(self.id.saturating_add(1)..)
            .map(|(id, _)| *id)
            .collect();
        if higher.is_empty() {
            return self.become_leader();
        }

        debug!(node = self.id, ?higher, "starting election");
        self.role = Role::Candidate;
        self.leader = None;
        self.phase = Phase::AwaitingAnswers {
            deadline: now + self.timeouts.answer,
        };
        higher
            .into_iter()
            .filter_map(|to| self.envelope(to, ElectionKind::Election))
            .collect()
    }

    fn become_leader(&mut self) -> Vec<Envelope> {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.phase = Phase::Idle;
        self.members
            .keys()
            .filter_map(|to| self.envelope(*to, ElectionKind::Coordinator))
            .collect()
    }

    /// Process one inbound message.
    pub fn handle(&mut self, msg: ElectionMessage, now: Instant) -> Vec<Envelope> {
        if msg.from == self.id {
            return Vec::new();
        }
        self.members.insert(msg.from, msg.addr);

        match msg.kind {
            ElectionKind::Election => {
                if msg.from > self.id {
                    return Vec::new();
                }
                let mut out: Vec<Envelope> =
                    self.envelope(msg.from, ElectionKind::Ok).into_iter().collect();
                if self.phase == Phase::Idle {
                    out.extend(self.start_election(now));
                }
                out
            }
            ElectionKind::Ok => {
                if msg.from > self.id && matches!(self.phase, Phase::AwaitingAnswers { .. }) {
                    self.role = Role::Follower;
                    self.phase = Phase::AwaitingCoordinator {
                        deadline: now + self.timeouts.coordinator,
                    };
                }
                Vec::new()
            }
            ElectionKind::Coordinator => {
                if msg.from > self.id {
                    self.role = Role::Follower;
                    self.leader = Some(msg.from);
                    self.phase = Phase::Idle;
                    Vec::new()
                } else if self.phase == Phase::Idle {
                    // A lower id claims leadership while we are up: bully back.
                    self.start_election(now)
                } else {
                    Vec::new()
                }
            }
            ElectionKind::Alive => Vec::new(),
        }
    }

    /// Fire any expired wait.
    pub fn on_deadline(&mut self, now: Instant) -> Vec<Envelope> {
        match self.phase {
            Phase::AwaitingAnswers { deadline } if now >= deadline => self.become_leader(),
            Phase::AwaitingCoordinator { deadline } if now >= deadline => {
                debug!(node = self.id, "no coordinator announced, re-running election");
                self.start_election(now)
            }
            _ => Vec::new(),
        }
    }

    /// Heartbeat tick: probe the leader, or elect one if there is none.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Envelope> {
        if self.phase != Phase::Idle {
            return Vec::new();
        }
        match self.leader {
            None => self.start_election(now),
            Some(leader) if leader != self.id => {
                self.envelope(leader, ElectionKind::Alive).into_iter().collect()
            }
            Some(_) => Vec::new(),
        }
    }

    /// A message to `to` could not be delivered.
    pub fn on_send_failed(&mut self, to: NodeId, now: Instant) -> Vec<Envelope> {
        if self.leader == Some(to) && to != self.id && self.phase == Phase::Idle {
            info!(node = self.id, leader = to, "leader unreachable, starting election");
            self.leader = None;
            return self.start_election(now);
        }
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Networked driver
// ---------------------------------------------------------------------------

enum Event {
    Received(ElectionMessage),
    SendFailed(NodeId),
}

/// A bound election node, ready to [`spawn`](ElectionService::spawn).
pub struct ElectionService {
    listener: TcpListener,
    node: BullyNode,
    timeouts: ElectionTimeouts,
}

impl ElectionService {
    pub async fn bind(config: &ElectionConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let addr = listener.local_addr()?;
        let node = BullyNode::new(
            config.node_id,
            addr,
            config.peers.iter().map(|p| (p.id, p.addr)),
            config.timeouts,
        );
        info!(node = config.node_id, %addr, peers = config.peers.len(), "election listening");
        Ok(Self {
            listener,
            node,
            timeouts: config.timeouts,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the node on its own task.
    pub fn spawn(self) -> ElectionHandle {
        let addr = self.node.addr;
        let (status_tx, status_rx) = watch::channel(self.node.status());
        let task = tokio::spawn(self.run(status_tx));
        ElectionHandle {
            addr,
            status: status_rx,
            task,
        }
    }

    async fn run(self, status_tx: watch::Sender<ElectionStatus>) {
        let ElectionService {
            listener,
            mut node,
            timeouts,
        } = self;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let mut heartbeat = tokio::time::interval(timeouts.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // A (re)starting node always holds an election.
        let out = node.start_election(Instant::now());
        dispatch(out, &event_tx, timeouts.send);
        publish(&status_tx, &node);

        loop {
            let deadline = node.next_deadline();
            let out = tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let events = event_tx.clone();
                            tokio::spawn(read_message(stream, peer, events, timeouts.send));
                        }
                        Err(e) => warn!(node = node.id(), error = %e, "election: accept error"),
                    }
                    Vec::new()
                }
                Some(event) = event_rx.recv() => match event {
                    Event::Received(msg) => node.handle(msg, Instant::now()),
                    Event::SendFailed(to) => node.on_send_failed(to, Instant::now()),
                },
                _ = heartbeat.tick() => node.on_tick(Instant::now()),
                _ = sleep_until(deadline) => node.on_deadline(Instant::now()),
            };
            dispatch(out, &event_tx, timeouts.send);
            publish(&status_tx, &node);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

fn publish(status_tx: &watch::Sender<ElectionStatus>, node: &BullyNode) {
    let status = node.status();
    let changed = status_tx.send_if_modified(|current| {
        if *current == status {
            return false;
        }
        *current = status;
        true
    });
    if changed {
        info!(node = status.id, role = ?status.role, leader = ?status.leader, "election status");
    }
}

/// Send each envelope on its own task; failures come back as events.
fn dispatch(envelopes: Vec<Envelope>, events: &mpsc::UnboundedSender<Event>, timeout: Duration) {
    for envelope in envelopes {
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = send_message(envelope.addr, &envelope.message, timeout).await {
                debug!(
                    to = envelope.to,
                    addr = %envelope.addr,
                    kind = ?envelope.message.kind,
                    error = %e,
                    "election send failed"
                );
                let _ = events.send(Event::SendFailed(envelope.to));
            }
        });
    }
}

/// Deliver one message: connect, write one JSON line, shut down.
pub async fn send_message(
    addr: SocketAddr,
    message: &ElectionMessage,
    timeout: Duration,
) -> Result<(), ElectionError> {
    let line = message.to_line()?;
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(line.as_bytes()).await?;
        stream.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| ElectionError::Timeout(timeout))??;
    Ok(())
}

async fn read_message(
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
    timeout: Duration,
) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => match ElectionMessage::from_line(&line) {
            Ok(msg) => {
                let _ = events.send(Event::Received(msg));
            }
            Err(e) => debug!(%peer, error = %e, "election: malformed message"),
        },
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!(%peer, error = %e, "election: read failed"),
        Err(_) => debug!(%peer, "election: read timed out"),
    }
}

/// Handle to a running election node.
#[derive(Debug)]
pub struct ElectionHandle {
    addr: SocketAddr,
    status: watch::Receiver<ElectionStatus>,
    task: JoinHandle<()>,
}

impl ElectionHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn status(&self) -> ElectionStatus {
        *self.status.borrow()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.status().leader
    }

    pub fn is_leader(&self) -> bool {
        self.status().role == Role::Leader
    }

    /// A receiver that sees every status change.
    pub fn subscribe(&self) -> watch::Receiver<ElectionStatus> {
        self.status.clone()
    }

    /// Wait until this node reports `leader` as leader.
    pub async fn wait_for_leader(&self, leader: NodeId, within: Duration) -> bool {
        let mut rx = self.status.clone();
        let result = tokio::time::timeout(within, rx.wait_for(|s| s.leader == Some(leader))).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Stop the node. Its listener closes, so peers see it as down.
    pub fn shutdown(self) {
        self.task.abort();
    }
}
