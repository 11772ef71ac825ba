//! Per-instance connection registry: username → live connection handle.
//!
//! Each chat instance owns exactly one registry; nothing is shared between
//! instances. All access goes through one exclusive lock.
use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::{mpsc, Mutex};

use super::message::Reply;

/// Identifies one accepted connection for the lifetime of the instance.
pub type ConnectionId = u64;

/// Something another task wants a connection to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Write this reply to the client.
    Reply(Reply),
    /// A newer connection registered the same username; close.
    Superseded,
}

/// Handle to send messages to a connected client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: ConnectionId,
    pub username: String,
    pub addr: SocketAddr,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientHandle {
    /// Create a handle and the receiving end its connection task drains.
    pub fn new(
        id: ConnectionId,
        username: impl Into<String>,
        addr: SocketAddr,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            username: username.into(),
            addr,
            tx,
        };
        (handle, rx)
    }

    /// Queue a reply for this client. Returns `false` if the connection is
    /// already gone.
    pub fn deliver(&self, reply: Reply) -> bool {
        self.tx.send(Outbound::Reply(reply)).is_ok()
    }

    fn supersede(&self) {
        let _ = self.tx.send(Outbound::Superseded);
    }
}

/// Username → connection map for one instance.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    clients: Mutex<HashMap<String, ClientHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its username.
    ///
    /// An existing entry for the same username is displaced and told to
    /// close; the displaced handle is returned.
    pub async fn register(&self, handle: ClientHandle) -> Option<ClientHandle> {
        let mut clients = self.clients.lock().await;
        let displaced = clients.insert(handle.username.clone(), handle);
        if let Some(old) = &displaced {
            old.supersede();
        }
        displaced
    }

    /// Look up the live connection for `username`.
    pub async fn lookup(&self, username: &str) -> Option<ClientHandle> {
        self.clients.lock().await.get(username).cloned()
    }

    /// Remove `username` only if the entry still belongs to connection `id`.
    ///
    /// Returns `true` if an entry was removed.
    pub async fn remove(&self, username: &str, id: ConnectionId) -> bool {
        let mut clients = self.clients.lock().await;
        match clients.get(username) {
            Some(handle) if handle.id == id => {
                clients.remove(username);
                true
            }
            _ => false,
        }
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.clients.lock().await.contains_key(username)
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Registered usernames, sorted.
    pub async fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}
