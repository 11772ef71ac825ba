//! Typed settings for each role.
//!
//! Defaults reproduce the reference loopback deployment: dispatcher on 5000,
//! primary on 6000, sink on 6001, replica on 6002, election node 1 on 7001.
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::chat::election::{ElectionTimeouts, NodeId};

pub const DISPATCHER_PORT: u16 = 5000;
pub const PRIMARY_PORT: u16 = 6000;
pub const SINK_PORT: u16 = 6001;
pub const REPLICA_PORT: u16 = 6002;
pub const ELECTION_PORT: u16 = 7001;

/// Default connect+write budget for one replication attempt.
pub const REPLICATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Default connect budget for one dispatcher → backend attempt.
pub const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid peer {0:?}: expected <id>@<host>:<port>")]
    InvalidPeer(String),
}

/// `127.0.0.1:<port>`.
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub bind: SocketAddr,
    /// Ordered backend list; round robin walks it in this order.
    pub backends: Vec<SocketAddr>,
    pub connect_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bind: loopback(DISPATCHER_PORT),
            backends: vec![loopback(PRIMARY_PORT), loopback(REPLICA_PORT)],
            connect_timeout: BACKEND_CONNECT_TIMEOUT,
        }
    }
}

/// Chat instance settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Label used in logs ("primary", "replica", ...).
    pub name: String,
    pub bind: SocketAddr,
    /// Replication sink; `None` disables replication for this instance.
    pub replicate_to: Option<SocketAddr>,
    pub replication_timeout: Duration,
}

impl ServerConfig {
    /// The reference primary: port 6000, replicating to the sink.
    pub fn primary() -> Self {
        Self {
            name: "primary".into(),
            bind: loopback(PRIMARY_PORT),
            replicate_to: Some(loopback(SINK_PORT)),
            replication_timeout: REPLICATION_TIMEOUT,
        }
    }

    /// The reference replica: port 6002, replicating to the same sink.
    pub fn replica() -> Self {
        Self {
            name: "replica".into(),
            bind: loopback(REPLICA_PORT),
            replicate_to: Some(loopback(SINK_PORT)),
            replication_timeout: REPLICATION_TIMEOUT,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::primary()
    }
}

/// Replication sink settings.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub bind: SocketAddr,
    /// Append-only JSON-lines store.
    pub store: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            bind: loopback(SINK_PORT),
            store: PathBuf::from("database/backup.jsonl"),
        }
    }
}

/// A cluster member for the election: `<id>@<host>:<port>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl FromStr for Peer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPeer(s.to_owned());
        let (id, addr) = s.trim().split_once('@').ok_or_else(invalid)?;
        Ok(Self {
            id: id.parse().map_err(|_| invalid())?,
            addr: addr.parse().map_err(|_| invalid())?,
        })
    }
}

/// Election node settings.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub node_id: NodeId,
    pub bind: SocketAddr,
    /// Known members other than this node.
    pub peers: Vec<Peer>,
    pub timeouts: ElectionTimeouts,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            bind: loopback(ELECTION_PORT),
            peers: Vec::new(),
            timeouts: ElectionTimeouts::default(),
        }
    }
}
