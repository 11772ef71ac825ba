use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use parley::chat::dispatcher::Dispatcher;
use parley::chat::election::{ElectionHandle, ElectionService, NodeId};
use parley::chat::replication::ReplicationSink;
use parley::chat::server::ChatServer;
use parley::config::{self, DispatcherConfig, ElectionConfig, Peer, ServerConfig, SinkConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Chat routing backbone")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Round-robin front door.
    Dispatcher {
        #[arg(
            long,
            env = "PARLEY_DISPATCHER_BIND",
            default_value_t = config::loopback(config::DISPATCHER_PORT)
        )]
        bind: SocketAddr,
        /// Backends in rotation order.
        #[arg(
            long = "backend",
            env = "PARLEY_BACKENDS",
            value_delimiter = ',',
            default_values_t = DispatcherConfig::default().backends
        )]
        backends: Vec<SocketAddr>,
        #[arg(long, env = "PARLEY_CONNECT_TIMEOUT_MS", default_value_t = 2000)]
        connect_timeout_ms: u64,
    },
    /// One chat instance, optionally taking part in the election.
    Server {
        #[arg(long, env = "PARLEY_SERVER_NAME", default_value = "primary")]
        name: String,
        #[arg(
            long,
            env = "PARLEY_SERVER_BIND",
            default_value_t = config::loopback(config::PRIMARY_PORT)
        )]
        bind: SocketAddr,
        /// Replication sink. Omit to disable replication.
        #[arg(long, env = "PARLEY_REPLICATE_TO")]
        replicate_to: Option<SocketAddr>,
        #[arg(long, env = "PARLEY_REPLICATION_TIMEOUT_MS", default_value_t = 2000)]
        replication_timeout_ms: u64,
        #[command(flatten)]
        election: ElectionArgs,
    },
    /// Replication sink.
    Sink {
        #[arg(
            long,
            env = "PARLEY_SINK_BIND",
            default_value_t = config::loopback(config::SINK_PORT)
        )]
        bind: SocketAddr,
        #[arg(long, env = "PARLEY_STORE", default_value = "database/backup.jsonl")]
        store: PathBuf,
    },
    /// A standalone election node.
    Election {
        #[command(flatten)]
        election: ElectionArgs,
    },
    /// The whole loopback deployment in one process.
    Cluster {
        #[arg(long, env = "PARLEY_STORE", default_value = "database/backup.jsonl")]
        store: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct ElectionArgs {
    /// Election node id; enables the election when set.
    #[arg(long, env = "PARLEY_NODE_ID")]
    node_id: Option<NodeId>,
    #[arg(
        long,
        env = "PARLEY_ELECTION_BIND",
        default_value_t = config::loopback(config::ELECTION_PORT)
    )]
    election_bind: SocketAddr,
    /// Other members as `id@host:port`.
    #[arg(long = "peer", env = "PARLEY_PEERS", value_delimiter = ',')]
    peers: Vec<Peer>,
}

impl ElectionArgs {
    fn config(&self) -> Option<ElectionConfig> {
        Some(ElectionConfig {
            node_id: self.node_id?,
            bind: self.election_bind,
            peers: self.peers.clone(),
            ..ElectionConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    tokio::select! {
        result = run(cli.role) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}

async fn run(role: Role) -> Result<(), BoxError> {
    match role {
        Role::Dispatcher {
            bind,
            backends,
            connect_timeout_ms,
        } => {
            let config = DispatcherConfig {
                bind,
                backends,
                connect_timeout: Duration::from_millis(connect_timeout_ms),
            };
            Dispatcher::bind(&config).await?.run().await
        }
        Role::Server {
            name,
            bind,
            replicate_to,
            replication_timeout_ms,
            election,
        } => {
            let config = ServerConfig {
                name,
                bind,
                replicate_to,
                replication_timeout: Duration::from_millis(replication_timeout_ms),
            };
            let server = ChatServer::bind(&config).await?;
            let _election = start_election(election.config()).await?;
            server.run().await
        }
        Role::Sink { bind, store } => {
            ReplicationSink::bind(&SinkConfig { bind, store }).await?.run().await
        }
        Role::Election { election } => {
            let Some(config) = election.config() else {
                return Err("election needs --node-id".into());
            };
            let handle = ElectionService::bind(&config).await?.spawn();
            let mut status = handle.subscribe();
            while status.changed().await.is_ok() {}
            Ok(())
        }
        Role::Cluster { store } => cluster(store).await,
    }
}

async fn start_election(
    config: Option<ElectionConfig>,
) -> Result<Option<ElectionHandle>, BoxError> {
    match config {
        Some(config) => Ok(Some(ElectionService::bind(&config).await?.spawn())),
        None => Ok(None),
    }
}

/// Sink, primary (with election node 1), replica and dispatcher.
async fn cluster(store: PathBuf) -> Result<(), BoxError> {
    let sink = ReplicationSink::bind(&SinkConfig {
        store,
        ..SinkConfig::default()
    })
    .await?;
    let primary = ChatServer::bind(&ServerConfig::primary()).await?;
    let replica = ChatServer::bind(&ServerConfig::replica()).await?;
    let dispatcher = Dispatcher::bind(&DispatcherConfig::default()).await?;
    let _election = ElectionService::bind(&ElectionConfig::default()).await?.spawn();

    info!("cluster up");
    tokio::try_join!(sink.run(), primary.run(), replica.run(), dispatcher.run())?;
    Ok(())
}
