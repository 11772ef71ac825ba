//! Round-robin front door for the chat instances.
//!
//! Each client connection is pinned to one backend for its whole lifetime
//! and spliced to it byte for byte. When either side closes, both do. The
//! dispatcher never looks inside the stream, so it works for the handshake
//! and the JSON frames alike.
//!
//! ## Backend selection
//!
//! The pool hands out a starting index in strict rotation. If that backend
//! refuses the connection the remaining backends are tried in ring order;
//! only when all of them fail does the client get an error line and a close.
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::message::Reply;
use crate::config::DispatcherConfig;

/// Error line code written to a client when no backend accepts it.
pub const BACKEND_UNAVAILABLE: &str = "backend_unavailable";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no backends configured")]
    NoBackends,
    #[error("all {0} backends unreachable")]
    BackendUnavailable(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fixed, ordered backend list with a round-robin cursor.
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<SocketAddr>,
    next: Mutex<usize>,
}

impl BackendPool {
    pub fn new(backends: Vec<SocketAddr>) -> Result<Self, DispatchError> {
        if backends.is_empty() {
            return Err(DispatchError::NoBackends);
        }
        Ok(Self {
            backends,
            next: Mutex::new(0),
        })
    }

    pub fn backends(&self) -> &[SocketAddr] {
        &self.backends
    }

    /// Index of the next backend in rotation; advances the cursor.
    pub fn next_index(&self) -> usize {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let index = *next % self.backends.len();
        *next = (index + 1) % self.backends.len();
        index
    }

    /// Every backend once, starting at the next round-robin pick.
    pub fn rotation(&self) -> Vec<SocketAddr> {
        let start = self.next_index();
        let n = self.backends.len();
        (0..n).map(|i| self.backends[(start + i) % n]).collect()
    }
}

/// A bound dispatcher, ready to [`run`](Dispatcher::run).
pub struct Dispatcher {
    listener: TcpListener,
    pool: Arc<BackendPool>,
    connect_timeout: Duration,
}

impl Dispatcher {
    pub async fn bind(config: &DispatcherConfig) -> Result<Self, DispatchError> {
        let pool = BackendPool::new(config.backends.clone())?;
        let listener = TcpListener::bind(config.bind).await?;
        info!(
            addr = %listener.local_addr()?,
            backends = ?config.backends,
            "dispatcher listening"
        );
        Ok(Self {
            listener,
            pool: Arc::new(pool),
            connect_timeout: config.connect_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn pool(&self) -> Arc<BackendPool> {
        Arc::clone(&self.pool)
    }

    /// Accept loop. One task per proxied client.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            match self.listener.accept().await {
                Ok((client, addr)) => {
                    let pool = Arc::clone(&self.pool);
                    let connect_timeout = self.connect_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = proxy(client, addr, &pool, connect_timeout).await {
                            warn!(%addr, error = %e, "dispatcher: connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "dispatcher: accept error"),
            }
        }
    }
}

/// Connect to the first reachable backend in rotation order.
async fn connect_backend(
    pool: &BackendPool,
    connect_timeout: Duration,
) -> Option<(TcpStream, SocketAddr)> {
    for backend in pool.rotation() {
        match tokio::time::timeout(connect_timeout, TcpStream::connect(backend)).await {
            Ok(Ok(stream)) => return Some((stream, backend)),
            Ok(Err(e)) => warn!(%backend, error = %e, "backend refused, trying next"),
            Err(_) => warn!(%backend, ?connect_timeout, "backend connect timed out, trying next"),
        }
    }
    None
}

/// Pin `client` to a backend and splice the two until either side is done.
async fn proxy(
    mut client: TcpStream,
    addr: SocketAddr,
    pool: &BackendPool,
    connect_timeout: Duration,
) -> Result<(), DispatchError> {
    let Some((mut backend, backend_addr)) = connect_backend(pool, connect_timeout).await else {
        // Best effort: the client may already be gone.
        if let Ok(line) = Reply::error(BACKEND_UNAVAILABLE).to_line() {
            let _ = client.write_all(line.as_bytes()).await;
        }
        let _ = client.shutdown().await;
        return Err(DispatchError::BackendUnavailable(pool.backends().len()));
    };
    info!(%addr, backend = %backend_addr, "client assigned");

    // Handshake: the client's first read goes to the backend verbatim.
    let mut first = vec![0u8; super::server::HANDSHAKE_MAX];
    let n = client.read(&mut first).await?;
    if n == 0 {
        debug!(%addr, "client closed before handshake");
        let _ = backend.shutdown().await;
        return Ok(());
    }
    backend.write_all(&first[..n]).await?;

    let (closed_by, bytes) = relay(&mut client, &mut backend).await?;
    debug!(%addr, backend = %backend_addr, closed_by, bytes, "relay closed");
    Ok(())
}

/// Copy both directions until either side closes or fails, then close both.
///
/// Returns which side ended the relay and how many bytes that leg carried.
async fn relay(
    client: &mut TcpStream,
    backend: &mut TcpStream,
) -> std::io::Result<(&'static str, u64)> {
    let result = {
        let (mut client_read, mut client_write) = client.split();
        let (mut backend_read, mut backend_write) = backend.split();
        tokio::select! {
            up = tokio::io::copy(&mut client_read, &mut backend_write) => {
                up.map(|n| ("client", n))
            }
            down = tokio::io::copy(&mut backend_read, &mut client_write) => {
                down.map(|n| ("backend", n))
            }
        }
    };
    let _ = client.shutdown().await;
    let _ = backend.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(ports: &[u16]) -> Vec<SocketAddr> {
        ports
            .iter()
            .map(|p| SocketAddr::from(([127, 0, 0, 1], *p)))
            .collect()
    }

    async fn dispatcher_for(backends: Vec<SocketAddr>) -> SocketAddr {
        let dispatcher = Dispatcher::bind(&DispatcherConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            backends: backends.clone(),
            connect_timeout: Duration::from_millis(500),
        })
        .await
        .unwrap();
        assert_eq!(dispatcher.pool().backends(), &backends[..]);
        let addr = dispatcher.local_addr().unwrap();
        tokio::spawn(dispatcher.run());
        addr
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(BackendPool::new(Vec::new()), Err(DispatchError::NoBackends)));
    }

    #[test]
    fn round_robin_alternates() {
        let pool = BackendPool::new(addrs(&[6000, 6002])).unwrap();
        let picks: Vec<usize> = (0..6).map(|_| pool.next_index()).collect();
        assert_eq!(picks, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn round_robin_wraps_three() {
        let pool = BackendPool::new(addrs(&[1, 2, 3])).unwrap();
        let picks: Vec<usize> = (0..7).map(|_| pool.next_index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn rotation_starts_at_pick_and_covers_all() {
        let backends = addrs(&[1, 2, 3]);
        let pool = BackendPool::new(backends.clone()).unwrap();
        assert_eq!(pool.rotation(), vec![backends[0], backends[1], backends[2]]);
        assert_eq!(pool.rotation(), vec![backends[1], backends[2], backends[0]]);
        assert_eq!(pool.rotation(), vec![backends[2], backends[0], backends[1]]);
        assert_eq!(pool.rotation(), vec![backends[0], backends[1], backends[2]]);
    }

    #[test]
    fn concurrent_picks_stay_balanced() {
        let pool = Arc::new(BackendPool::new(addrs(&[1, 2])).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || (0..250).map(|_| pool.next_index()).collect::<Vec<_>>())
            })
            .collect();
        let picks: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let zeros = picks.iter().filter(|i| **i == 0).count();
        assert_eq!(zeros, 500);
        assert_eq!(picks.len() - zeros, 500);
    }

    // ── Relay ────────────────────────────────────────────────────

    #[tokio::test]
    async fn client_close_closes_backend_and_client() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            // Read to EOF, then keep the connection open.
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut seen = Vec::new();
            stream.read_to_end(&mut seen).await.unwrap();
            let _ = seen_tx.send(seen);
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });
        let front = dispatcher_for(vec![backend_addr]).await;

        let mut client = TcpStream::connect(front).await.unwrap();
        client.write_all(b"alice\n").await.unwrap();
        client.shutdown().await.unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(3), seen_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, b"alice\n");

        // The backend is still open, yet the client sees EOF.
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut rest))
            .await
            .expect("client half left open")
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn backend_close_closes_client() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut handshake = [0u8; 64];
            let _ = stream.read(&mut handshake).await.unwrap();
            stream.write_all(b"{\"info\":\"bye\"}\n").await.unwrap();
        });
        let front = dispatcher_for(vec![backend_addr]).await;

        let mut client = TcpStream::connect(front).await.unwrap();
        client.write_all(b"alice\n").await.unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"{\"info\":\"bye\"}\n");
    }
}
