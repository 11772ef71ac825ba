//! Best-effort replication of routed messages to a backup sink.
//!
//! The sending side ([`Replicator`]) opens one short-lived connection per
//! record, writes a single JSON line and hangs up. It never retries and never
//! makes the caller wait. The receiving side ([`ReplicationSink`]) accepts
//! those connections and appends each record to an append-only JSON-lines
//! file ([`ReplicationLog`]). Nothing is acknowledged and nothing is read back.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::LamportClock;
use super::message::ReplicationRecord;
use crate::config::SinkConfig;

/// Largest record the sink will accept.
pub const MAX_RECORD_BYTES: u64 = 64 * 1024;

/// How long the sink waits for a sender to finish writing its record.
const RECORD_READ_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from sending or storing a replication record.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record exceeds {MAX_RECORD_BYTES} bytes")]
    TooLarge,
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Fire-and-forget sender owned by a chat instance.
#[derive(Debug, Clone)]
pub struct Replicator {
    sink: SocketAddr,
    timeout: Duration,
}

impl Replicator {
    /// `timeout` bounds connect and write together.
    pub fn new(sink: SocketAddr, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    pub fn sink_addr(&self) -> SocketAddr {
        self.sink
    }

    /// Send `record` on its own task.
    ///
    /// Failures are logged and dropped. The returned handle may be awaited to
    /// observe the outcome; dropping it does not cancel the attempt.
    pub fn replicate(&self, record: ReplicationRecord) -> JoinHandle<Result<(), ReplicationError>> {
        let sink = self.sink;
        let timeout = self.timeout;
        tokio::spawn(async move {
            let result = send_record(sink, &record, timeout).await;
            match &result {
                Ok(()) => debug!(%sink, clock = record.clock, "record replicated"),
                Err(e) => {
                    warn!(
                        %sink,
                        clock = record.clock,
                        error = %e,
                        "backup not reachable, record dropped"
                    )
                }
            }
            result
        })
    }
}

/// Deliver one record: connect, write one JSON line, shut down.
pub async fn send_record(
    sink: SocketAddr,
    record: &ReplicationRecord,
    timeout: Duration,
) -> Result<(), ReplicationError> {
    let line = record.to_line()?;
    let attempt = async {
        let mut stream = TcpStream::connect(sink).await?;
        stream.write_all(line.as_bytes()).await?;
        stream.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| ReplicationError::Timeout(timeout))??;
    Ok(())
}

// ---------------------------------------------------------------------------
// Durable store
// ---------------------------------------------------------------------------

/// Append-only JSON-lines file. One record per line, fsync'd per append.
#[derive(Debug)]
pub struct ReplicationLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl ReplicationLog {
    /// Open (or create) the log at `path`, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. `record` must not contain a newline.
    ///
    /// A record is stored whole or not at all: if the write or the fsync
    /// fails, the file is truncated back to its length before the append.
    pub async fn append(&self, record: &str) -> std::io::Result<()> {
        let mut line = String::with_capacity(record.len() + 1);
        line.push_str(record);
        line.push('\n');

        let mut file = self.file.lock().await;
        let start = file.metadata().await?.len();
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;
        rollback_on_error(&mut file, start, written).await
    }
}

/// Cut `file` back to `start` bytes if `result` is an error.
async fn rollback_on_error(
    file: &mut File,
    start: u64,
    result: std::io::Result<()>,
) -> std::io::Result<()> {
    if let Err(e) = result {
        if let Err(truncate) = file.set_len(start).await {
            warn!(error = %truncate, "could not roll back partial record");
        }
        return Err(e);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Sink server
// ---------------------------------------------------------------------------

/// State shared by the sink's connection tasks.
#[derive(Debug)]
pub struct SinkState {
    pub log: ReplicationLog,
    /// Merged with the `clock` of every stored record.
    pub clock: LamportClock,
    stored: AtomicU64,
}

impl SinkState {
    /// Records stored since the sink started.
    pub fn stored(&self) -> u64 {
        self.stored.load(Ordering::Acquire)
    }
}

/// The backup listener.
pub struct ReplicationSink {
    listener: TcpListener,
    state: Arc<SinkState>,
}

impl ReplicationSink {
    /// Open the store and bind the listener, failing fast on either.
    pub async fn bind(config: &SinkConfig) -> std::io::Result<Self> {
        let log = ReplicationLog::open(&config.store).await?;
        let listener = TcpListener::bind(config.bind).await?;
        info!(
            addr = %listener.local_addr()?,
            store = %log.path().display(),
            "replication sink listening"
        );
        Ok(Self {
            listener,
            state: Arc::new(SinkState {
                log,
                clock: LamportClock::new(),
                stored: AtomicU64::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<SinkState> {
        Arc::clone(&self.state)
    }

    /// Accept loop. One task per sender connection.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = store_record(stream, addr, &state).await {
                            warn!(%addr, error = %e, "record discarded");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "replication sink: accept error"),
            }
        }
    }
}

/// Read one record from `stream` and append it to the log.
async fn store_record(
    stream: TcpStream,
    addr: SocketAddr,
    state: &SinkState,
) -> Result<(), ReplicationError> {
    let mut buf = Vec::new();
    let mut limited = stream.take(MAX_RECORD_BYTES + 1);
    let read = limited.read_to_end(&mut buf);
    tokio::time::timeout(RECORD_READ_TIMEOUT, read)
        .await
        .map_err(|_| ReplicationError::Timeout(RECORD_READ_TIMEOUT))??;
    if buf.len() as u64 > MAX_RECORD_BYTES {
        return Err(ReplicationError::TooLarge);
    }

    let raw = buf.trim_ascii();
    if raw.is_empty() {
        debug!(%addr, "empty replication connection");
        return Ok(());
    }

    let value: serde_json::Value = serde_json::from_slice(raw)?;
    let Some(object) = value.as_object() else {
        return Err(ReplicationError::NotAnObject);
    };
    let record_clock = object.get("clock").and_then(serde_json::Value::as_u64);

    // Single-line payloads are stored as received; anything else is compacted
    // so the log stays one record per line.
    let text = String::from_utf8_lossy(raw);
    if text.contains('\n') {
        state.log.append(&value.to_string()).await?;
    } else {
        state.log.append(&text).await?;
    }
    let sink_clock = match record_clock {
        Some(clock) => state.clock.merge(clock),
        None => state.clock.tick(),
    };
    state.stored.fetch_add(1, Ordering::Release);
    info!(
        %addr,
        kind = object.get("kind").and_then(serde_json::Value::as_str).unwrap_or("?"),
        clock = record_clock,
        sink_clock,
        "record stored"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::RecordKind;

    fn temp_store(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("parley-sink-{tag}-{}", rand::random::<u64>()))
            .join("backup.jsonl")
    }

    fn record(clock: u64) -> ReplicationRecord {
        ReplicationRecord {
            kind: RecordKind::Private,
            from: "alice".into(),
            to: Some("bob".into()),
            group: None,
            message: "hello".into(),
            clock,
            ts: 1_700_000_000,
        }
    }

    async fn start_sink(tag: &str) -> (SocketAddr, Arc<SinkState>, PathBuf) {
        let store = temp_store(tag);
        let config = SinkConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            store: store.clone(),
        };
        let sink = ReplicationSink::bind(&config).await.unwrap();
        let addr = sink.local_addr().unwrap();
        let state = sink.state();
        tokio::spawn(sink.run());
        (addr, state, store)
    }

    async fn wait_for_stored(state: &SinkState, n: u64) {
        for _ in 0..200 {
            if state.stored() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sink stored {} records, wanted {n}", state.stored());
    }

    #[tokio::test]
    async fn replicated_record_is_appended() {
        let (addr, state, store) = start_sink("append").await;
        let replicator = Replicator::new(addr, Duration::from_secs(2));
        assert_eq!(replicator.sink_addr(), addr);

        replicator.replicate(record(4)).await.unwrap().unwrap();
        wait_for_stored(&state, 1).await;

        let content = tokio::fs::read_to_string(&store).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let stored: ReplicationRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(stored, record(4));

        let _ = std::fs::remove_dir_all(store.parent().unwrap());
    }

    #[tokio::test]
    async fn sink_clock_moves_past_observed_records() {
        let (addr, state, store) = start_sink("clock").await;
        let replicator = Replicator::new(addr, Duration::from_secs(2));

        replicator.replicate(record(40)).await.unwrap().unwrap();
        wait_for_stored(&state, 1).await;
        assert_eq!(state.clock.peek(), 41);

        let _ = std::fs::remove_dir_all(store.parent().unwrap());
    }

    #[tokio::test]
    async fn non_json_payload_is_discarded() {
        let (addr, state, store) = start_sink("garbage").await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"definitely not json\n").await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        // A valid record afterwards is still stored, alone.
        Replicator::new(addr, Duration::from_secs(2))
            .replicate(record(1))
            .await
            .unwrap()
            .unwrap();
        wait_for_stored(&state, 1).await;

        let content = tokio::fs::read_to_string(&store).await.unwrap();
        assert_eq!(content.lines().count(), 1);
        assert_eq!(state.stored(), 1);

        let _ = std::fs::remove_dir_all(store.parent().unwrap());
    }

    #[tokio::test]
    async fn json_array_is_not_a_record() {
        let (addr, state, store) = start_sink("array").await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"[1,2,3]\n").await.unwrap();
        stream.shutdown().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state.stored(), 0);

        let _ = std::fs::remove_dir_all(store.parent().unwrap());
    }

    #[tokio::test]
    async fn unreachable_sink_fails_without_retry() {
        // Bind then drop to get a port nobody is listening on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let replicator = Replicator::new(addr, Duration::from_millis(500));

        let started = std::time::Instant::now();
        let result = replicator.replicate(record(1)).await.unwrap();
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn log_appends_across_reopen() {
        let store = temp_store("reopen");
        {
            let log = ReplicationLog::open(&store).await.unwrap();
            log.append(r#"{"n":1}"#).await.unwrap();
        }
        let log = ReplicationLog::open(&store).await.unwrap();
        log.append(r#"{"n":2}"#).await.unwrap();

        let content = tokio::fs::read_to_string(&store).await.unwrap();
        assert_eq!(content, "{\"n\":1}\n{\"n\":2}\n");

        let _ = std::fs::remove_dir_all(store.parent().unwrap());
    }

    #[tokio::test]
    async fn failed_append_is_rolled_back() {
        let store = temp_store("rollback");
        let log = ReplicationLog::open(&store).await.unwrap();
        log.append(r#"{"clock":1}"#).await.unwrap();

        // Simulate a write that died half way through the second record.
        let mut file = log.file.lock().await;
        let start = file.metadata().await.unwrap().len();
        file.write_all(br#"{"clock":"#).await.unwrap();
        file.flush().await.unwrap();
        let failed = Err(std::io::Error::other("disk full"));
        assert!(rollback_on_error(&mut file, start, failed).await.is_err());
        drop(file);

        let content = tokio::fs::read_to_string(&store).await.unwrap();
        assert_eq!(content, "{\"clock\":1}\n");

        // The log stays usable after a rollback.
        log.append(r#"{"clock":2}"#).await.unwrap();
        let content = tokio::fs::read_to_string(&store).await.unwrap();
        assert_eq!(content.lines().collect::<Vec<_>>(), vec![r#"{"clock":1}"#, r#"{"clock":2}"#]);

        let _ = std::fs::remove_dir_all(store.parent().unwrap());
    }
}
