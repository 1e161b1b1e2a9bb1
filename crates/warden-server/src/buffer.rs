//! Per-session replay log for outbound frames.
//!
//! Frames are appended with a monotonic per-session sequence number. A client
//! that reconnects asks for everything after its last seen sequence. The log
//! is bounded by length and age. When no backend is available delivery is
//! live-only and `append` hands out no sequence numbers.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_core::ids::SessionId;
use warden_core::now_millis;
use warden_store::{Database, StreamEntry, StreamRepo};
use warden_telemetry::MetricsRecorder;

use crate::error::BufferError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferBackendKind {
    Memory,
    #[default]
    Sqlite,
    None,
}

#[derive(Clone, Debug)]
pub struct BufferConfig {
    pub backend: BufferBackendKind,
    pub max_len: usize,
    pub ttl: Duration,
    pub sqlite_path: Option<PathBuf>,
    pub prune_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            backend: BufferBackendKind::default(),
            max_len: 1000,
            ttl: Duration::from_secs(3600),
            sqlite_path: None,
            prune_interval: Duration::from_secs(60),
        }
    }
}

pub trait StreamBackend: Send + Sync {
    fn append(&self, session_id: &SessionId, frame_type: &str, frame: &str, now: i64)
        -> Result<u64, BufferError>;

    /// Entries after `after` that were created at or after `not_before`.
    fn read_after(
        &self,
        session_id: &SessionId,
        after: u64,
        not_before: i64,
    ) -> Result<Vec<StreamEntry>, BufferError>;

    fn head(&self, session_id: &SessionId) -> Result<u64, BufferError>;

    fn clear(&self, session_id: &SessionId) -> Result<(), BufferError>;

    fn prune(&self, before: i64) -> Result<usize, BufferError>;
}

#[derive(Default)]
struct MemoryLog {
    head: u64,
    /// Time of the last append.
    touched_at: i64,
    entries: VecDeque<StreamEntry>,
}

pub struct MemoryStreamBackend {
    max_len: usize,
    logs: Mutex<HashMap<SessionId, MemoryLog>>,
}

impl MemoryStreamBackend {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            logs: Mutex::new(HashMap::new()),
        }
    }
}

impl StreamBackend for MemoryStreamBackend {
    fn append(
        &self,
        session_id: &SessionId,
        frame_type: &str,
        frame: &str,
        now: i64,
    ) -> Result<u64, BufferError> {
        let mut logs = self.logs.lock();
        let log = logs.entry(session_id.clone()).or_default();
        log.head += 1;
        log.touched_at = now;
        log.entries.push_back(StreamEntry {
            session_id: session_id.clone(),
            seq: log.head,
            frame_type: frame_type.to_string(),
            payload: frame.to_string(),
            created_at: now,
        });
        while log.entries.len() > self.max_len {
            log.entries.pop_front();
        }
        Ok(log.head)
    }

    fn read_after(
        &self,
        session_id: &SessionId,
        after: u64,
        not_before: i64,
    ) -> Result<Vec<StreamEntry>, BufferError> {
        let logs = self.logs.lock();
        Ok(logs
            .get(session_id)
            .map(|log| {
                log.entries
                    .iter()
                    .filter(|e| e.seq > after && e.created_at >= not_before)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn head(&self, session_id: &SessionId) -> Result<u64, BufferError> {
        Ok(self.logs.lock().get(session_id).map_or(0, |log| log.head))
    }

    fn clear(&self, session_id: &SessionId) -> Result<(), BufferError> {
        self.logs.lock().remove(session_id);
        Ok(())
    }

    /// Expire old entries and forget sessions idle for longer than the TTL.
    fn prune(&self, before: i64) -> Result<usize, BufferError> {
        let mut removed = 0;
        self.logs.lock().retain(|_, log| {
            let len = log.entries.len();
            log.entries.retain(|e| e.created_at >= before);
            removed += len - log.entries.len();
            !log.entries.is_empty() || log.touched_at >= before
        });
        Ok(removed)
    }
}

pub struct SqliteStreamBackend {
    repo: StreamRepo,
    max_len: usize,
}

impl SqliteStreamBackend {
    pub fn new(db: Database, max_len: usize) -> Self {
        Self {
            repo: StreamRepo::new(db),
            max_len: max_len.max(1),
        }
    }
}

impl StreamBackend for SqliteStreamBackend {
    fn append(
        &self,
        session_id: &SessionId,
        frame_type: &str,
        frame: &str,
        now: i64,
    ) -> Result<u64, BufferError> {
        Ok(self
            .repo
            .append(session_id, frame_type, frame, now, self.max_len)?)
    }

    fn read_after(
        &self,
        session_id: &SessionId,
        after: u64,
        not_before: i64,
    ) -> Result<Vec<StreamEntry>, BufferError> {
        Ok(self.repo.read_after(session_id, after, not_before)?)
    }

    fn head(&self, session_id: &SessionId) -> Result<u64, BufferError> {
        Ok(self.repo.head(session_id)?)
    }

    fn clear(&self, session_id: &SessionId) -> Result<(), BufferError> {
        self.repo.clear(session_id)?;
        Ok(())
    }

    fn prune(&self, before: i64) -> Result<usize, BufferError> {
        Ok(self.repo.prune_before(before)?)
    }
}

/// Result of a replay request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Replay {
    pub entries: Vec<StreamEntry>,
    /// First sequence number the client asked for.
    pub from: u64,
    /// Head at the time of the replay.
    pub to: u64,
    /// Some requested entries were evicted or expired.
    pub gap: bool,
}

pub struct DeliveryBuffer {
    backend: Option<Arc<dyn StreamBackend>>,
    ttl: Duration,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl DeliveryBuffer {
    pub fn new(backend: Option<Arc<dyn StreamBackend>>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            metrics: None,
        }
    }

    /// Build the configured backend. A sqlite backend that cannot be opened
    /// leaves the buffer disabled instead of failing.
    pub fn open(config: &BufferConfig) -> Self {
        let backend: Option<Arc<dyn StreamBackend>> = match config.backend {
            BufferBackendKind::None => None,
            BufferBackendKind::Memory => Some(Arc::new(MemoryStreamBackend::new(config.max_len))),
            BufferBackendKind::Sqlite => match &config.sqlite_path {
                Some(path) => match Database::open(path) {
                    Ok(db) => Some(Arc::new(SqliteStreamBackend::new(db, config.max_len))),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "stream buffer unavailable, delivery is live-only");
                        None
                    }
                },
                None => {
                    warn!("no stream buffer path configured, delivery is live-only");
                    None
                }
            },
        };
        info!(backend = ?config.backend, enabled = backend.is_some(), "delivery buffer ready");
        Self::new(backend, config.ttl)
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::ZERO)
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Store a frame and return its sequence number. `None` means the frame
    /// is delivered live only.
    pub fn append(&self, session_id: &SessionId, frame_type: &str, frame: &str) -> Option<u64> {
        let backend = self.backend.as_ref()?;
        match backend.append(session_id, frame_type, frame, now_millis()) {
            Ok(seq) => {
                if let Some(m) = &self.metrics {
                    m.increment_counter("buffer_appends_total", &[], 1);
                }
                Some(seq)
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to buffer frame");
                None
            }
        }
    }

    pub fn replay(&self, session_id: &SessionId, last_seq: u64) -> Replay {
        let Some(backend) = &self.backend else {
            return Replay {
                from: last_seq + 1,
                to: last_seq,
                ..Default::default()
            };
        };
        let not_before = now_millis() - self.ttl_millis();

        let result = backend.head(session_id).and_then(|head| {
            // A client ahead of the head saw a log that has since been reset.
            let (after, reset) = if last_seq > head {
                (0, true)
            } else {
                (last_seq, false)
            };
            let entries = backend.read_after(session_id, after, not_before)?;
            let gap = reset
                || match entries.first() {
                    Some(first) => first.seq > after + 1,
                    None => head > after,
                };
            Ok(Replay {
                entries,
                from: after + 1,
                to: head,
                gap,
            })
        });

        match result {
            Ok(replay) => {
                debug!(
                    session_id = %session_id,
                    from = replay.from,
                    to = replay.to,
                    count = replay.entries.len(),
                    gap = replay.gap,
                    "replaying buffered frames"
                );
                replay
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "replay failed");
                Replay {
                    from: last_seq + 1,
                    to: last_seq,
                    gap: true,
                    ..Default::default()
                }
            }
        }
    }

    /// Unexpired entries with a sequence number above `after`.
    pub fn entries_after(&self, session_id: &SessionId, after: u64) -> Vec<StreamEntry> {
        let Some(backend) = &self.backend else {
            return Vec::new();
        };
        let not_before = now_millis() - self.ttl_millis();
        backend
            .read_after(session_id, after, not_before)
            .unwrap_or_else(|e| {
                warn!(session_id = %session_id, error = %e, "buffer read failed");
                Vec::new()
            })
    }

    pub fn head(&self, session_id: &SessionId) -> u64 {
        self.backend
            .as_ref()
            .and_then(|b| b.head(session_id).ok())
            .unwrap_or(0)
    }

    pub fn clear(&self, session_id: &SessionId) {
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.clear(session_id) {
                warn!(session_id = %session_id, error = %e, "failed to clear buffer");
            }
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let Some(backend) = &self.backend else {
            return 0;
        };
        match backend.prune(now_millis() - self.ttl_millis()) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "buffer prune failed");
                0
            }
        }
    }

    fn ttl_millis(&self) -> i64 {
        i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Periodically expire old entries until `cancel` fires.
pub fn spawn_pruner(
    buffer: Arc<DeliveryBuffer>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !buffer.is_enabled() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = buffer.prune();
                    if removed > 0 {
                        debug!(removed, "pruned expired frames");
                    }
                }
            }
        }
    })
}
