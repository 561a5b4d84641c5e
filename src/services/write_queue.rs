// Quick Tabs Write-Serialization Queue
// Linearizes every write to the durable state key through one FIFO worker task.
// Each write carries a fresh provenance token and an optimistic version; a
// version newer than expected means another writer got there first, in which
// case the write is rebased onto the stored tabs before retrying.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::database::DurableStore;
use crate::services::format_migrator::parse_records;
use crate::types::errors::WriteQueueError;
use crate::types::quick_tab::{CanonicalState, PersistedState, QuickTabRecord};

const QUEUE_CAPACITY: usize = 128;

/// Records a mutation changed, used to replay it onto a rebased baseline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteDelta {
    pub upserts: Vec<QuickTabRecord>,
    pub removals: Vec<String>,
}

impl WriteDelta {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    /// Applies removals then upserts to `tabs`.
    pub fn apply_to(&self, tabs: &mut Vec<QuickTabRecord>) {
        tabs.retain(|t| !self.removals.contains(&t.id));
        for record in &self.upserts {
            match tabs.iter_mut().find(|t| t.id == record.id) {
                Some(existing) => *existing = record.clone(),
                None => tabs.push(record.clone()),
            }
        }
    }
}

/// Everything the worker needs to persist one mirror snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePayload {
    pub tabs: Vec<QuickTabRecord>,
    pub delta: WriteDelta,
    pub last_update: i64,
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub version: u64,
    pub write_source_id: String,
    pub attempts: u32,
    /// True when a conflict forced the write onto another writer's tabs.
    pub rebased: bool,
    /// The tabs actually persisted.
    pub tabs: Vec<QuickTabRecord>,
}

/// Worker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    Idle,
    Writing,
}

/// Counters exposed through diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteQueueStats {
    pub completed: u64,
    pub failed: u64,
    pub conflicts: u64,
    pub retries: u64,
    pub storage_version: u64,
    pub expected_version: u64,
    pub last_write_at: Option<i64>,
}

enum PendingWrite {
    Mirror {
        payload: WritePayload,
        enqueued_at: Instant,
        reply: oneshot::Sender<Result<WriteOutcome, WriteQueueError>>,
    },
    Baseline {
        state: CanonicalState,
        enqueued_at: Instant,
        reply: oneshot::Sender<Result<WriteOutcome, WriteQueueError>>,
    },
    Seed {
        version: u64,
    },
}

struct Shared {
    state: AtomicU8,
    stats: Mutex<WriteQueueStats>,
    own_writes: Mutex<VecDeque<(String, Instant)>>,
    grace: Duration,
}

impl Shared {
    fn remember(&self, source_id: &str) {
        if let Ok(mut own) = self.own_writes.lock() {
            let now = Instant::now();
            while own.front().map(|(_, at)| now.duration_since(*at) > self.grace).unwrap_or(false) {
                own.pop_front();
            }
            own.push_back((source_id.to_string(), now));
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut WriteQueueStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

/// Handle to the single write worker. Cheap to clone.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<PendingWrite>,
    shared: Arc<Shared>,
}

struct Worker {
    store: Arc<dyn DurableStore>,
    key: String,
    retry_limit: u32,
    backoff: Duration,
    /// Last version this queue read or wrote; `None` until seeded.
    expected_version: Option<u64>,
    storage_version: u64,
    rng: SystemRandom,
    shared: Arc<Shared>,
}

const STATE_IDLE: u8 = 0;
const STATE_WRITING: u8 = 1;

impl WriteQueue {
    /// Starts the worker task. Must be called inside a tokio runtime.
    pub fn spawn(
        store: Arc<dyn DurableStore>,
        key: &str,
        retry_limit: u32,
        backoff: Duration,
        self_write_grace: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(STATE_IDLE),
            stats: Mutex::new(WriteQueueStats::default()),
            own_writes: Mutex::new(VecDeque::new()),
            grace: self_write_grace,
        });
        let worker = Worker {
            store,
            key: key.to_string(),
            retry_limit: retry_limit.max(1),
            backoff,
            expected_version: None,
            storage_version: 0,
            rng: SystemRandom::new(),
            shared: shared.clone(),
        };
        tokio::spawn(worker.run(rx));
        Self { tx, shared }
    }

    /// Persists a mirror snapshot. Resolves once the write lands or retries run out.
    pub async fn enqueue_write(&self, payload: WritePayload) -> Result<WriteOutcome, WriteQueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PendingWrite::Mirror {
                payload,
                enqueued_at: Instant::now(),
                reply,
            })
            .await
            .map_err(|_| WriteQueueError::Closed)?;
        rx.await.map_err(|_| WriteQueueError::Closed)?
    }

    /// Writes `state` verbatim with its own version, skipping conflict handling.
    /// Used to re-persist a migrated layout.
    pub async fn persist_baseline(&self, state: CanonicalState) -> Result<WriteOutcome, WriteQueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PendingWrite::Baseline {
                state,
                enqueued_at: Instant::now(),
                reply,
            })
            .await
            .map_err(|_| WriteQueueError::Closed)?;
        rx.await.map_err(|_| WriteQueueError::Closed)?
    }

    /// Tells the worker the stored version it should now expect.
    pub async fn seed_version(&self, version: u64) -> Result<(), WriteQueueError> {
        self.tx
            .send(PendingWrite::Seed { version })
            .await
            .map_err(|_| WriteQueueError::Closed)
    }

    /// True if `source_id` was written by this queue within the grace window.
    pub fn is_own_write(&self, source_id: &str) -> bool {
        let own = match self.shared.own_writes.lock() {
            Ok(own) => own,
            Err(_) => return false,
        };
        let now = Instant::now();
        own.iter()
            .any(|(id, at)| id == source_id && now.duration_since(*at) <= self.shared.grace)
    }

    pub fn state(&self) -> QueueState {
        match self.shared.state.load(Ordering::SeqCst) {
            STATE_WRITING => QueueState::Writing,
            _ => QueueState::Idle,
        }
    }

    pub fn stats(&self) -> WriteQueueStats {
        self.shared.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<PendingWrite>) {
        while let Some(request) = rx.recv().await {
            match request {
                PendingWrite::Seed { version } => {
                    self.expected_version = Some(self.expected_version.map_or(version, |v| v.max(version)));
                    self.storage_version = self.storage_version.max(version);
                    self.publish_versions();
                }
                PendingWrite::Mirror {
                    payload,
                    enqueued_at,
                    reply,
                } => {
                    self.shared.state.store(STATE_WRITING, Ordering::SeqCst);
                    debug!(waited_ms = enqueued_at.elapsed().as_millis() as u64, "Write dequeued");
                    let result = self.write_mirror(payload).await;
                    self.finish(&result);
                    let _ = reply.send(result);
                }
                PendingWrite::Baseline {
                    state,
                    enqueued_at,
                    reply,
                } => {
                    self.shared.state.store(STATE_WRITING, Ordering::SeqCst);
                    debug!(waited_ms = enqueued_at.elapsed().as_millis() as u64, "Baseline write dequeued");
                    let result = self.write_baseline(state).await;
                    self.finish(&result);
                    let _ = reply.send(result);
                }
            }
        }
        debug!("Write queue worker stopped");
    }

    fn finish(&self, result: &Result<WriteOutcome, WriteQueueError>) {
        let (expected, storage) = (self.expected_version.unwrap_or(0), self.storage_version);
        self.shared.update_stats(|stats| {
            match result {
                Ok(_) => {
                    stats.completed += 1;
                    stats.last_write_at = Some(crate::types::now_millis());
                }
                Err(_) => stats.failed += 1,
            }
            stats.expected_version = expected;
            stats.storage_version = storage;
        });
        self.shared.state.store(STATE_IDLE, Ordering::SeqCst);
    }

    fn publish_versions(&self) {
        let (expected, storage) = (self.expected_version.unwrap_or(0), self.storage_version);
        self.shared.update_stats(|stats| {
            stats.expected_version = expected;
            stats.storage_version = storage;
        });
    }

    async fn write_mirror(&mut self, payload: WritePayload) -> Result<WriteOutcome, WriteQueueError> {
        let mut last_error = String::new();

        for attempt in 1..=self.retry_limit {
            if attempt > 1 {
                self.shared.update_stats(|s| s.retries += 1);
                tokio::time::sleep(self.backoff * (attempt - 1)).await;
            }

            let stored = match self.store.get(&self.key).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(attempt, error = %e, "Failed to read stored version");
                    last_error = e.to_string();
                    continue;
                }
            };
            let (stored_version, stored_tabs) = read_stored(stored.as_ref());

            let mut tabs = payload.tabs.clone();
            let mut rebased = false;
            let conflict = self.expected_version.map(|v| stored_version > v).unwrap_or(false);
            if conflict {
                warn!(
                    stored_version,
                    expected_version = ?self.expected_version,
                    "Version conflict, rebasing onto stored state"
                );
                self.shared.update_stats(|s| s.conflicts += 1);
                tabs = stored_tabs;
                payload.delta.apply_to(&mut tabs);
                rebased = true;
            }

            let version = stored_version.max(self.storage_version) + 1;
            let write_source_id = self.generate_source_id();
            let record = PersistedState {
                tabs,
                timestamp: payload.last_update,
                write_source_id: write_source_id.clone(),
                version,
            };

            match self.put(&record).await {
                Ok(()) => {
                    self.expected_version = Some(version);
                    self.storage_version = version;
                    debug!(version, attempt, rebased, tabs = record.tabs.len(), "State persisted");
                    return Ok(WriteOutcome {
                        version,
                        write_source_id,
                        attempts: attempt,
                        rebased,
                        tabs: record.tabs,
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "State write failed");
                    last_error = e;
                }
            }
        }

        error!(attempts = self.retry_limit, error = %last_error, "Write retries exhausted");
        Err(WriteQueueError::RetriesExhausted {
            attempts: self.retry_limit,
            last_error,
        })
    }

    async fn write_baseline(&mut self, state: CanonicalState) -> Result<WriteOutcome, WriteQueueError> {
        let mut last_error = String::new();
        for attempt in 1..=self.retry_limit {
            if attempt > 1 {
                self.shared.update_stats(|s| s.retries += 1);
                tokio::time::sleep(self.backoff * (attempt - 1)).await;
            }
            let write_source_id = self.generate_source_id();
            let record = PersistedState {
                tabs: state.tabs.clone(),
                timestamp: state.last_update,
                write_source_id: write_source_id.clone(),
                version: state.version,
            };
            match self.put(&record).await {
                Ok(()) => {
                    self.expected_version = Some(state.version);
                    self.storage_version = state.version;
                    info!(version = state.version, tabs = record.tabs.len(), "Baseline re-persisted");
                    return Ok(WriteOutcome {
                        version: state.version,
                        write_source_id,
                        attempts: attempt,
                        rebased: false,
                        tabs: record.tabs,
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Baseline write failed");
                    last_error = e;
                }
            }
        }
        Err(WriteQueueError::RetriesExhausted {
            attempts: self.retry_limit,
            last_error,
        })
    }

    async fn put(&self, record: &PersistedState) -> Result<(), String> {
        let value = serde_json::to_value(record).map_err(|e| e.to_string())?;
        // Remember the token before the store can echo it back.
        self.shared.remember(&record.write_source_id);
        self.store.set(&self.key, value).await.map_err(|e| e.to_string())
    }

    fn generate_source_id(&self) -> String {
        let mut bytes = [0u8; 12];
        match self.rng.fill(&mut bytes) {
            Ok(()) => format!("w-{}", URL_SAFE_NO_PAD.encode(bytes)),
            Err(_) => format!("w-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

fn read_stored(stored: Option<&Value>) -> (u64, Vec<QuickTabRecord>) {
    let value = match stored {
        Some(v) => v,
        None => return (0, Vec::new()),
    };
    let version = value.get("version").and_then(Value::as_u64).unwrap_or(0);
    // One malformed record must not drop its valid neighbours.
    (version, parse_records(value.get("tabs"), None))
}
