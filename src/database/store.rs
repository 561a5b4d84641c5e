//! Durable key/value store shared by every coordinator instance.
//!
//! The store holds JSON documents under string keys and notifies subscribers
//! of every change, including changes made through the same handle. Two
//! backends are provided: [`SqliteStore`] for real persistence and
//! [`MemoryStore`] for tests and embedding.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::connection::Database;
use crate::types::errors::StoreError;
use crate::types::now_millis;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A single key change observed on the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Asynchronous key/value store with change notifications.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
    /// Receives every subsequent change to any key.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

// === SqliteStore ===

/// SQLite-backed store. Values are kept as JSON text in `kv_store`.
///
/// Queries run on the blocking pool; the connection lock is held across
/// each write and its change notification so subscribers see writes in
/// commit order.
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
    changes: broadcast::Sender<StorageChange>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Ok(Self::from_database(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    pub fn from_database(db: Database) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            db: Arc::new(Mutex::new(db)),
            changes,
        }
    }

    /// Number of writes recorded for `key`.
    pub async fn revision(&self, key: &str) -> Result<i64, StoreError> {
        let key = key.to_string();
        self.with_db(move |db| Ok(db.revision(&key)?)).await
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| StoreError::Unavailable("database lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("database task failed: {}", e)))?
    }

    fn read(db: &Database, key: &str) -> Result<Option<Value>, StoreError> {
        match db.get_value(key)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let key = key.to_string();
        self.with_db(move |db| Self::read(db, &key)).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let text = serde_json::to_string(&value)?;
        let key = key.to_string();
        let changes = self.changes.clone();
        self.with_db(move |db| {
            // A corrupt previous value must not block overwriting it.
            let old_value = Self::read(db, &key).unwrap_or(None);
            db.put_value(&key, &text, now_millis())?;
            let _ = changes.send(StorageChange {
                key,
                old_value,
                new_value: Some(value),
            });
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let changes = self.changes.clone();
        self.with_db(move |db| {
            let old_value = Self::read(db, &key).unwrap_or(None);
            if db.delete_value(&key)? {
                let _ = changes.send(StorageChange {
                    key,
                    old_value,
                    new_value: None,
                });
            }
            Ok(())
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

// === MemoryStore ===

/// In-memory store with hooks for simulating a slow or failing backend.
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
    changes: broadcast::Sender<StorageChange>,
    writes: AtomicU64,
    failing_writes: AtomicU32,
    failing_reads: AtomicBool,
    read_delay_ms: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: Mutex::new(HashMap::new()),
            changes,
            writes: AtomicU64::new(0),
            failing_writes: AtomicU32::new(0),
            failing_reads: AtomicBool::new(false),
            read_delay_ms: AtomicU64::new(0),
        }
    }

    /// Seeds a value without counting a write or notifying subscribers.
    pub fn with_value(self, key: &str, value: Value) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
        self
    }

    /// The next `n` calls to `set` fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// While enabled every `get` fails.
    pub fn fail_reads(&self, enabled: bool) {
        self.failing_reads.store(enabled, Ordering::SeqCst);
    }

    /// Delays every `get` by `delay`.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Successful `set` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Synchronous read for assertions.
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.values.lock().ok().and_then(|v| v.get(key).cloned())
    }

    fn take_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("read failure injected".to_string()));
        }
        let values = self
            .values
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        if self.take_failure() {
            return Err(StoreError::Unavailable("write failure injected".to_string()));
        }
        let old_value = {
            let mut values = self
                .values
                .lock()
                .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;
            values.insert(key.to_string(), value.clone())
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            old_value,
            new_value: Some(value),
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let old_value = {
            let mut values = self
                .values
                .lock()
                .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;
            values.remove(key)
        };
        if old_value.is_some() {
            let _ = self.changes.send(StorageChange {
                key: key.to_string(),
                old_value,
                new_value: None,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}
