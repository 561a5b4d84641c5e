use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Last time an `(operation, object id)` pair was accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupEntry {
    pub key: String,
    pub last_seen_at: Instant,
}

/// Suppresses repeated submissions of the same operation on the same object.
pub struct DedupTracker {
    entries: HashMap<String, DedupEntry>,
    window: Duration,
    ttl: Duration,
}

impl DedupTracker {
    pub fn new(window: Duration, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            window,
            ttl: ttl.max(window),
        }
    }

    pub fn key(operation: &str, object_id: &str) -> String {
        format!("{}:{}", operation, object_id)
    }

    /// True if the same key was accepted within the window.
    pub fn is_duplicate(&mut self, operation: &str, object_id: &str) -> bool {
        let now = Instant::now();
        self.purge(now);
        self.entries
            .get(&Self::key(operation, object_id))
            .map(|e| now.duration_since(e.last_seen_at) < self.window)
            .unwrap_or(false)
    }

    /// Records an accepted submission.
    pub fn record(&mut self, operation: &str, object_id: &str) {
        let key = Self::key(operation, object_id);
        self.entries.insert(
            key.clone(),
            DedupEntry {
                key,
                last_seen_at: Instant::now(),
            },
        );
    }

    pub fn forget(&mut self, operation: &str, object_id: &str) {
        self.entries.remove(&Self::key(operation, object_id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| now.duration_since(e.last_seen_at) < ttl);
    }
}
