use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::message::PROTOCOL_VERSION;

/// Top-level coordinator settings container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SyncSettings {
    pub protocol: ProtocolSettings,
    pub storage: StorageSettings,
    pub dedup: DedupSettings,
    pub broadcast: BroadcastSettings,
    pub peers: PeerSettings,
}

/// Protocol negotiation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolSettings {
    pub version: String,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Durable store and write queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSettings {
    pub state_key: String,
    pub database_file: String,
    pub write_retry_limit: u32,
    pub retry_backoff_ms: u64,
    pub self_write_grace_ms: u64,
    pub hydration_timeout_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            state_key: "quick_tabs_state_v2".to_string(),
            database_file: "quicktabs.db".to_string(),
            write_retry_limit: 3,
            retry_backoff_ms: 25,
            self_write_grace_ms: 500,
            hydration_timeout_ms: 2_000,
        }
    }
}

/// Duplicate-submission suppression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupSettings {
    pub window_ms: u64,
    pub ttl_ms: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            window_ms: 250,
            ttl_ms: 5_000,
        }
    }
}

/// Fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastSettings {
    pub timeout_ms: u64,
    pub only_live_peers: bool,
    pub local_bus_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 1_000,
            only_live_peers: true,
            local_bus_capacity: 64,
        }
    }
}

/// Peer lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerSettings {
    pub removal_debounce_ms: u64,
    pub reconciliation_interval_secs: u64,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            removal_debounce_ms: 200,
            reconciliation_interval_secs: 300,
        }
    }
}

impl SyncSettings {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup.window_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup.ttl_ms.max(self.dedup.window_ms))
    }

    pub fn self_write_grace(&self) -> Duration {
        Duration::from_millis(self.storage.self_write_grace_ms)
    }

    pub fn hydration_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.hydration_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.storage.retry_backoff_ms)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast.timeout_ms)
    }

    pub fn removal_debounce(&self) -> Duration {
        Duration::from_millis(self.peers.removal_debounce_ms)
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.peers.reconciliation_interval_secs.max(1))
    }
}
