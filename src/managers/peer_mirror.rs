//! Peer-side read mirror.
//!
//! A peer learns about state changes from up to three sources: the local bus,
//! a direct message from the coordinator and the durable-store notification.
//! The same snapshot usually arrives more than once; [`PeerMirror`] keeps only
//! snapshots whose `(version, timestamp)` token improves on what it holds.

use serde_json::Value;
use tracing::debug;

use crate::database::StorageChange;
use crate::services::format_migrator::migrate_payload;
use crate::types::peer::PeerId;
use crate::types::quick_tab::{QuickTabRecord, StateSnapshot, DEFAULT_CONTAINER_ID, STATE_SYNC_OPERATION};

pub struct PeerMirror {
    peer_id: PeerId,
    container_id: String,
    url: Option<String>,
    snapshot: Option<StateSnapshot>,
    applied: u64,
    ignored: u64,
}

impl PeerMirror {
    pub fn new(peer_id: PeerId, container_id: Option<&str>) -> Self {
        Self {
            peer_id,
            container_id: container_id.unwrap_or(DEFAULT_CONTAINER_ID).to_string(),
            url: None,
            snapshot: None,
            applied: 0,
            ignored: 0,
        }
    }

    /// Sets the page URL, used to evaluate URL pins.
    pub fn set_url(&mut self, url: &str) {
        self.url = Some(url.to_string());
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn token(&self) -> Option<(u64, i64)> {
        self.snapshot.as_ref().map(StateSnapshot::token)
    }

    pub fn version(&self) -> u64 {
        self.snapshot.as_ref().map(|s| s.version).unwrap_or(0)
    }

    pub fn tabs(&self) -> &[QuickTabRecord] {
        self.snapshot.as_ref().map(|s| s.tabs.as_slice()).unwrap_or(&[])
    }

    /// (applied, ignored) delivery counts.
    pub fn counts(&self) -> (u64, u64) {
        (self.applied, self.ignored)
    }

    /// Replaces the mirror if `snapshot` is newer. Returns true when applied.
    pub fn apply_snapshot(&mut self, snapshot: StateSnapshot) -> bool {
        if let Some(current) = self.token() {
            if snapshot.token() <= current {
                self.ignored += 1;
                debug!(peer = %self.peer_id, version = snapshot.version, "Stale or repeated snapshot ignored");
                return false;
            }
        }
        self.applied += 1;
        self.snapshot = Some(snapshot);
        true
    }

    /// Handles a `stateSync` message from the local bus or a direct send.
    pub fn apply_message(&mut self, message: &Value) -> bool {
        if message.get("operation").and_then(Value::as_str) != Some(STATE_SYNC_OPERATION) {
            return false;
        }
        match message
            .get("state")
            .cloned()
            .and_then(|s| serde_json::from_value::<StateSnapshot>(s).ok())
        {
            Some(snapshot) => self.apply_snapshot(snapshot),
            None => false,
        }
    }

    /// Handles a durable-store notification for `state_key`.
    pub fn apply_storage_change(&mut self, change: &StorageChange, state_key: &str) -> bool {
        if change.key != state_key {
            return false;
        }
        let (_, state) = migrate_payload(change.new_value.as_ref());
        self.apply_snapshot(StateSnapshot::from_state(&state))
    }

    /// Overlays this peer should render: same container, not muted or
    /// excluded by a solo elsewhere, and not pinned to another URL.
    pub fn visible_tabs(&self) -> Vec<&QuickTabRecord> {
        self.tabs()
            .iter()
            .filter(|t| t.container_id == self.container_id)
            .filter(|t| t.is_visible_on(self.peer_id))
            .filter(|t| match (&t.pinned_to_url, &self.url) {
                (None, _) => true,
                (Some(pin), Some(url)) => pin == url,
                (Some(_), None) => false,
            })
            .collect()
    }
}
