use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::peer::PeerId;

/// Container used when a record or peer carries no isolation namespace.
pub const DEFAULT_CONTAINER_ID: &str = "firefox-default";

pub const DEFAULT_LEFT: i32 = 100;
pub const DEFAULT_TOP: i32 = 100;
pub const DEFAULT_WIDTH: u32 = 800;
pub const DEFAULT_HEIGHT: u32 = 600;

fn default_left() -> i32 {
    DEFAULT_LEFT
}

fn default_top() -> i32 {
    DEFAULT_TOP
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

fn default_container() -> String {
    DEFAULT_CONTAINER_ID.to_string()
}

/// One floating overlay window.
///
/// Every field except `id` has a default so that records written by older
/// schema versions still deserialize. Legacy key names are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickTabRecord {
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_left")]
    pub left: i32,
    #[serde(default = "default_top")]
    pub top: i32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub minimized: bool,
    #[serde(default)]
    pub z_index: i64,
    #[serde(default, alias = "originTabId")]
    pub origin_peer_id: Option<PeerId>,
    #[serde(default)]
    pub sequence_id: u64,
    #[serde(default = "default_container", alias = "cookieStoreId")]
    pub container_id: String,
    #[serde(default)]
    pub pinned_to_url: Option<String>,
    #[serde(default, alias = "soloedOnTabs")]
    pub soloed_on_peers: BTreeSet<PeerId>,
    #[serde(default, alias = "mutedOnTabs")]
    pub muted_on_peers: BTreeSet<PeerId>,
    #[serde(default)]
    pub created_at: i64,
}

impl QuickTabRecord {
    pub fn new(id: &str, url: &str, origin_peer_id: Option<PeerId>) -> Self {
        Self {
            id: id.to_string(),
            url: url.to_string(),
            title: String::new(),
            left: DEFAULT_LEFT,
            top: DEFAULT_TOP,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            minimized: false,
            z_index: 0,
            origin_peer_id,
            sequence_id: 0,
            container_id: default_container(),
            pinned_to_url: None,
            soloed_on_peers: BTreeSet::new(),
            muted_on_peers: BTreeSet::new(),
            created_at: 0,
        }
    }

    /// Repairs values older writers were allowed to store: zero-sized geometry,
    /// an empty container and overlapping solo/mute sets.
    pub fn normalize(&mut self) {
        if self.width == 0 {
            self.width = DEFAULT_WIDTH;
        }
        if self.height == 0 {
            self.height = DEFAULT_HEIGHT;
        }
        if self.container_id.is_empty() {
            self.container_id = default_container();
        }
        if !self.soloed_on_peers.is_empty() {
            self.muted_on_peers.clear();
        }
    }

    /// Toggles solo for `peer`. Soloing clears every mute on the record.
    pub fn toggle_solo(&mut self, peer: PeerId) -> bool {
        if self.soloed_on_peers.remove(&peer) {
            false
        } else {
            self.soloed_on_peers.insert(peer);
            self.muted_on_peers.clear();
            true
        }
    }

    /// Toggles mute for `peer`. Muting clears every solo on the record.
    pub fn toggle_mute(&mut self, peer: PeerId) -> bool {
        if self.muted_on_peers.remove(&peer) {
            false
        } else {
            self.muted_on_peers.insert(peer);
            self.soloed_on_peers.clear();
            true
        }
    }

    /// Whether the overlay should render inside `peer`.
    pub fn is_visible_on(&self, peer: PeerId) -> bool {
        if !self.soloed_on_peers.is_empty() {
            return self.soloed_on_peers.contains(&peer);
        }
        !self.muted_on_peers.contains(&peer)
    }
}

/// The authoritative in-memory shape of the durable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalState {
    pub tabs: Vec<QuickTabRecord>,
    pub last_update: i64,
    pub version: u64,
}

impl CanonicalState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn find(&self, id: &str) -> Option<&QuickTabRecord> {
        self.tabs.iter().find(|t| t.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut QuickTabRecord> {
        self.tabs.iter_mut().find(|t| t.id == id)
    }

    /// Inserts or replaces by id. Returns true when the record was new.
    pub fn upsert(&mut self, record: QuickTabRecord) -> bool {
        match self.tabs.iter_mut().find(|t| t.id == record.id) {
            Some(existing) => {
                *existing = record;
                false
            }
            None => {
                self.tabs.push(record);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<QuickTabRecord> {
        let idx = self.tabs.iter().position(|t| t.id == id)?;
        Some(self.tabs.remove(idx))
    }

    /// Drops repeated ids, keeping the last occurrence in its original slot order.
    pub fn dedupe_ids(&mut self) -> usize {
        let mut seen = BTreeSet::new();
        let before = self.tabs.len();
        let mut kept: Vec<QuickTabRecord> = Vec::with_capacity(before);
        for record in self.tabs.drain(..).rev() {
            if seen.insert(record.id.clone()) {
                kept.push(record);
            }
        }
        kept.reverse();
        self.tabs = kept;
        before - self.tabs.len()
    }

    pub fn for_container<'a>(&'a self, container_id: &'a str) -> impl Iterator<Item = &'a QuickTabRecord> + 'a {
        self.tabs.iter().filter(move |t| t.container_id == container_id)
    }

    pub fn max_sequence_id(&self) -> u64 {
        self.tabs.iter().map(|t| t.sequence_id).max().unwrap_or(0)
    }

    pub fn max_z_index(&self) -> i64 {
        self.tabs.iter().map(|t| t.z_index).max().unwrap_or(0)
    }
}

/// The record written to the durable store under the state key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub tabs: Vec<QuickTabRecord>,
    pub timestamp: i64,
    pub write_source_id: String,
    pub version: u64,
}

/// A versioned copy of the state handed to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub tabs: Vec<QuickTabRecord>,
    pub version: u64,
    pub timestamp: i64,
}

/// Operation name peers listen for when a snapshot is pushed to them.
pub const STATE_SYNC_OPERATION: &str = "stateSync";

impl StateSnapshot {
    pub fn from_state(state: &CanonicalState) -> Self {
        Self {
            tabs: state.tabs.clone(),
            version: state.version,
            timestamp: state.last_update,
        }
    }

    /// Ordering token used by consumers to drop stale or repeated deliveries.
    pub fn token(&self) -> (u64, i64) {
        (self.version, self.timestamp)
    }

    pub fn to_message(&self) -> Value {
        json!({
            "operation": STATE_SYNC_OPERATION,
            "state": self,
        })
    }
}
