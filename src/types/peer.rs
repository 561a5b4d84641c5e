use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one peer context (a browser tab). Supplied by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(value: u64) -> Self {
        PeerId(value)
    }
}

/// Loading status of a peer as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PeerStatus {
    Loading,
    #[default]
    Complete,
    /// The context still exists but its page has been discarded and cannot answer messages.
    Unloaded,
}

/// The coordinator's view of one live peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: PeerId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub status: PeerStatus,
    #[serde(default)]
    pub container_id: Option<String>,
}

/// URL schemes of pages that cannot host overlays or receive messages.
const INTERNAL_SCHEMES: &[&str] = &[
    "about:",
    "chrome:",
    "chrome-extension:",
    "moz-extension:",
    "edge:",
    "resource:",
    "view-source:",
    "devtools:",
];

impl PeerRecord {
    pub fn new(peer_id: PeerId, url: &str) -> Self {
        Self {
            peer_id,
            title: String::new(),
            url: url.to_string(),
            active: false,
            status: PeerStatus::Complete,
            container_id: None,
        }
    }

    /// Whether messages can be delivered to this peer at all.
    pub fn is_addressable(&self) -> bool {
        let url = self.url.trim().to_ascii_lowercase();
        !url.is_empty() && !INTERNAL_SCHEMES.iter().any(|s| url.starts_with(s))
    }

    pub fn is_live(&self) -> bool {
        self.status != PeerStatus::Unloaded
    }

    /// Applies a partial update, returning true if any field changed.
    pub fn apply(&mut self, update: &PeerUpdate) -> bool {
        let before = self.clone();
        if let Some(title) = &update.title {
            self.title = title.clone();
        }
        if let Some(url) = &update.url {
            self.url = url.clone();
        }
        if let Some(active) = update.active {
            self.active = active;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(container_id) = &update.container_id {
            self.container_id = Some(container_id.clone());
        }
        *self != before
    }
}

/// Partial peer metadata reported on peer activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub status: Option<PeerStatus>,
    #[serde(default)]
    pub container_id: Option<String>,
}
