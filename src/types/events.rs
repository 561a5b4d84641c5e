use serde::Serialize;

use super::peer::{PeerId, PeerRecord};

/// Peer lifecycle notifications published by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PeerEvent {
    Added { peer: PeerRecord },
    Updated { peer: PeerRecord },
    Removed { peer_id: PeerId },
}

/// Events exposed to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    StateChanged { version: u64, last_update: i64 },
    PeerChanged(PeerEvent),
    /// Records whose origin peer is gone for good.
    OrphansDetected { peer_id: PeerId, quick_tab_ids: Vec<String> },
}
