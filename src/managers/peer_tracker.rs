//! Live peer set maintained by the coordinator.
//!
//! Removals are debounced: a peer that disappears and comes back within the
//! debounce window (page reload, bfcache restore) never produces a removal.
//! Finalized removals are delivered on the receiver returned by
//! [`PeerTracker::new`] so the coordinator can run orphan detection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::types::events::{PeerEvent, SyncEvent};
use crate::types::peer::{PeerId, PeerRecord, PeerUpdate};

/// Differences corrected by one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub added: Vec<PeerId>,
    pub updated: Vec<PeerId>,
    pub removed: Vec<PeerId>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

struct PendingRemoval {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct Inner {
    peers: BTreeMap<PeerId, PeerRecord>,
    pending: HashMap<PeerId, PendingRemoval>,
    generation: u64,
}

/// Shared handle to the peer table. Cheap to clone.
#[derive(Clone)]
pub struct PeerTracker {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<SyncEvent>,
    removals: mpsc::UnboundedSender<PeerId>,
    debounce: Duration,
}

impl PeerTracker {
    pub fn new(debounce: Duration, events: broadcast::Sender<SyncEvent>) -> (Self, mpsc::UnboundedReceiver<PeerId>) {
        let (removals, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
            removals,
            debounce,
        };
        (tracker, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the table leaves it consistent enough to keep serving.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(SyncEvent::PeerChanged(event));
    }

    /// Registers or replaces a peer, cancelling any pending removal.
    pub fn peer_added(&self, peer: PeerRecord) {
        let event = {
            let mut inner = self.lock();
            if let Some(pending) = inner.pending.remove(&peer.peer_id) {
                pending.handle.abort();
                debug!(peer = %peer.peer_id, "Pending removal cancelled");
            }
            match inner.peers.insert(peer.peer_id, peer.clone()) {
                Some(previous) if previous == peer => None,
                Some(_) => Some(PeerEvent::Updated { peer }),
                None => Some(PeerEvent::Added { peer }),
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Applies a partial update. Unknown peers are registered from the update.
    pub fn peer_updated(&self, peer_id: PeerId, update: &PeerUpdate) -> PeerRecord {
        let (record, event) = {
            let mut inner = self.lock();
            if let Some(pending) = inner.pending.remove(&peer_id) {
                pending.handle.abort();
            }
            match inner.peers.get_mut(&peer_id) {
                Some(existing) => {
                    let changed = existing.apply(update);
                    let record = existing.clone();
                    let event = changed.then(|| PeerEvent::Updated { peer: record.clone() });
                    (record, event)
                }
                None => {
                    let mut record = PeerRecord::new(peer_id, "");
                    record.apply(update);
                    inner.peers.insert(peer_id, record.clone());
                    (record.clone(), Some(PeerEvent::Added { peer: record }))
                }
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
        record
    }

    /// Schedules removal of `peer_id` after the debounce delay.
    /// Returns false if the peer is unknown.
    pub fn peer_removed(&self, peer_id: PeerId) -> bool {
        let mut inner = self.lock();
        if !inner.peers.contains_key(&peer_id) {
            return false;
        }
        if inner.pending.contains_key(&peer_id) {
            return true;
        }
        inner.generation += 1;
        let generation = inner.generation;
        let tracker = self.clone();
        let delay = self.debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracker.finalize_removal(peer_id, generation);
        });
        inner.pending.insert(
            peer_id,
            PendingRemoval {
                generation,
                handle: task.abort_handle(),
            },
        );
        debug!(peer = %peer_id, delay_ms = delay.as_millis() as u64, "Peer removal scheduled");
        true
    }

    fn finalize_removal(&self, peer_id: PeerId, generation: u64) {
        let removed = {
            let mut inner = self.lock();
            match inner.pending.get(&peer_id) {
                Some(p) if p.generation == generation => {
                    inner.pending.remove(&peer_id);
                    inner.peers.remove(&peer_id).is_some()
                }
                _ => false,
            }
        };
        if removed {
            self.announce_removal(peer_id);
        }
    }

    fn announce_removal(&self, peer_id: PeerId) {
        info!(peer = %peer_id, "Peer removed");
        self.emit(PeerEvent::Removed { peer_id });
        let _ = self.removals.send(peer_id);
    }

    /// Replaces drift between the table and the `live` set reported by the transport.
    pub fn reconcile(&self, live: Vec<PeerRecord>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            let live_ids: BTreeSet<PeerId> = live.iter().map(|p| p.peer_id).collect();

            for peer in live {
                if let Some(pending) = inner.pending.remove(&peer.peer_id) {
                    pending.handle.abort();
                }
                match inner.peers.insert(peer.peer_id, peer.clone()) {
                    None => {
                        report.added.push(peer.peer_id);
                        events.push(PeerEvent::Added { peer });
                    }
                    Some(previous) if previous != peer => {
                        report.updated.push(peer.peer_id);
                        events.push(PeerEvent::Updated { peer });
                    }
                    Some(_) => {}
                }
            }

            let stale: Vec<PeerId> = inner
                .peers
                .keys()
                .filter(|id| !live_ids.contains(id))
                .copied()
                .collect();
            for peer_id in stale {
                if let Some(pending) = inner.pending.remove(&peer_id) {
                    pending.handle.abort();
                }
                inner.peers.remove(&peer_id);
                report.removed.push(peer_id);
            }
        }

        for event in events {
            self.emit(event);
        }
        for peer_id in &report.removed {
            self.announce_removal(*peer_id);
        }
        if !report.is_clean() {
            info!(
                added = report.added.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                "Peer set reconciled"
            );
        }
        report
    }

    pub fn get(&self, peer_id: PeerId) -> Option<PeerRecord> {
        self.lock().peers.get(&peer_id).cloned()
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.lock().peers.contains_key(&peer_id)
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.lock().peers.values().cloned().collect()
    }

    pub fn peer_ids(&self) -> BTreeSet<PeerId> {
        self.lock().peers.keys().copied().collect()
    }

    pub fn is_removal_pending(&self, peer_id: PeerId) -> bool {
        self.lock().pending.contains_key(&peer_id)
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().peers.is_empty()
    }
}
