// Quick Tabs Broadcast Manager
// Fans a state snapshot out to every addressable peer over the local bus and by
// direct message. Sends are independent, time-boxed and never retried: the
// durable-store notification is the fallback path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::services::peer_transport::{LocalBus, PeerTransport};
use crate::types::errors::TransportError;
use crate::types::now_millis;
use crate::types::peer::PeerId;
use crate::types::quick_tab::StateSnapshot;

/// Per-call broadcast options.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastOptions {
    pub exclude_peer_id: Option<PeerId>,
    pub only_live_peers: bool,
    pub timeout: Duration,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            exclude_peer_id: None,
            only_live_peers: true,
            timeout: Duration::from_millis(1_000),
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastReport {
    pub delivered: Vec<PeerId>,
    pub failed: Vec<(PeerId, TransportError)>,
    pub skipped: Vec<PeerId>,
    pub local_bus_receivers: usize,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDeliveryStats {
    pub success: u64,
    pub failure: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMetrics {
    pub total_broadcasts: u64,
    pub per_peer: BTreeMap<PeerId, PeerDeliveryStats>,
    pub last_broadcast_at: Option<i64>,
    pub local_bus_deliveries: u64,
}

pub struct BroadcastManager {
    transport: Arc<dyn PeerTransport>,
    bus: Arc<dyn LocalBus>,
    metrics: Mutex<BroadcastMetrics>,
}

impl BroadcastManager {
    pub fn new(transport: Arc<dyn PeerTransport>, bus: Arc<dyn LocalBus>) -> Self {
        Self {
            transport,
            bus,
            metrics: Mutex::new(BroadcastMetrics::default()),
        }
    }

    /// Publishes `snapshot` on the local bus, then sends it to every eligible peer.
    pub async fn broadcast(&self, snapshot: &StateSnapshot, options: &BroadcastOptions) -> BroadcastReport {
        let message = snapshot.to_message();
        let mut report = BroadcastReport {
            local_bus_receivers: self.bus.publish(message.clone()),
            ..Default::default()
        };

        let peers = match self.transport.list_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "Could not enumerate peers for broadcast");
                Vec::new()
            }
        };

        let mut targets = Vec::with_capacity(peers.len());
        for peer in peers {
            let excluded = options.exclude_peer_id == Some(peer.peer_id);
            let dormant = options.only_live_peers && !peer.is_live();
            if excluded || dormant || !peer.is_addressable() {
                report.skipped.push(peer.peer_id);
            } else {
                targets.push(peer.peer_id);
            }
        }

        let sends = targets.iter().map(|&peer_id| {
            let message = message.clone();
            let transport = self.transport.clone();
            let timeout = options.timeout;
            async move {
                let result = match tokio::time::timeout(timeout, transport.send_to_peer(peer_id, message)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(peer_id)),
                };
                (peer_id, result)
            }
        });

        for (peer_id, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered.push(peer_id),
                Err(TransportError::NotListening(_)) => {
                    debug!(peer = %peer_id, "Peer not listening");
                    report.failed.push((peer_id, TransportError::NotListening(peer_id)));
                }
                Err(e) => {
                    warn!(peer = %peer_id, error = %e, "Broadcast delivery failed");
                    report.failed.push((peer_id, e));
                }
            }
        }

        self.record(&report);
        debug!(
            version = snapshot.version,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            local = report.local_bus_receivers,
            "Broadcast complete"
        );
        report
    }

    pub fn metrics(&self) -> BroadcastMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn record(&self, report: &BroadcastReport) {
        let mut metrics = match self.metrics.lock() {
            Ok(m) => m,
            Err(_) => return,
        };
        metrics.total_broadcasts += 1;
        metrics.last_broadcast_at = Some(now_millis());
        metrics.local_bus_deliveries += report.local_bus_receivers as u64;
        for peer in &report.delivered {
            metrics.per_peer.entry(*peer).or_default().success += 1;
        }
        for (peer, _) in &report.failed {
            metrics.per_peer.entry(*peer).or_default().failure += 1;
        }
    }
}
