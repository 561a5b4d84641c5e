//! Unit tests for snapshot fan-out to peers and the local bus.

use std::sync::Arc;
use std::time::Duration;

use quicktabs::services::broadcast_manager::{BroadcastManager, BroadcastOptions};
use quicktabs::services::peer_transport::{ChannelTransport, LocalBroadcastBus, LocalBus, PeerDelivery};
use quicktabs::types::errors::TransportError;
use quicktabs::types::peer::{PeerId, PeerRecord, PeerStatus};
use quicktabs::types::quick_tab::{QuickTabRecord, StateSnapshot};
use serde_json::json;
use tokio::sync::mpsc;

fn snapshot(version: u64) -> StateSnapshot {
    StateSnapshot {
        tabs: vec![QuickTabRecord::new("qt-1", "https://a.test", Some(PeerId(1)))],
        version,
        timestamp: 1_000 + version as i64,
    }
}

/// Acknowledges every delivery until the inbox closes.
fn auto_ack(mut inbox: mpsc::UnboundedReceiver<PeerDelivery>) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut seen = 0;
        while let Some(delivery) = inbox.recv().await {
            seen += 1;
            let _ = delivery.ack.send(());
        }
        seen
    })
}

fn setup() -> (Arc<ChannelTransport>, Arc<LocalBroadcastBus>, BroadcastManager) {
    let transport = Arc::new(ChannelTransport::new());
    let bus = Arc::new(LocalBroadcastBus::new(8));
    let manager = BroadcastManager::new(transport.clone(), bus.clone());
    (transport, bus, manager)
}

#[tokio::test]
async fn test_delivers_to_every_live_peer() {
    let (transport, _bus, manager) = setup();
    auto_ack(transport.register_peer(PeerRecord::new(PeerId(1), "https://one.test")));
    auto_ack(transport.register_peer(PeerRecord::new(PeerId(2), "https://two.test")));

    let report = manager.broadcast(&snapshot(1), &BroadcastOptions::default()).await;

    assert_eq!(report.delivered.len(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(report.attempted(), 2);
}

#[tokio::test]
async fn test_excluded_peer_is_skipped() {
    let (transport, _bus, manager) = setup();
    auto_ack(transport.register_peer(PeerRecord::new(PeerId(1), "https://one.test")));
    auto_ack(transport.register_peer(PeerRecord::new(PeerId(2), "https://two.test")));

    let options = BroadcastOptions {
        exclude_peer_id: Some(PeerId(1)),
        ..Default::default()
    };
    let report = manager.broadcast(&snapshot(1), &options).await;

    assert_eq!(report.delivered, vec![PeerId(2)]);
    assert_eq!(report.skipped, vec![PeerId(1)]);
}

#[tokio::test]
async fn test_internal_and_unloaded_pages_are_skipped() {
    let (transport, _bus, manager) = setup();
    auto_ack(transport.register_peer(PeerRecord::new(PeerId(1), "about:newtab")));
    let mut unloaded = PeerRecord::new(PeerId(2), "https://two.test");
    unloaded.status = PeerStatus::Unloaded;
    auto_ack(transport.register_peer(unloaded));
    auto_ack(transport.register_peer(PeerRecord::new(PeerId(3), "https://three.test")));

    let report = manager.broadcast(&snapshot(1), &BroadcastOptions::default()).await;
    assert_eq!(report.delivered, vec![PeerId(3)]);
    assert_eq!(report.skipped.len(), 2);

    let everyone = BroadcastOptions {
        only_live_peers: false,
        ..Default::default()
    };
    let report = manager.broadcast(&snapshot(2), &everyone).await;
    assert_eq!(report.delivered.len(), 2);
}

#[tokio::test]
async fn test_not_listening_peer_does_not_block_others() {
    let (transport, _bus, manager) = setup();
    drop(transport.register_peer(PeerRecord::new(PeerId(1), "https://gone.test")));
    auto_ack(transport.register_peer(PeerRecord::new(PeerId(2), "https://two.test")));

    let report = manager.broadcast(&snapshot(1), &BroadcastOptions::default()).await;

    assert_eq!(report.delivered, vec![PeerId(2)]);
    assert_eq!(
        report.failed,
        vec![(PeerId(1), TransportError::NotListening(PeerId(1)))]
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_peer_times_out() {
    let (transport, _bus, manager) = setup();
    // Keep the inbox open but never acknowledge.
    let _silent = transport.register_peer(PeerRecord::new(PeerId(1), "https://slow.test"));
    auto_ack(transport.register_peer(PeerRecord::new(PeerId(2), "https://two.test")));

    let options = BroadcastOptions {
        timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let report = manager.broadcast(&snapshot(1), &options).await;

    assert_eq!(report.delivered, vec![PeerId(2)]);
    assert_eq!(report.failed, vec![(PeerId(1), TransportError::Timeout(PeerId(1)))]);
}

#[tokio::test]
async fn test_local_bus_receives_state_sync() {
    let (_transport, bus, manager) = setup();
    let mut local = bus.subscribe();

    let report = manager.broadcast(&snapshot(4), &BroadcastOptions::default()).await;

    assert_eq!(report.local_bus_receivers, 1);
    let message = local.recv().await.unwrap();
    assert_eq!(message["operation"], json!("stateSync"));
    assert_eq!(message["state"]["version"], json!(4));
}

#[tokio::test]
async fn test_metrics_accumulate_per_peer() {
    let (transport, _bus, manager) = setup();
    auto_ack(transport.register_peer(PeerRecord::new(PeerId(1), "https://one.test")));
    drop(transport.register_peer(PeerRecord::new(PeerId(2), "https://two.test")));

    manager.broadcast(&snapshot(1), &BroadcastOptions::default()).await;
    manager.broadcast(&snapshot(2), &BroadcastOptions::default()).await;

    let metrics = manager.metrics();
    assert_eq!(metrics.total_broadcasts, 2);
    assert_eq!(metrics.per_peer[&PeerId(1)].success, 2);
    assert_eq!(metrics.per_peer[&PeerId(2)].failure, 2);
    assert!(metrics.last_broadcast_at.is_some());
}
