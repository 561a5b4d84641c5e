//! End-to-end tests for the coordinator: routed requests, cross-context
//! convergence over a shared store, orphan detection and the spawned task.

use std::sync::Arc;
use std::time::Duration;

use quicktabs::app::Coordinator;
use quicktabs::database::{DurableStore, MemoryStore};
use quicktabs::message_router::RouteOutcome;
use quicktabs::services::peer_transport::{ChannelTransport, LocalBroadcastBus, PeerDelivery};
use quicktabs::types::errors::CoordinatorError;
use quicktabs::types::events::SyncEvent;
use quicktabs::types::message::{ErrorCode, ResponseEnvelope, SenderContext};
use quicktabs::types::peer::{PeerId, PeerRecord};
use quicktabs::types::settings::SyncSettings;
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn settings() -> SyncSettings {
    let mut settings = SyncSettings::default();
    settings.storage.retry_backoff_ms = 1;
    settings.broadcast.timeout_ms = 200;
    settings.peers.removal_debounce_ms = 50;
    settings
}

fn coordinator(store: Arc<MemoryStore>) -> (Coordinator, Arc<ChannelTransport>) {
    let transport = Arc::new(ChannelTransport::new());
    let bus = Arc::new(LocalBroadcastBus::new(16));
    (Coordinator::new(settings(), store, transport.clone(), bus), transport)
}

fn respond(outcome: RouteOutcome) -> ResponseEnvelope {
    match outcome {
        RouteOutcome::Respond(envelope) => envelope,
        other => panic!("expected a response, got {:?}", other),
    }
}

fn create_message(id: &str, origin: u64) -> Value {
    json!({
        "operation": "create",
        "id": id,
        "url": format!("https://{}.test", id),
        "originPeerId": origin,
        "messageId": format!("msg-{}", id),
    })
}

fn auto_ack(mut inbox: mpsc::UnboundedReceiver<PeerDelivery>) {
    tokio::spawn(async move {
        while let Some(delivery) = inbox.recv().await {
            let _ = delivery.ack.send(());
        }
    });
}

#[tokio::test]
async fn test_create_then_get_state() {
    let store = Arc::new(MemoryStore::new());
    let (mut coordinator, _transport) = coordinator(store.clone());
    coordinator.start().await.unwrap();

    let envelope = respond(
        coordinator
            .handle_message(&create_message("qt-1", 1), &SenderContext::peer(PeerId(1)))
            .await,
    );
    assert!(envelope.success);
    assert_eq!(envelope.message_id.as_deref(), Some("msg-qt-1"));
    assert_eq!(envelope.data.unwrap()["sequenceId"], json!(1));

    let envelope = respond(
        coordinator
            .handle_message(
                &json!({"operation": "getState", "allContainers": true}),
                &SenderContext::peer(PeerId(2)),
            )
            .await,
    );
    let data = envelope.data.unwrap();
    assert_eq!(data["version"], json!(1));
    assert_eq!(data["tabs"][0]["id"], json!("qt-1"));
}

#[tokio::test]
async fn test_create_rounds_fractional_geometry() {
    let store = Arc::new(MemoryStore::new());
    let (mut coordinator, _transport) = coordinator(store.clone());
    coordinator.start().await.unwrap();

    let mut message = create_message("qt-1", 1);
    message["left"] = json!(10.6);
    message["top"] = json!(20.2);
    message["width"] = json!(399.5);
    let envelope = respond(coordinator.handle_message(&message, &SenderContext::peer(PeerId(1))).await);
    assert!(envelope.success);

    let record = &coordinator.state().state().tabs[0];
    assert_eq!((record.left, record.top, record.width), (11, 20, 400));
    assert_eq!(store.peek("quick_tabs_state_v2").unwrap()["tabs"][0]["left"], json!(11));
}

#[tokio::test]
async fn test_spoofed_origin_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let (mut coordinator, _transport) = coordinator(store.clone());
    coordinator.start().await.unwrap();

    let envelope = respond(
        coordinator
            .handle_message(&create_message("qt-1", 2), &SenderContext::peer(PeerId(1)))
            .await,
    );
    assert_eq!(envelope.code, Some(ErrorCode::OriginMismatch));
    assert!(coordinator.state().state().tabs.is_empty());
    assert!(store.peek("quick_tabs_state_v2").is_none());
}

#[tokio::test]
async fn test_non_numeric_origin_claim_is_a_mismatch() {
    let store = Arc::new(MemoryStore::new());
    let (mut coordinator, _transport) = coordinator(store);
    coordinator.start().await.unwrap();

    let envelope = respond(
        coordinator
            .handle_message(
                &json!({"operation": "destroy", "id": "qt-1", "originPeerId": "peer-2"}),
                &SenderContext::peer(PeerId(1)),
            )
            .await,
    );
    assert_eq!(envelope.code, Some(ErrorCode::OriginMismatch));
}

#[tokio::test]
async fn test_batch_entry_with_foreign_origin_rejects_whole_batch() {
    let store = Arc::new(MemoryStore::new());
    let (mut coordinator, _transport) = coordinator(store.clone());
    coordinator.start().await.unwrap();

    let envelope = respond(
        coordinator
            .handle_message(
                &json!({
                    "operation": "batchUpdate",
                    "originPeerId": 1,
                    "operations": [
                        {"operation": "create", "id": "qt-8", "url": "https://a.test"},
                        {"operation": "create", "id": "qt-9", "url": "https://b.test", "originPeerId": 2}
                    ]
                }),
                &SenderContext::peer(PeerId(1)),
            )
            .await,
    );
    assert_eq!(envelope.code, Some(ErrorCode::OriginMismatch));
    assert!(coordinator.state().state().tabs.is_empty());
    assert!(store.peek("quick_tabs_state_v2").is_none());
}

#[tokio::test]
async fn test_unknown_legacy_type_is_deferred() {
    let store = Arc::new(MemoryStore::new());
    let (mut coordinator, _transport) = coordinator(store);
    let outcome = coordinator
        .handle_message(&json!({"type": "CONTENT_READY"}), &SenderContext::peer(PeerId(1)))
        .await;
    assert!(matches!(outcome, RouteOutcome::Deferred { .. }));
}

#[tokio::test]
async fn test_identity_queries() {
    let store = Arc::new(MemoryStore::new());
    let (mut coordinator, _transport) = coordinator(store);
    let sender = SenderContext::peer(PeerId(4))
        .with_container("firefox-container-2")
        .with_url("https://four.test");

    let envelope = respond(
        coordinator
            .handle_message(&json!({"operation": "getCurrentPeerId"}), &sender)
            .await,
    );
    assert_eq!(envelope.data, Some(json!({"peerId": 4})));

    let envelope = respond(
        coordinator
            .handle_message(&json!({"operation": "getContainerContext"}), &sender)
            .await,
    );
    assert_eq!(
        envelope.data,
        Some(json!({"peerId": 4, "containerId": "firefox-container-2", "url": "https://four.test"}))
    );
}

#[tokio::test]
async fn test_container_scoped_get_state() {
    let store = Arc::new(MemoryStore::new());
    let (mut coordinator, _transport) = coordinator(store);
    coordinator.start().await.unwrap();

    let work = SenderContext::peer(PeerId(1)).with_container("work");
    let home = SenderContext::peer(PeerId(2)).with_container("home");
    coordinator.handle_message(&create_message("w", 1), &work).await;
    coordinator.handle_message(&create_message("h", 2), &home).await;

    let envelope = respond(
        coordinator
            .handle_message(&json!({"operation": "getState"}), &work)
            .await,
    );
    let tabs = envelope.data.unwrap()["tabs"].clone();
    assert_eq!(tabs.as_array().unwrap().len(), 1);
    assert_eq!(tabs[0]["id"], json!("w"));
}

#[tokio::test]
async fn test_two_coordinators_converge_through_store() {
    let store = Arc::new(MemoryStore::new());
    let (mut first, _t1) = coordinator(store.clone());
    let (mut second, _t2) = coordinator(store.clone());
    first.start().await.unwrap();
    second.start().await.unwrap();

    first
        .handle_message(&create_message("from-first", 1), &SenderContext::peer(PeerId(1)))
        .await;
    // The second context has not seen the first write yet; its write must rebase.
    second
        .handle_message(&create_message("from-second", 2), &SenderContext::peer(PeerId(2)))
        .await;

    let stored = store.peek("quick_tabs_state_v2").unwrap();
    assert_eq!(stored["version"], json!(2));
    assert_eq!(stored["tabs"].as_array().unwrap().len(), 2);

    first.drain_storage_changes().await;
    let ids: Vec<String> = first.state().state().tabs.iter().map(|t| t.id.clone()).collect();
    assert!(ids.contains(&"from-second".to_string()));
    assert_eq!(first.state().state().version, 2);
    assert!(first.state().suppressed_notifications() >= 1);
}

#[tokio::test]
async fn test_diagnostics_report_counters() {
    let store = Arc::new(MemoryStore::new());
    let (mut coordinator, _transport) = coordinator(store);
    coordinator.start().await.unwrap();
    coordinator
        .handle_message(&json!({"operation": "teleport"}), &SenderContext::peer(PeerId(1)))
        .await;

    let envelope = respond(
        coordinator
            .handle_message(&json!({"operation": "getDiagnostics"}), &SenderContext::peer(PeerId(1)))
            .await,
    );
    let data = envelope.data.unwrap();
    assert_eq!(data["router"]["unknownNames"]["teleport"], json!(1));
    assert_eq!(data["state"]["hydrated"], json!(true));
    assert_eq!(data["state"]["writeQueue"]["state"], json!("IDLE"));
}

#[tokio::test(start_paused = true)]
async fn test_closed_peer_reports_orphans() {
    let store = Arc::new(MemoryStore::new());
    let (mut coordinator, transport) = coordinator(store);
    auto_ack(transport.register_peer(PeerRecord::new(PeerId(1), "https://one.test")));
    coordinator.start().await.unwrap();
    let mut events = coordinator.subscribe();

    coordinator
        .handle_message(&create_message("qt-1", 1), &SenderContext::peer(PeerId(1)))
        .await;

    transport.unregister_peer(PeerId(1));
    assert!(coordinator.peer_removed(PeerId(1)));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let finalized = coordinator.drain_peer_removals();
    assert_eq!(finalized, vec![(PeerId(1), vec!["qt-1".to_string()])]);
    // Orphans are reported, never deleted.
    assert!(coordinator.state().state().find("qt-1").is_some());

    let mut saw_orphans = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::OrphansDetected { peer_id, quick_tab_ids } = event {
            assert_eq!(peer_id, PeerId(1));
            assert_eq!(quick_tab_ids, vec!["qt-1".to_string()]);
            saw_orphans = true;
        }
    }
    assert!(saw_orphans);
}

#[tokio::test]
async fn test_reconcile_picks_up_transport_peers() {
    let store = Arc::new(MemoryStore::new());
    let (mut coordinator, transport) = coordinator(store);
    auto_ack(transport.register_peer(PeerRecord::new(PeerId(5), "https://five.test")));

    let report = coordinator.reconcile_peers().await.unwrap();
    assert_eq!(report.added, vec![PeerId(5)]);
    assert!(coordinator.peers().contains(PeerId(5)));
}

#[tokio::test]
async fn test_spawned_coordinator_serves_requests() {
    let store = Arc::new(MemoryStore::new());
    let (coordinator, transport) = coordinator(store.clone());
    auto_ack(transport.register_peer(PeerRecord::new(PeerId(1), "https://one.test")));
    let handle = coordinator.spawn();

    let outcome = handle
        .send_message(create_message("qt-1", 1), SenderContext::peer(PeerId(1)))
        .await
        .unwrap();
    assert!(outcome.response().unwrap().success);

    // Another context writes directly; the spawned task picks it up from the store.
    store
        .set(
            "quick_tabs_state_v2",
            json!({"tabs": [{"id": "qt-1"}, {"id": "external"}], "timestamp": 1, "writeSourceId": "w-ext", "version": 9}),
        )
        .await
        .unwrap();

    let mut seen = false;
    for _ in 0..50 {
        let outcome = handle
            .send_message(json!({"operation": "getState", "allContainers": true}), SenderContext::peer(PeerId(1)))
            .await
            .unwrap();
        let data = outcome.response().unwrap().data.clone().unwrap();
        if data["version"] == json!(9) {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen, "external write never reached the spawned coordinator");

    assert!(handle.peers().contains(PeerId(1)));
    handle.shutdown().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let err = handle
        .send_message(json!({"operation": "getState"}), SenderContext::peer(PeerId(1)))
        .await
        .unwrap_err();
    assert_eq!(err, CoordinatorError::Stopped);
}

#[tokio::test]
async fn test_identity_queries_do_not_wait_for_hydration() {
    let store = Arc::new(MemoryStore::new());
    store.set_read_delay(Duration::from_millis(1_500));
    let (coordinator, _transport) = coordinator(store);
    let handle = coordinator.spawn();

    // Queued first, this create holds the coordinator task until the slow read returns.
    let pending = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .send_message(create_message("qt-1", 1), SenderContext::peer(PeerId(1)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let sender = SenderContext::peer(PeerId(3)).with_container("work");
    let outcome = tokio::time::timeout(
        Duration::from_millis(200),
        handle.send_message(json!({"operation": "getCurrentPeerId"}), sender.clone()),
    )
    .await
    .expect("getCurrentPeerId waited for hydration")
    .unwrap();
    assert_eq!(outcome.response().unwrap().data, Some(json!({"peerId": 3})));

    let outcome = tokio::time::timeout(
        Duration::from_millis(200),
        handle.send_message(json!({"operation": "getContainerContext"}), sender),
    )
    .await
    .expect("getContainerContext waited for hydration")
    .unwrap();
    assert_eq!(outcome.response().unwrap().data.as_ref().unwrap()["containerId"], json!("work"));

    let created = pending.await.unwrap().unwrap();
    assert!(created.response().unwrap().success);
    handle.shutdown().await;
}
