//! Unit tests for the write-serialization queue: versioning, retries,
//! conflict rebasing and self-write recognition.

use std::sync::Arc;
use std::time::Duration;

use quicktabs::database::{DurableStore, MemoryStore};
use quicktabs::services::write_queue::{QueueState, WriteDelta, WritePayload, WriteQueue};
use quicktabs::types::errors::WriteQueueError;
use quicktabs::types::quick_tab::{CanonicalState, QuickTabRecord};
use serde_json::json;

const KEY: &str = "quick_tabs_state_v2";

fn queue(store: &Arc<MemoryStore>, retry_limit: u32) -> WriteQueue {
    WriteQueue::spawn(
        store.clone(),
        KEY,
        retry_limit,
        Duration::from_millis(1),
        Duration::from_secs(5),
    )
}

fn payload_with(record: QuickTabRecord) -> WritePayload {
    WritePayload {
        tabs: vec![record.clone()],
        delta: WriteDelta {
            upserts: vec![record],
            removals: Vec::new(),
        },
        last_update: 100,
    }
}

#[tokio::test]
async fn test_first_write_gets_version_one() {
    let store = Arc::new(MemoryStore::new());
    let queue = queue(&store, 3);

    let outcome = queue
        .enqueue_write(payload_with(QuickTabRecord::new("a", "https://a.test", None)))
        .await
        .unwrap();

    assert_eq!(outcome.version, 1);
    assert_eq!(outcome.attempts, 1);
    assert!(!outcome.rebased);
    let stored = store.peek(KEY).unwrap();
    assert_eq!(stored["version"], json!(1));
    assert_eq!(stored["writeSourceId"], json!(outcome.write_source_id));
    assert_eq!(stored["timestamp"], json!(100));
}

#[tokio::test]
async fn test_versions_increase_per_write() {
    let store = Arc::new(MemoryStore::new());
    let queue = queue(&store, 3);
    let mut last = 0;
    for i in 0..5 {
        let outcome = queue
            .enqueue_write(payload_with(QuickTabRecord::new(&format!("t{}", i), "https://x.test", None)))
            .await
            .unwrap();
        assert!(outcome.version > last);
        last = outcome.version;
    }
    assert_eq!(last, 5);
    assert_eq!(queue.stats().completed, 5);
    assert_eq!(queue.state(), QueueState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_get_consecutive_versions() {
    const WRITERS: u64 = 20;
    let store = Arc::new(MemoryStore::new());
    let queue = queue(&store, 3);

    let tasks: Vec<_> = (0..WRITERS)
        .map(|i| {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue_write(payload_with(QuickTabRecord::new(&format!("c{}", i), "https://c.test", None)))
                    .await
            })
        })
        .collect();

    let mut versions = Vec::new();
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(!outcome.rebased);
        versions.push(outcome.version);
    }
    versions.sort_unstable();

    assert_eq!(versions, (1..=WRITERS).collect::<Vec<_>>());
    assert_eq!(store.peek(KEY).unwrap()["version"], json!(WRITERS));
    assert_eq!(queue.stats().completed, WRITERS);
    assert_eq!(queue.stats().conflicts, 0);
}

#[tokio::test]
async fn test_source_ids_are_unique_and_recognized() {
    let store = Arc::new(MemoryStore::new());
    let queue = queue(&store, 3);
    let first = queue
        .enqueue_write(payload_with(QuickTabRecord::new("a", "https://a.test", None)))
        .await
        .unwrap();
    let second = queue
        .enqueue_write(payload_with(QuickTabRecord::new("b", "https://b.test", None)))
        .await
        .unwrap();

    assert_ne!(first.write_source_id, second.write_source_id);
    assert!(first.write_source_id.starts_with("w-"));
    assert!(queue.is_own_write(&first.write_source_id));
    assert!(queue.is_own_write(&second.write_source_id));
    assert!(!queue.is_own_write("w-someone-else"));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let store = Arc::new(MemoryStore::new());
    let queue = queue(&store, 3);
    store.fail_next_writes(2);

    let outcome = queue
        .enqueue_write(payload_with(QuickTabRecord::new("a", "https://a.test", None)))
        .await
        .unwrap();

    assert_eq!(outcome.attempts, 3);
    assert_eq!(queue.stats().retries, 2);
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_write() {
    let store = Arc::new(MemoryStore::new());
    let queue = queue(&store, 2);
    store.fail_next_writes(10);

    let err = queue
        .enqueue_write(payload_with(QuickTabRecord::new("a", "https://a.test", None)))
        .await
        .unwrap_err();

    assert!(matches!(err, WriteQueueError::RetriesExhausted { attempts: 2, .. }));
    assert!(store.peek(KEY).is_none());
    assert_eq!(queue.stats().failed, 1);
}

#[tokio::test]
async fn test_queue_keeps_working_after_failure() {
    let store = Arc::new(MemoryStore::new());
    let queue = queue(&store, 1);
    store.fail_next_writes(1);
    assert!(queue
        .enqueue_write(payload_with(QuickTabRecord::new("a", "https://a.test", None)))
        .await
        .is_err());

    let outcome = queue
        .enqueue_write(payload_with(QuickTabRecord::new("b", "https://b.test", None)))
        .await
        .unwrap();
    assert_eq!(outcome.version, 1);
}

#[tokio::test]
async fn test_conflict_rebases_onto_stored_tabs() {
    let store = Arc::new(MemoryStore::new());
    let queue = queue(&store, 3);
    queue.seed_version(3).await.unwrap();

    // Another writer lands version 5 with its own record.
    store
        .set(
            KEY,
            json!({
                "tabs": [{"id": "theirs", "url": "https://theirs.test"}],
                "timestamp": 50,
                "writeSourceId": "w-other",
                "version": 5
            }),
        )
        .await
        .unwrap();

    let mine = QuickTabRecord::new("mine", "https://mine.test", None);
    let outcome = queue
        .enqueue_write(WritePayload {
            tabs: vec![mine.clone()],
            delta: WriteDelta {
                upserts: vec![mine],
                removals: Vec::new(),
            },
            last_update: 60,
        })
        .await
        .unwrap();

    assert!(outcome.rebased);
    assert_eq!(outcome.version, 6);
    let ids: Vec<&str> = outcome.tabs.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["theirs", "mine"]);
    assert_eq!(queue.stats().conflicts, 1);
}

#[tokio::test]
async fn test_rebase_replays_removals() {
    let store = Arc::new(MemoryStore::new());
    let queue = queue(&store, 3);
    queue.seed_version(1).await.unwrap();
    store
        .set(
            KEY,
            json!({"tabs": [{"id": "a"}, {"id": "b"}], "timestamp": 1, "writeSourceId": "w-x", "version": 2}),
        )
        .await
        .unwrap();

    let outcome = queue
        .enqueue_write(WritePayload {
            tabs: Vec::new(),
            delta: WriteDelta {
                upserts: Vec::new(),
                removals: vec!["a".to_string()],
            },
            last_update: 2,
        })
        .await
        .unwrap();

    assert!(outcome.rebased);
    let ids: Vec<&str> = outcome.tabs.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["b"]);
}

#[tokio::test]
async fn test_baseline_keeps_exact_version() {
    let store = Arc::new(MemoryStore::new());
    let queue = queue(&store, 3);
    let state = CanonicalState {
        tabs: vec![QuickTabRecord::new("legacy", "https://old.test", None)],
        last_update: 900,
        version: 1,
    };

    let outcome = queue.persist_baseline(state).await.unwrap();
    assert_eq!(outcome.version, 1);
    assert_eq!(store.peek(KEY).unwrap()["version"], json!(1));

    let next = queue
        .enqueue_write(payload_with(QuickTabRecord::new("new", "https://new.test", None)))
        .await
        .unwrap();
    assert_eq!(next.version, 2);
    assert!(!next.rebased);
}

#[tokio::test]
async fn test_rebase_skips_only_the_malformed_stored_record() {
    let store = Arc::new(MemoryStore::new());
    let queue = queue(&store, 3);
    queue.seed_version(1).await.unwrap();
    store
        .set(
            KEY,
            json!({
                "tabs": [
                    {"id": "first", "url": "https://first.test"},
                    {"id": "broken", "left": "far away"},
                    {"title": "no id"},
                    {"id": "second", "url": "https://second.test"}
                ],
                "timestamp": 10,
                "writeSourceId": "w-other",
                "version": 4
            }),
        )
        .await
        .unwrap();

    let outcome = queue
        .enqueue_write(payload_with(QuickTabRecord::new("mine", "https://mine.test", None)))
        .await
        .unwrap();

    assert!(outcome.rebased);
    assert_eq!(outcome.version, 5);
    let ids: Vec<&str> = outcome.tabs.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["first", "second", "mine"]);
}
