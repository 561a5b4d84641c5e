//! Quick Tabs RPC server: the coordinator over stdin/stdout.
//!
//! Protocol: one JSON object per line (newline-delimited JSON).
//! Request:   {"id":1, "sender":{"peerId":7}, "message":{"operation":"create", ...}}
//! Response:  {"id":1, "response":{"success":true, ...}} or {"id":1, "deferred":true}
//! Peer events: {"event":"peerAdded","peer":{...}} | {"event":"peerUpdated","peerId":7,"update":{...}}
//!              | {"event":"peerRemoved","peerId":7}
//! Outbound deliveries: {"deliver":{"peerId":7,"message":{...}}} and {"local":{...}}
//! Logs go to stderr; stdout carries only protocol lines.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use quicktabs::app::{Coordinator, CoordinatorHandle};
use quicktabs::database::SqliteStore;
use quicktabs::message_router::RouteOutcome;
use quicktabs::platform;
use quicktabs::services::peer_transport::{LocalBroadcastBus, LocalBus, PeerTransport};
use quicktabs::services::settings_engine::{SettingsEngine, SettingsEngineTrait};
use quicktabs::types::errors::TransportError;
use quicktabs::types::message::{parse_peer_id, SenderContext};
use quicktabs::types::peer::{PeerId, PeerRecord, PeerUpdate};

/// Simple rate limiter: max requests per second.
struct RateLimiter {
    window_start: Instant,
    request_count: u32,
    max_per_second: u32,
}

impl RateLimiter {
    fn new(max_per_second: u32) -> Self {
        Self { window_start: Instant::now(), request_count: 0, max_per_second }
    }

    /// Returns true if the request is allowed, false if rate-limited.
    fn check(&mut self) -> bool {
        if self.window_start.elapsed().as_secs() >= 1 {
            self.window_start = Instant::now();
            self.request_count = 0;
        }
        self.request_count += 1;
        self.request_count <= self.max_per_second
    }
}

/// Peers live on the other end of stdout; delivery is fire-and-forget.
struct StdioTransport {
    out: mpsc::UnboundedSender<Value>,
    peers: Mutex<BTreeMap<PeerId, PeerRecord>>,
}

impl StdioTransport {
    fn upsert(&self, peer: PeerRecord) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(peer.peer_id, peer);
        }
    }

    fn remove(&self, peer_id: PeerId) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&peer_id);
        }
    }
}

#[async_trait]
impl PeerTransport for StdioTransport {
    async fn send_to_peer(&self, peer_id: PeerId, message: Value) -> Result<(), TransportError> {
        self.out
            .send(json!({"deliver": {"peerId": peer_id, "message": message}}))
            .map_err(|_| TransportError::NotListening(peer_id))
    }

    async fn list_peers(&self) -> Result<Vec<PeerRecord>, TransportError> {
        let peers = self
            .peers
            .lock()
            .map_err(|_| TransportError::Enumeration("peer table poisoned".to_string()))?;
        Ok(peers.values().cloned().collect())
    }
}

fn database_path(file_name: &str) -> PathBuf {
    let dir = match std::env::var("QUICKTABS_DATA_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => platform::get_data_dir(),
    };
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(dir = %dir.display(), error = %e, "Could not create data directory");
    }
    dir.join(file_name)
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("QUICKTABS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn handle_line(
    line: &str,
    handle: &CoordinatorHandle,
    transport: &StdioTransport,
    out: &mpsc::UnboundedSender<Value>,
    rate_limiter: &mut RateLimiter,
) {
    let req: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            let _ = out.send(json!({"id": null, "error": format!("parse error: {}", e)}));
            return;
        }
    };

    if let Some(event) = req.get("event").and_then(Value::as_str) {
        handle_peer_event(event, &req, handle, transport);
        return;
    }

    let id = req.get("id").cloned().unwrap_or(Value::Null);

    // Rate limiting: max 200 requests per second
    if !rate_limiter.check() {
        let _ = out.send(json!({"id": id, "error": "rate limit exceeded"}));
        return;
    }

    let sender: SenderContext = req
        .get("sender")
        .cloned()
        .and_then(|s| serde_json::from_value(s).ok())
        .unwrap_or_default();
    let message = req.get("message").cloned().unwrap_or(Value::Null);

    let response = match handle.send_message(message, sender).await {
        Ok(RouteOutcome::Respond(envelope)) => json!({"id": id, "response": envelope}),
        Ok(RouteOutcome::Deferred { type_name }) => json!({"id": id, "deferred": true, "type": type_name}),
        Err(e) => json!({"id": id, "error": e.to_string()}),
    };
    let _ = out.send(response);
}

fn handle_peer_event(event: &str, req: &Value, handle: &CoordinatorHandle, transport: &StdioTransport) {
    let peer_id = req.get("peerId").and_then(parse_peer_id);
    match event {
        "peerAdded" => match req.get("peer").cloned().map(serde_json::from_value::<PeerRecord>) {
            Some(Ok(peer)) => {
                transport.upsert(peer.clone());
                handle.peers().peer_added(peer);
            }
            _ => warn!("peerAdded without a valid peer record"),
        },
        "peerUpdated" => {
            let update: PeerUpdate = req
                .get("update")
                .cloned()
                .and_then(|u| serde_json::from_value(u).ok())
                .unwrap_or_default();
            match peer_id {
                Some(peer_id) => transport.upsert(handle.peers().peer_updated(peer_id, &update)),
                None => warn!("peerUpdated without peerId"),
            }
        }
        "peerRemoved" => match peer_id {
            Some(peer_id) => {
                transport.remove(peer_id);
                handle.peers().peer_removed(peer_id);
            }
            None => warn!("peerRemoved without peerId"),
        },
        other => warn!(event = other, "Unknown peer event"),
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    let mut settings_engine = SettingsEngine::new(None);
    let settings = match settings_engine.load() {
        Ok(settings) => settings,
        Err(e) => {
            warn!(error = %e, "Falling back to default settings");
            Default::default()
        }
    };

    let db_path = database_path(&settings.storage.database_file);
    let store = match SqliteStore::open(&db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(path = %db_path.display(), error = %e, "Failed to open store");
            std::process::exit(1);
        }
    };

    let (out, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            let mut text = line.to_string();
            text.push('\n');
            if stdout.write_all(text.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let transport = Arc::new(StdioTransport {
        out: out.clone(),
        peers: Mutex::new(BTreeMap::new()),
    });
    let bus = Arc::new(LocalBroadcastBus::new(settings.broadcast.local_bus_capacity));
    let mut local = bus.subscribe();
    let local_out = out.clone();
    tokio::spawn(async move {
        while let Ok(message) = local.recv().await {
            if local_out.send(json!({"local": message})).is_err() {
                break;
            }
        }
    });

    let handle = Coordinator::new(settings, store, transport.clone(), bus).spawn();
    info!(db = %db_path.display(), "Quick Tabs coordinator ready");
    let _ = out.send(json!({"event": "ready", "version": env!("CARGO_PKG_VERSION")}));

    let mut rate_limiter = RateLimiter::new(200);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                handle_line(&line, &handle, &transport, &out, &mut rate_limiter).await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        }
    }

    handle.shutdown().await;
    drop(handle);
    drop(transport);
    drop(out);
    // Give queued deliveries a moment to flush.
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
}
