//! Coordinator core for Quick Tabs.
//!
//! Central struct wiring the store, write queue, broadcast manager, peer
//! tracker and router together. [`Coordinator`] can be driven directly (tests,
//! embedding) or moved into its own task with [`Coordinator::spawn`], which
//! multiplexes peer requests, storage notifications, finalized peer removals
//! and the periodic reconciliation sweep.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::database::{DurableStore, StorageChange};
use crate::managers::peer_tracker::{PeerTracker, ReconcileReport};
use crate::managers::quick_tab_manager::QuickTabStateHandler;
use crate::message_router::{MessageRouter, RouteOutcome};
use crate::operation_handlers::{build_identity_router, build_router, SyncContext};
use crate::services::broadcast_manager::BroadcastManager;
use crate::services::peer_transport::{LocalBus, PeerTransport};
use crate::services::write_queue::WriteQueue;
use crate::types::errors::{CoordinatorError, HandlerError, TransportError};
use crate::types::events::SyncEvent;
use crate::types::message::{InboundMessage, ProtocolVersion, SenderContext};
use crate::types::peer::{PeerId, PeerRecord, PeerUpdate};
use crate::types::settings::SyncSettings;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// The background coordinator: sole owner of the canonical state.
pub struct Coordinator {
    settings: SyncSettings,
    ctx: SyncContext,
    router: MessageRouter<SyncContext>,
    protocol: ProtocolVersion,
    transport: Arc<dyn PeerTransport>,
    events: broadcast::Sender<SyncEvent>,
    storage_changes: broadcast::Receiver<StorageChange>,
    removals: mpsc::UnboundedReceiver<PeerId>,
}

impl Coordinator {
    /// Wires up a coordinator. Must be called inside a tokio runtime.
    pub fn new(
        settings: SyncSettings,
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn PeerTransport>,
        bus: Arc<dyn LocalBus>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let storage_changes = store.subscribe();

        let queue = WriteQueue::spawn(
            store.clone(),
            &settings.storage.state_key,
            settings.storage.write_retry_limit,
            settings.retry_backoff(),
            settings.self_write_grace(),
        );
        let broadcaster = Arc::new(BroadcastManager::new(transport.clone(), bus));
        let state = QuickTabStateHandler::new(&settings, store, queue, broadcaster, events.clone());
        let (peers, removals) = PeerTracker::new(settings.removal_debounce(), events.clone());

        let protocol = ProtocolVersion::parse(&settings.protocol.version).unwrap_or_else(ProtocolVersion::current);
        let router = build_router(protocol);

        Self {
            settings,
            ctx: SyncContext { state, peers },
            router,
            protocol,
            transport,
            events,
            storage_changes,
            removals,
        }
    }

    /// Hydrates the mirror and takes an initial census of peers.
    pub async fn start(&mut self) -> Result<(), HandlerError> {
        self.ctx.state.ensure_hydrated().await?;
        if let Err(e) = self.reconcile_peers().await {
            warn!(error = %e, "Initial peer census failed");
        }
        info!(
            version = self.ctx.state.state().version,
            tabs = self.ctx.state.state().tabs.len(),
            peers = self.ctx.peers.len(),
            "Coordinator started"
        );
        Ok(())
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn state(&self) -> &QuickTabStateHandler {
        &self.ctx.state
    }

    pub fn peers(&self) -> &PeerTracker {
        &self.ctx.peers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Routes one peer message.
    pub async fn handle_message(&mut self, raw: &Value, sender: &SenderContext) -> RouteOutcome {
        self.router.route(&mut self.ctx, raw, sender).await
    }

    /// Applies a durable-store notification. Returns true if the mirror changed.
    pub async fn handle_storage_change(&mut self, change: &StorageChange) -> bool {
        self.ctx.state.apply_external_change(change).await
    }

    /// Processes every storage notification already queued. Returns how many changed the mirror.
    pub async fn drain_storage_changes(&mut self) -> usize {
        let mut applied = 0;
        loop {
            match self.storage_changes.try_recv() {
                Ok(change) => {
                    if self.handle_storage_change(&change).await {
                        applied += 1;
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.resync(skipped).await;
                    applied += 1;
                }
                Err(_) => break,
            }
        }
        applied
    }

    async fn resync(&mut self, skipped: u64) {
        warn!(skipped, "Storage notifications lagged, rehydrating");
        if let Err(e) = self.ctx.state.hydrate().await {
            warn!(error = %e, "Rehydration failed");
        }
    }

    pub fn peer_added(&self, peer: PeerRecord) {
        self.ctx.peers.peer_added(peer);
    }

    pub fn peer_updated(&self, peer_id: PeerId, update: &PeerUpdate) -> PeerRecord {
        self.ctx.peers.peer_updated(peer_id, update)
    }

    pub fn peer_removed(&self, peer_id: PeerId) -> bool {
        self.ctx.peers.peer_removed(peer_id)
    }

    /// Processes removals whose debounce already elapsed.
    pub fn drain_peer_removals(&mut self) -> Vec<(PeerId, Vec<String>)> {
        let mut finalized = Vec::new();
        while let Ok(peer_id) = self.removals.try_recv() {
            let orphans = self.handle_peer_removal(peer_id);
            finalized.push((peer_id, orphans));
        }
        finalized
    }

    /// Reports records left without their origin peer. Records are kept; the UI decides.
    pub fn handle_peer_removal(&mut self, peer_id: PeerId) -> Vec<String> {
        if self.ctx.peers.contains(peer_id) {
            return Vec::new();
        }
        let orphans = self.ctx.state.records_owned_by(peer_id);
        if !orphans.is_empty() {
            info!(peer = %peer_id, count = orphans.len(), "Orphaned Quick Tabs detected");
            let _ = self.events.send(SyncEvent::OrphansDetected {
                peer_id,
                quick_tab_ids: orphans.clone(),
            });
        }
        orphans
    }

    /// Re-queries the transport for live peers and corrects drift.
    pub async fn reconcile_peers(&mut self) -> Result<ReconcileReport, TransportError> {
        let live = self.transport.list_peers().await?;
        // Removed peers arrive on the removal channel like debounced ones.
        Ok(self.ctx.peers.reconcile(live))
    }

    /// Moves the coordinator into its own task.
    pub fn spawn(self) -> CoordinatorHandle {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = CoordinatorHandle {
            tx,
            events: self.events.clone(),
            peers: self.ctx.peers.clone(),
            identity: Arc::new(build_identity_router(self.protocol)),
        };
        tokio::spawn(self.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::Receiver<CoordinatorCommand>) {
        if let Err(e) = self.reconcile_peers().await {
            warn!(error = %e, "Initial peer census failed");
        }

        // Hydration runs beside the loop; requests that need state wait on their own guard.
        let (read_tx, mut initial_read) = oneshot::channel();
        let read = self.ctx.state.read_stored();
        tokio::spawn(async move {
            let _ = read_tx.send(read.await);
        });
        let mut awaiting_read = true;
        let mut missed_change = false;

        let period = self.settings.reconciliation_interval();
        let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut storage_open = true;

        loop {
            tokio::select! {
                read = &mut initial_read, if awaiting_read => {
                    awaiting_read = false;
                    self.finish_initial_hydration(read.ok(), missed_change).await;
                }
                command = rx.recv() => match command {
                    Some(CoordinatorCommand::Message { raw, sender, reply }) => {
                        let outcome = self.handle_message(&raw, &sender).await;
                        let _ = reply.send(outcome);
                    }
                    Some(CoordinatorCommand::Reconcile { reply }) => {
                        let _ = reply.send(self.reconcile_peers().await);
                    }
                    Some(CoordinatorCommand::Shutdown) | None => break,
                },
                change = self.storage_changes.recv(), if storage_open => match change {
                    Ok(change) => {
                        if !self.ctx.state.is_hydrated() {
                            missed_change = true;
                        }
                        self.handle_storage_change(&change).await;
                    }
                    Err(RecvError::Lagged(skipped)) => self.resync(skipped).await,
                    Err(RecvError::Closed) => storage_open = false,
                },
                Some(peer_id) = self.removals.recv() => {
                    self.handle_peer_removal(peer_id);
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.reconcile_peers().await {
                        warn!(error = %e, "Peer reconciliation failed");
                    }
                }
            }
        }
        debug!("Coordinator stopped");
    }

    async fn finish_initial_hydration(&mut self, read: Option<Result<Option<Value>, HandlerError>>, stale: bool) {
        if self.ctx.state.is_hydrated() {
            // A request already hydrated with a fresher read.
            return;
        }
        let result = match read {
            // A notification arrived before the mirror existed; the early read may predate it.
            Some(Ok(_)) if stale => self.ctx.state.ensure_hydrated().await,
            Some(Ok(raw)) => self.ctx.state.hydrate_from(raw).await.map(|_| ()),
            Some(Err(e)) => Err(e),
            None => return,
        };
        match result {
            Ok(()) => info!(
                version = self.ctx.state.state().version,
                tabs = self.ctx.state.state().tabs.len(),
                peers = self.ctx.peers.len(),
                "Coordinator started"
            ),
            // Requests will retry hydration on their own.
            Err(e) => warn!(error = %e, "Initial hydration failed"),
        }
    }
}

enum CoordinatorCommand {
    Message {
        raw: Value,
        sender: SenderContext,
        reply: oneshot::Sender<RouteOutcome>,
    },
    Reconcile {
        reply: oneshot::Sender<Result<ReconcileReport, TransportError>>,
    },
    Shutdown,
}

/// Cloneable handle to a spawned coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorCommand>,
    events: broadcast::Sender<SyncEvent>,
    peers: PeerTracker,
    identity: Arc<MessageRouter<PeerTracker>>,
}

impl CoordinatorHandle {
    /// Routes one peer message. Identity queries are answered here without
    /// queueing behind the coordinator task.
    pub async fn send_message(&self, raw: Value, sender: SenderContext) -> Result<RouteOutcome, CoordinatorError> {
        let identity = InboundMessage::parse(&raw)
            .map(|m| m.operation.is_identity())
            .unwrap_or(false);
        if identity {
            let mut peers = self.peers.clone();
            return Ok(self.identity.route(&mut peers, &raw, &sender).await);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::Message { raw, sender, reply })
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::Reconcile { reply })
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        Ok(rx.await.map_err(|_| CoordinatorError::Stopped)??)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(CoordinatorCommand::Shutdown).await;
    }

    /// Peer lifecycle calls go straight to the shared tracker.
    pub fn peers(&self) -> &PeerTracker {
        &self.peers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}
