//! Quick Tab state handler.
//!
//! [`QuickTabStateHandler`] owns the coordinator's in-memory mirror of the
//! canonical state. Every mutation is applied to the mirror first, then
//! persisted through the [`WriteQueue`] and finally fanned out by the
//! [`BroadcastManager`]. The handler is not shared: the coordinator task holds
//! it by value and calls it with `&mut self`.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::database::{DurableStore, StorageChange};
use crate::managers::dedup_tracker::DedupTracker;
use crate::services::broadcast_manager::{BroadcastManager, BroadcastOptions};
use crate::services::format_detector::StorageFormat;
use crate::services::format_migrator::migrate_payload;
use crate::services::write_queue::{WriteDelta, WritePayload, WriteQueue};
use crate::types::command::{CreateRequest, QuickTabCommand};
use crate::types::errors::HandlerError;
use crate::types::events::SyncEvent;
use crate::types::now_millis;
use crate::types::peer::PeerId;
use crate::types::quick_tab::{
    CanonicalState, QuickTabRecord, StateSnapshot, DEFAULT_CONTAINER_ID, DEFAULT_HEIGHT, DEFAULT_LEFT, DEFAULT_TOP,
    DEFAULT_WIDTH,
};
use crate::types::settings::SyncSettings;

const CREATE: &str = "create";

/// Result of applying one command to the mirror.
struct Applied {
    data: Value,
    persist: bool,
}

/// Counter state saved before a batch so a failing entry can undo the whole batch.
struct Checkpoint {
    state: CanonicalState,
    dirty: BTreeSet<String>,
    removed: BTreeSet<String>,
    next_sequence_id: u64,
    next_z_index: i64,
}

pub struct QuickTabStateHandler {
    store: Arc<dyn DurableStore>,
    queue: WriteQueue,
    broadcaster: Arc<BroadcastManager>,
    events: broadcast::Sender<SyncEvent>,
    state_key: String,
    hydration_timeout: Duration,
    broadcast_options: BroadcastOptions,
    state: CanonicalState,
    hydrated: bool,
    hydration_count: u64,
    suppressed_notifications: u64,
    last_format: Option<StorageFormat>,
    dedup: DedupTracker,
    next_sequence_id: u64,
    next_z_index: i64,
    peer_clocks: BTreeMap<PeerId, u64>,
    dirty: BTreeSet<String>,
    removed: BTreeSet<String>,
}

impl QuickTabStateHandler {
    pub fn new(
        settings: &SyncSettings,
        store: Arc<dyn DurableStore>,
        queue: WriteQueue,
        broadcaster: Arc<BroadcastManager>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            store,
            queue,
            broadcaster,
            events,
            state_key: settings.storage.state_key.clone(),
            hydration_timeout: settings.hydration_timeout(),
            broadcast_options: BroadcastOptions {
                exclude_peer_id: None,
                only_live_peers: settings.broadcast.only_live_peers,
                timeout: settings.broadcast_timeout(),
            },
            state: CanonicalState::empty(),
            hydrated: false,
            hydration_count: 0,
            suppressed_notifications: 0,
            last_format: None,
            dedup: DedupTracker::new(settings.dedup_window(), settings.dedup_ttl()),
            next_sequence_id: 1,
            next_z_index: 1,
            peer_clocks: BTreeMap::new(),
            dirty: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> &CanonicalState {
        &self.state
    }

    pub fn state_key(&self) -> &str {
        &self.state_key
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    /// How many times the mirror was replaced from durable storage.
    pub fn hydration_count(&self) -> u64 {
        self.hydration_count
    }

    pub fn suppressed_notifications(&self) -> u64 {
        self.suppressed_notifications
    }

    pub fn peer_clocks(&self) -> &BTreeMap<PeerId, u64> {
        &self.peer_clocks
    }

    pub fn queue(&self) -> &WriteQueue {
        &self.queue
    }

    // --- Hydration ---

    /// Hydrates once, bounded by the hydration guard.
    pub async fn ensure_hydrated(&mut self) -> Result<(), HandlerError> {
        if self.hydrated {
            return Ok(());
        }
        let guard = self.hydration_timeout;
        match tokio::time::timeout(guard, self.hydrate()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(timeout_ms = guard.as_millis() as u64, "Hydration timed out");
                Err(HandlerError::NotInitialized)
            }
        }
    }

    /// Loads the stored state, migrating and re-persisting legacy layouts.
    pub async fn hydrate(&mut self) -> Result<StorageFormat, HandlerError> {
        let raw = self.read_stored().await?;
        self.hydrate_from(raw).await
    }

    /// A detached read of the stored state, for callers that must not hold
    /// the handler while the store answers.
    pub fn read_stored(&self) -> impl Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static {
        let store = self.store.clone();
        let key = self.state_key.clone();
        async move {
            store
                .get(&key)
                .await
                .map_err(|e| HandlerError::GlobalStateNotReady(e.to_string()))
        }
    }

    /// Hydrates from a payload already read from the store.
    pub async fn hydrate_from(&mut self, raw: Option<Value>) -> Result<StorageFormat, HandlerError> {
        let (format, state) = migrate_payload(raw.as_ref());

        if format.needs_repersist() {
            info!(
                format = format.as_str(),
                version = state.version,
                tabs = state.tabs.len(),
                "Re-persisting migrated state"
            );
            if let Err(e) = self.queue.persist_baseline(state.clone()).await {
                warn!(error = %e, "Could not re-persist migrated state");
                self.queue.seed_version(state.version).await?;
            }
        } else {
            self.queue.seed_version(state.version).await?;
        }

        self.last_format = Some(format);
        self.adopt(state);
        info!(
            format = format.as_str(),
            version = self.state.version,
            tabs = self.state.tabs.len(),
            "State hydrated"
        );
        Ok(format)
    }

    /// Applies a durable-store notification. Returns true if the mirror changed.
    ///
    /// Notifications carrying one of this coordinator's own write tokens are
    /// ignored while the grace window is open.
    pub async fn apply_external_change(&mut self, change: &StorageChange) -> bool {
        if change.key != self.state_key {
            return false;
        }
        if let Some(source) = change
            .new_value
            .as_ref()
            .and_then(|v| v.get("writeSourceId"))
            .and_then(Value::as_str)
        {
            if self.queue.is_own_write(source) {
                self.suppressed_notifications += 1;
                debug!(write_source_id = source, "Ignoring own write notification");
                return false;
            }
        }
        if !self.hydrated {
            // First hydration reads the store directly.
            return false;
        }

        let (format, mut state) = migrate_payload(change.new_value.as_ref());
        if format == StorageFormat::Canonical && state.version < self.state.version {
            debug!(
                incoming = state.version,
                current = self.state.version,
                "Ignoring stale storage notification"
            );
            return false;
        }
        if state.version == self.state.version && state.tabs == self.state.tabs {
            return false;
        }

        // Keep unpersisted local edits on top of the incoming state.
        self.pending_delta().apply_to(&mut state.tabs);
        if let Err(e) = self.queue.seed_version(state.version).await {
            warn!(error = %e, "Could not seed write queue version");
        }
        self.last_format = Some(format);
        self.adopt(state);
        debug!(version = self.state.version, "Mirror refreshed from storage");
        true
    }

    fn adopt(&mut self, mut state: CanonicalState) {
        state.dedupe_ids();
        self.next_sequence_id = self.next_sequence_id.max(state.max_sequence_id() + 1);
        self.next_z_index = self.next_z_index.max(state.max_z_index() + 1);
        self.state = state;
        self.hydrated = true;
        self.hydration_count += 1;
        self.emit_state_changed();
    }

    // --- Mutations ---

    /// Applies `command` on behalf of `actor`, then persists and broadcasts.
    ///
    /// `container_hint` is the sender's container, used when a create names none.
    pub async fn execute(
        &mut self,
        command: QuickTabCommand,
        actor: PeerId,
        container_hint: Option<&str>,
    ) -> Result<Value, HandlerError> {
        self.ensure_hydrated().await?;

        let applied = match command {
            QuickTabCommand::Batch { operations, clock } => self.apply_batch(operations, clock, actor, container_hint)?,
            single => self.apply(single, actor, container_hint)?,
        };

        if applied.persist && (!self.dirty.is_empty() || !self.removed.is_empty()) {
            self.commit(actor).await?;
        }
        Ok(applied.data)
    }

    fn apply_batch(
        &mut self,
        operations: Vec<QuickTabCommand>,
        clock: BTreeMap<PeerId, u64>,
        actor: PeerId,
        container_hint: Option<&str>,
    ) -> Result<Applied, HandlerError> {
        let checkpoint = self.checkpoint();
        let count = operations.len();
        for (index, operation) in operations.into_iter().enumerate() {
            if let Err(e) = self.apply(operation, actor, container_hint) {
                debug!(index, error = %e, "Batch entry failed, rolling back");
                self.restore(checkpoint);
                return Err(e);
            }
        }
        for (peer, counter) in clock {
            let entry = self.peer_clocks.entry(peer).or_insert(0);
            *entry = (*entry).max(counter);
        }
        Ok(Applied {
            data: json!({
                "applied": count,
                "clock": self.peer_clocks,
            }),
            persist: true,
        })
    }

    fn apply(
        &mut self,
        command: QuickTabCommand,
        actor: PeerId,
        container_hint: Option<&str>,
    ) -> Result<Applied, HandlerError> {
        match command {
            QuickTabCommand::Create(request) => self.apply_create(request, actor, container_hint),
            QuickTabCommand::UpdatePosition {
                id,
                left,
                top,
                final_update,
            } => {
                self.modify(&id, |r| {
                    r.left = left;
                    r.top = top;
                })?;
                Ok(Applied {
                    data: json!({"id": id, "left": left, "top": top, "persisted": final_update}),
                    persist: final_update,
                })
            }
            QuickTabCommand::UpdateSize {
                id,
                width,
                height,
                final_update,
            } => {
                self.modify(&id, |r| {
                    r.width = width;
                    r.height = height;
                })?;
                Ok(Applied {
                    data: json!({"id": id, "width": width, "height": height, "persisted": final_update}),
                    persist: final_update,
                })
            }
            QuickTabCommand::UpdatePin { id, pinned_to_url } => {
                self.modify(&id, |r| r.pinned_to_url = pinned_to_url.clone())?;
                Ok(persisted(json!({"id": id, "pinnedToUrl": pinned_to_url})))
            }
            QuickTabCommand::ToggleSolo { id, peer_id } => {
                let target = peer_id.unwrap_or(actor);
                let mut soloed = false;
                let record = self.modify(&id, |r| soloed = r.toggle_solo(target))?;
                Ok(persisted(json!({
                    "id": id,
                    "soloed": soloed,
                    "soloedOnPeers": record.soloed_on_peers,
                    "mutedOnPeers": record.muted_on_peers,
                })))
            }
            QuickTabCommand::ToggleMute { id, peer_id } => {
                let target = peer_id.unwrap_or(actor);
                let mut muted = false;
                let record = self.modify(&id, |r| muted = r.toggle_mute(target))?;
                Ok(persisted(json!({
                    "id": id,
                    "muted": muted,
                    "soloedOnPeers": record.soloed_on_peers,
                    "mutedOnPeers": record.muted_on_peers,
                })))
            }
            QuickTabCommand::Minimize { id } => {
                self.modify(&id, |r| r.minimized = true)?;
                Ok(persisted(json!({"id": id, "minimized": true})))
            }
            QuickTabCommand::Restore { id } => {
                self.modify(&id, |r| r.minimized = false)?;
                Ok(persisted(json!({"id": id, "minimized": false})))
            }
            QuickTabCommand::BringToFront { id } => {
                let z = self.next_z_index;
                self.modify(&id, |r| r.z_index = z)?;
                self.next_z_index += 1;
                Ok(persisted(json!({"id": id, "zIndex": z})))
            }
            QuickTabCommand::Destroy { id } => {
                let destroyed = self.state.remove(&id).is_some();
                if destroyed {
                    self.dirty.remove(&id);
                    self.removed.insert(id.clone());
                    self.dedup.forget(CREATE, &id);
                } else {
                    debug!(quick_tab_id = %id, "Destroy of unknown Quick Tab");
                }
                Ok(Applied {
                    data: json!({"id": id, "destroyed": destroyed}),
                    persist: destroyed,
                })
            }
            QuickTabCommand::ClearAll { container_id } => {
                let ids: Vec<String> = self
                    .state
                    .tabs
                    .iter()
                    .filter(|t| container_id.as_deref().map(|c| t.container_id == c).unwrap_or(true))
                    .map(|t| t.id.clone())
                    .collect();
                for id in &ids {
                    self.state.remove(id);
                    self.dirty.remove(id);
                    self.removed.insert(id.clone());
                    self.dedup.forget(CREATE, id);
                }
                Ok(Applied {
                    data: json!({"removed": ids.len()}),
                    persist: !ids.is_empty(),
                })
            }
            QuickTabCommand::Batch { .. } => Err(HandlerError::InvalidPayload(
                "batchUpdate cannot be nested".to_string(),
            )),
        }
    }

    fn apply_create(
        &mut self,
        request: CreateRequest,
        actor: PeerId,
        container_hint: Option<&str>,
    ) -> Result<Applied, HandlerError> {
        if self.dedup.is_duplicate(CREATE, &request.id) {
            if let Some(existing) = self.state.find(&request.id) {
                debug!(quick_tab_id = %request.id, "Duplicate create suppressed");
                return Ok(Applied {
                    data: json!({
                        "id": existing.id,
                        "sequenceId": existing.sequence_id,
                        "deduplicated": true,
                    }),
                    persist: false,
                });
            }
        }

        let width = positive_dimension(request.width, DEFAULT_WIDTH, "width")?;
        let height = positive_dimension(request.height, DEFAULT_HEIGHT, "height")?;

        let existing = self.state.find(&request.id).cloned();
        let sequence_id = self.next_sequence_id;
        let z_index = self.next_z_index;
        let container_id = request
            .container_id
            .clone()
            .filter(|c| !c.is_empty())
            .or_else(|| container_hint.map(str::to_string))
            .unwrap_or_else(|| DEFAULT_CONTAINER_ID.to_string());

        let mut record = QuickTabRecord::new(&request.id, &request.url, Some(actor));
        record.title = request.title.clone().unwrap_or_else(|| request.url.clone());
        record.left = request.left.unwrap_or(DEFAULT_LEFT);
        record.top = request.top.unwrap_or(DEFAULT_TOP);
        record.width = width;
        record.height = height;
        record.minimized = request.minimized.unwrap_or(false);
        record.z_index = z_index;
        record.sequence_id = sequence_id;
        record.container_id = container_id;
        record.pinned_to_url = request.pinned_to_url.clone();
        record.created_at = existing.as_ref().map(|e| e.created_at).unwrap_or_else(now_millis);
        if let Some(previous) = existing {
            record.soloed_on_peers = previous.soloed_on_peers;
            record.muted_on_peers = previous.muted_on_peers;
        }

        self.next_sequence_id += 1;
        self.next_z_index += 1;
        self.removed.remove(&record.id);
        self.dirty.insert(record.id.clone());
        let replaced = !self.state.upsert(record);
        self.dedup.record(CREATE, &request.id);

        debug!(quick_tab_id = %request.id, sequence_id, replaced, "Quick Tab created");
        Ok(persisted(json!({
            "id": request.id,
            "sequenceId": sequence_id,
            "zIndex": z_index,
        })))
    }

    fn modify(&mut self, id: &str, f: impl FnOnce(&mut QuickTabRecord)) -> Result<QuickTabRecord, HandlerError> {
        let record = self
            .state
            .find_mut(id)
            .ok_or_else(|| HandlerError::NotFound(id.to_string()))?;
        f(record);
        let snapshot = record.clone();
        self.dirty.insert(id.to_string());
        Ok(snapshot)
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            state: self.state.clone(),
            dirty: self.dirty.clone(),
            removed: self.removed.clone(),
            next_sequence_id: self.next_sequence_id,
            next_z_index: self.next_z_index,
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.state = checkpoint.state;
        self.dirty = checkpoint.dirty;
        self.removed = checkpoint.removed;
        self.next_sequence_id = checkpoint.next_sequence_id;
        self.next_z_index = checkpoint.next_z_index;
    }

    /// Unpersisted changes, without clearing them.
    fn pending_delta(&self) -> WriteDelta {
        WriteDelta {
            upserts: self
                .dirty
                .iter()
                .filter_map(|id| self.state.find(id).cloned())
                .collect(),
            removals: self.removed.iter().cloned().collect(),
        }
    }

    async fn commit(&mut self, actor: PeerId) -> Result<(), HandlerError> {
        let delta = self.pending_delta();
        let dirty = std::mem::take(&mut self.dirty);
        let removed = std::mem::take(&mut self.removed);

        self.state.last_update = now_millis().max(self.state.last_update + 1);
        let payload = WritePayload {
            tabs: self.state.tabs.clone(),
            delta,
            last_update: self.state.last_update,
        };

        let outcome = match self.queue.enqueue_write(payload).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Mutation not persisted");
                self.dirty.extend(dirty);
                self.removed.extend(removed);
                return Err(HandlerError::Write(e));
            }
        };

        if outcome.rebased {
            info!(version = outcome.version, "Mirror rebased onto concurrent write");
            self.state.tabs = outcome.tabs;
            self.next_sequence_id = self.next_sequence_id.max(self.state.max_sequence_id() + 1);
            self.next_z_index = self.next_z_index.max(self.state.max_z_index() + 1);
        }
        self.state.version = outcome.version;
        self.emit_state_changed();
        self.spawn_broadcast(actor);
        Ok(())
    }

    fn spawn_broadcast(&self, actor: PeerId) {
        let snapshot = StateSnapshot::from_state(&self.state);
        let broadcaster = self.broadcaster.clone();
        let options = BroadcastOptions {
            exclude_peer_id: Some(actor),
            ..self.broadcast_options.clone()
        };
        tokio::spawn(async move {
            broadcaster.broadcast(&snapshot, &options).await;
        });
    }

    fn emit_state_changed(&self) {
        let _ = self.events.send(SyncEvent::StateChanged {
            version: self.state.version,
            last_update: self.state.last_update,
        });
    }

    // --- Reads ---

    /// Full state, or only the records of `container_id` when given.
    pub fn get_state(&self, container_id: Option<&str>) -> Value {
        let tabs: Vec<&QuickTabRecord> = match container_id {
            Some(c) => self.state.for_container(c).collect(),
            None => self.state.tabs.iter().collect(),
        };
        json!({
            "tabs": tabs,
            "lastUpdate": self.state.last_update,
            "version": self.state.version,
        })
    }

    pub fn get_quick_tab(&self, id: &str) -> Result<Value, HandlerError> {
        let record = self
            .state
            .find(id)
            .ok_or_else(|| HandlerError::NotFound(id.to_string()))?;
        serde_json::to_value(record).map_err(|e| HandlerError::Internal(e.to_string()))
    }

    pub fn records_owned_by(&self, peer_id: PeerId) -> Vec<String> {
        self.state
            .tabs
            .iter()
            .filter(|t| t.origin_peer_id == Some(peer_id))
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn diagnostics(&self) -> Value {
        json!({
            "hydrated": self.hydrated,
            "hydrationCount": self.hydration_count,
            "storedFormat": self.last_format.map(|f| f.as_str()),
            "version": self.state.version,
            "lastUpdate": self.state.last_update,
            "tabCount": self.state.tabs.len(),
            "nextSequenceId": self.next_sequence_id,
            "pendingChanges": self.dirty.len() + self.removed.len(),
            "suppressedNotifications": self.suppressed_notifications,
            "dedupEntries": self.dedup.len(),
            "peerClocks": self.peer_clocks,
            "writeQueue": {
                "state": self.queue.state(),
                "stats": self.queue.stats(),
            },
            "broadcast": self.broadcaster.metrics(),
        })
    }
}

fn persisted(data: Value) -> Applied {
    Applied { data, persist: true }
}

fn positive_dimension(value: Option<i64>, default: u32, field: &str) -> Result<u32, HandlerError> {
    match value {
        None => Ok(default),
        Some(n) if n > 0 && n <= u32::MAX as i64 => Ok(n as u32),
        Some(_) => Err(HandlerError::InvalidPayload(format!(
            "{} must be greater than zero",
            field
        ))),
    }
}
