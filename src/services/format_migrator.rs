// Quick Tabs Storage Format Migrators
// Upgrades every known on-disk layout into a CanonicalState. Migrators are pure
// and total: unreadable records are skipped, never fatal.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::services::format_detector::{detect, StorageFormat};
use crate::types::message::parse_peer_id;
use crate::types::quick_tab::{CanonicalState, QuickTabRecord};

/// Version assigned to state recovered from a layout that never carried one.
pub const LEGACY_BASE_VERSION: u64 = 1;

/// Trait implemented by each storage layout upgrader.
pub trait FormatMigrator: Send + Sync {
    fn name(&self) -> &'static str;
    /// Folds `raw` into `base` and returns the resulting canonical state.
    fn migrate(&self, raw: &Value, base: CanonicalState) -> CanonicalState;
}

/// Already canonical: parse it as-is.
pub struct CanonicalPassthrough;

/// `{tabs, timestamp}` without a version.
pub struct UnversionedMigrator;

/// `{containers: {id: {tabs, lastUpdate}}}`.
pub struct ContainerMigrator;

/// Bare `[record, ...]`.
pub struct FlatListMigrator;

impl FormatMigrator for CanonicalPassthrough {
    fn name(&self) -> &'static str {
        "canonical-passthrough"
    }

    fn migrate(&self, raw: &Value, base: CanonicalState) -> CanonicalState {
        let tabs = parse_records(raw.get("tabs"), None);
        let last_update = read_timestamp(raw);
        let version = raw.get("version").and_then(Value::as_u64).unwrap_or(0);
        merge(base, tabs, last_update, version)
    }
}

impl FormatMigrator for UnversionedMigrator {
    fn name(&self) -> &'static str {
        "unversioned-to-canonical"
    }

    fn migrate(&self, raw: &Value, base: CanonicalState) -> CanonicalState {
        let tabs = parse_records(raw.get("tabs"), None);
        merge(base, tabs, read_timestamp(raw), LEGACY_BASE_VERSION)
    }
}

impl FormatMigrator for ContainerMigrator {
    fn name(&self) -> &'static str {
        "container-wrapped-to-canonical"
    }

    fn migrate(&self, raw: &Value, base: CanonicalState) -> CanonicalState {
        let mut state = base;
        let containers = match raw.get("containers").and_then(Value::as_object) {
            Some(c) => c,
            None => return state,
        };
        for (container_id, entry) in containers {
            // Some writers stored the container's tab list directly.
            let (tabs_value, last_update) = match entry {
                Value::Array(_) => (Some(entry), 0),
                Value::Object(_) => (entry.get("tabs"), read_timestamp(entry)),
                _ => continue,
            };
            let tabs = parse_records(tabs_value, Some(container_id));
            state = merge(state, tabs, last_update, LEGACY_BASE_VERSION);
        }
        state
    }
}

impl FormatMigrator for FlatListMigrator {
    fn name(&self) -> &'static str {
        "flat-list-to-canonical"
    }

    fn migrate(&self, raw: &Value, base: CanonicalState) -> CanonicalState {
        let tabs = parse_records(Some(raw), None);
        let last_update = tabs.iter().map(|t| t.created_at).max().unwrap_or(0);
        merge(base, tabs, last_update, LEGACY_BASE_VERSION)
    }
}

/// Returns the migrator for `format`, or `None` for [`StorageFormat::Empty`].
pub fn migrator_for(format: StorageFormat) -> Option<&'static dyn FormatMigrator> {
    match format {
        StorageFormat::Canonical => Some(&CanonicalPassthrough),
        StorageFormat::LegacyUnversioned => Some(&UnversionedMigrator),
        StorageFormat::ContainerWrapped => Some(&ContainerMigrator),
        StorageFormat::FlatList => Some(&FlatListMigrator),
        StorageFormat::Empty => None,
    }
}

/// Detects the layout of `raw` and migrates it into a fresh canonical state.
pub fn migrate_payload(raw: Option<&Value>) -> (StorageFormat, CanonicalState) {
    let format = detect(raw);
    let state = match (migrator_for(format), raw) {
        (Some(migrator), Some(value)) => {
            let state = migrator.migrate(value, CanonicalState::empty());
            debug!(
                migrator = migrator.name(),
                tabs = state.tabs.len(),
                version = state.version,
                "Migrated stored state"
            );
            state
        }
        _ => CanonicalState::empty(),
    };
    (format, state)
}

fn merge(mut base: CanonicalState, tabs: Vec<QuickTabRecord>, last_update: i64, version: u64) -> CanonicalState {
    base.tabs.extend(tabs);
    base.dedupe_ids();
    base.last_update = base.last_update.max(last_update);
    base.version = base.version.max(version);
    base
}

fn read_timestamp(raw: &Value) -> i64 {
    raw.get("lastUpdate")
        .or_else(|| raw.get("timestamp"))
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .unwrap_or(0)
}

pub(crate) fn parse_records(raw: Option<&Value>, container_id: Option<&String>) -> Vec<QuickTabRecord> {
    let entries = match raw.and_then(Value::as_array) {
        Some(entries) => entries,
        None => return Vec::new(),
    };
    entries
        .iter()
        .filter_map(|entry| {
            let record = parse_record(entry)?;
            Some(match container_id {
                Some(cid) => QuickTabRecord {
                    container_id: cid.clone(),
                    ..record
                },
                None => record,
            })
        })
        .collect()
}

fn parse_record(entry: &Value) -> Option<QuickTabRecord> {
    let mut map = entry.as_object()?.clone();
    match map.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        _ => {
            warn!("Skipping stored record without an id");
            return None;
        }
    }
    coerce_legacy_fields(&mut map);
    match serde_json::from_value::<QuickTabRecord>(Value::Object(map)) {
        Ok(mut record) => {
            record.normalize();
            Some(record)
        }
        Err(e) => {
            warn!(error = %e, "Skipping unreadable stored record");
            None
        }
    }
}

/// Older writers stored peer ids as strings and geometry as floats.
fn coerce_legacy_fields(map: &mut Map<String, Value>) {
    for key in ["originPeerId", "originTabId"] {
        if let Some(value) = map.get(key) {
            let coerced = parse_peer_id(value).map(|p| Value::from(p.0)).unwrap_or(Value::Null);
            map.insert(key.to_string(), coerced);
        }
    }
    for key in ["left", "top", "width", "height", "zIndex"] {
        if let Some(f) = map.get(key).and_then(|v| if v.is_f64() { v.as_f64() } else { None }) {
            map.insert(key.to_string(), Value::from(f.round() as i64));
        }
    }
    for key in ["width", "height"] {
        if map.get(key).and_then(Value::as_i64).map(|n| n <= 0).unwrap_or(false) {
            map.remove(key);
        }
    }
    for key in ["soloedOnPeers", "mutedOnPeers", "soloedOnTabs", "mutedOnTabs"] {
        if let Some(Value::Array(items)) = map.get(key) {
            let ids: Vec<Value> = items
                .iter()
                .filter_map(parse_peer_id)
                .map(|p| Value::from(p.0))
                .collect();
            map.insert(key.to_string(), Value::Array(ids));
        }
    }
}
