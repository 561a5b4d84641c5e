// Quick Tabs Storage Format Detector
// Classifies a raw durable-store payload by shape so the matching migrator can run.

use serde_json::Value;

/// Closed set of on-disk layouts this crate knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    /// `{tabs, version, timestamp|lastUpdate, ...}` with a numeric version.
    Canonical,
    /// `{tabs, timestamp}` written before versioning existed.
    LegacyUnversioned,
    /// `{containers: {<containerId>: {tabs, lastUpdate}}}`.
    ContainerWrapped,
    /// A bare array of records.
    FlatList,
    /// Missing, null or unrecognized.
    Empty,
}

impl StorageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageFormat::Canonical => "canonical",
            StorageFormat::LegacyUnversioned => "legacy-unversioned",
            StorageFormat::ContainerWrapped => "container-wrapped",
            StorageFormat::FlatList => "flat-list",
            StorageFormat::Empty => "empty",
        }
    }

    /// Whether a payload in this format must be rewritten in canonical form.
    pub fn needs_repersist(&self) -> bool {
        matches!(
            self,
            StorageFormat::LegacyUnversioned | StorageFormat::ContainerWrapped | StorageFormat::FlatList
        )
    }
}

/// Inspects `raw` and returns its layout. Never fails.
pub fn detect(raw: Option<&Value>) -> StorageFormat {
    let value = match raw {
        Some(v) => v,
        None => return StorageFormat::Empty,
    };

    match value {
        Value::Array(_) => StorageFormat::FlatList,
        Value::Object(map) => {
            if map.get("containers").map(Value::is_object).unwrap_or(false) {
                return StorageFormat::ContainerWrapped;
            }
            if !map.get("tabs").map(Value::is_array).unwrap_or(false) {
                return StorageFormat::Empty;
            }
            if map.get("version").map(Value::is_u64).unwrap_or(false) {
                StorageFormat::Canonical
            } else {
                StorageFormat::LegacyUnversioned
            }
        }
        _ => StorageFormat::Empty,
    }
}
