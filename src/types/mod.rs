// Quick Tabs shared type definitions
// Each submodule defines types used across the coordinator, peers and the wire protocol.

pub mod command;
pub mod errors;
pub mod events;
pub mod message;
pub mod peer;
pub mod quick_tab;
pub mod settings;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
