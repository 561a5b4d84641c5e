// Quick Tabs state managers
// Managers own mutable state: the canonical Quick Tab mirror, the live peer set,
// a peer-side read mirror and the create dedup window.

pub mod dedup_tracker;
pub mod peer_mirror;
pub mod peer_tracker;
pub mod quick_tab_manager;
