// Quick Tabs services
// Services provide the coordinator's building blocks: storage format detection and
// migration, write serialization, ownership checks, transports, broadcast and settings.

pub mod broadcast_manager;
pub mod format_detector;
pub mod format_migrator;
pub mod ownership_validator;
pub mod peer_transport;
pub mod settings_engine;
pub mod write_queue;
