//! Quick Tabs durable storage layer.
//!
//! Provides the SQLite key/value table, its schema migrations and the
//! [`DurableStore`] abstraction the coordinator persists through.
//!
//! # Usage
//!
//! ```no_run
//! use quicktabs::database::{DurableStore, SqliteStore};
//!
//! # async fn demo() {
//! let store = SqliteStore::open("quicktabs.db").expect("failed to open database");
//! let mut changes = store.subscribe();
//! store.set("quick_tabs_state_v2", serde_json::json!({"tabs": []})).await.unwrap();
//! let change = changes.recv().await.unwrap();
//! # }
//! ```

pub mod connection;
pub mod migrations;
pub mod store;

pub use connection::Database;
pub use store::{DurableStore, MemoryStore, SqliteStore, StorageChange};
