//! Quick Tabs: cross-tab state synchronization core for floating overlay windows.
//!
//! This library crate exposes all modules for use by the binary and integration tests.

pub mod app;
pub mod database;
pub mod managers;
pub mod message_router;
pub mod operation_handlers;
pub mod platform;
pub mod services;
pub mod types;
