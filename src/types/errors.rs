use thiserror::Error;

use super::message::ErrorCode;
use super::peer::PeerId;

// === StoreError ===

/// Errors raised by a durable store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The SQLite backend failed.
    #[error("Store database error: {0}")]
    Database(String),
    /// A stored value could not be encoded or decoded.
    #[error("Store serialization error: {0}")]
    Serialization(String),
    /// The backend refused or could not complete the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

// === WriteQueueError ===

/// Errors surfaced to whoever enqueued a write.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WriteQueueError {
    /// Every attempt failed; the mutation was not persisted.
    #[error("Write failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    /// The worker task is gone.
    #[error("Write queue is closed")]
    Closed,
}

// === HandlerError ===

/// Errors produced while executing a routed operation.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Hydration did not complete within its guard; retry later.
    #[error("State not initialized; retry the request")]
    NotInitialized,
    /// Hydration failed outright.
    #[error("Global state not ready: {0}")]
    GlobalStateNotReady(String),
    /// Operation fields failed validation.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    /// The referenced Quick Tab does not exist.
    #[error("Quick Tab not found: {0}")]
    NotFound(String),
    /// Persistence failed after bounded retries.
    #[error(transparent)]
    Write(#[from] WriteQueueError),
    /// Anything unexpected inside a handler.
    #[error("Handler failed: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::NotInitialized => ErrorCode::NotInitialized,
            HandlerError::GlobalStateNotReady(_) => ErrorCode::GlobalStateNotReady,
            HandlerError::InvalidPayload(_) => ErrorCode::InvalidPayload,
            HandlerError::NotFound(_) => ErrorCode::QuickTabNotFound,
            HandlerError::Write(_) => ErrorCode::StorageWriteFailed,
            HandlerError::Internal(_) => ErrorCode::HandlerError,
        }
    }
}

// === OwnershipError ===

/// Reasons a mutation request fails authenticity checks.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OwnershipError {
    /// The transport did not identify the sending peer.
    #[error("Sender peer id required")]
    SenderRequired,
    /// An ownership-required request did not claim an origin peer.
    #[error("Origin peer id required for this operation")]
    OriginRequired,
    /// The claimed origin differs from the transport-supplied sender.
    #[error("Origin mismatch: claimed {claimed}, sender {actual}")]
    OriginMismatch { claimed: PeerId, actual: PeerId },
    /// The claimed origin is not a peer id at all.
    #[error("Origin mismatch: claimed '{claimed}' is not a peer id, sender {actual}")]
    UnparsedOrigin { claimed: String, actual: PeerId },
}

impl OwnershipError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OwnershipError::SenderRequired | OwnershipError::OriginRequired => ErrorCode::SenderTabRequired,
            OwnershipError::OriginMismatch { .. } | OwnershipError::UnparsedOrigin { .. } => {
                ErrorCode::OriginMismatch
            }
        }
    }
}

// === TransportError ===

/// Per-call outcome of sending to one peer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    /// The peer has no listener. Expected while tabs load or close.
    #[error("Peer {0} is not listening")]
    NotListening(PeerId),
    /// The peer did not acknowledge in time.
    #[error("Timed out delivering to peer {0}")]
    Timeout(PeerId),
    /// The peer registry could not be queried.
    #[error("Peer enumeration failed: {0}")]
    Enumeration(String),
}

// === SettingsError ===

/// Errors related to settings management.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// An I/O error occurred while reading or writing settings.
    #[error("Settings I/O error: {0}")]
    IoError(String),
    /// Failed to serialize or deserialize settings.
    #[error("Settings serialization error: {0}")]
    SerializationError(String),
    /// The provided settings key is invalid.
    #[error("Invalid settings key: {0}")]
    InvalidKey(String),
    /// The provided settings value is invalid.
    #[error("Invalid settings value: {0}")]
    InvalidValue(String),
}

// === CoordinatorError ===

/// Errors returned by a [`CoordinatorHandle`](crate::app::CoordinatorHandle).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoordinatorError {
    /// The coordinator task has exited.
    #[error("Coordinator is not running")]
    Stopped,
    #[error(transparent)]
    Transport(#[from] TransportError),
}
