//! Message router for the Quick Tabs peer protocol.
//!
//! Every inbound peer message passes through [`MessageRouter::route`], which
//! normalizes the message, checks the operation allowlist and protocol
//! version, runs the ownership validator for mutations, dispatches to the
//! registered [`OperationHandler`] and wraps whatever comes back in a
//! [`ResponseEnvelope`]. Handler errors and panics never escape the router.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::services::ownership_validator::OwnershipValidator;
use crate::types::errors::HandlerError;
use crate::types::message::{
    ErrorCode, InboundMessage, Operation, OperationKey, ParseRejection, ProtocolVersion, ResponseEnvelope,
    SenderContext,
};
use crate::types::peer::PeerId;

/// Default error text for failures that carry none.
pub const DEFAULT_FAILURE_MESSAGE: &str = "Operation failed";

/// A validated request handed to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedRequest {
    pub message: InboundMessage,
    pub sender: SenderContext,
    /// Peer the operation is attributed to, after ownership validation.
    pub resolved_peer_id: Option<PeerId>,
}

/// What the caller should do with a routed message.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Respond(ResponseEnvelope),
    /// The message belongs to another listener (legacy `type` key, unknown name).
    Deferred { type_name: String },
}

impl RouteOutcome {
    pub fn response(&self) -> Option<&ResponseEnvelope> {
        match self {
            RouteOutcome::Respond(envelope) => Some(envelope),
            RouteOutcome::Deferred { .. } => None,
        }
    }
}

/// Handles one or more operations against a mutable context `C`.
#[async_trait]
pub trait OperationHandler<C: Send>: Send + Sync {
    async fn handle(&self, ctx: &mut C, request: &RoutedRequest) -> Result<Value, HandlerError>;
}

/// Routing counters, shared with diagnostics.
#[derive(Debug, Default)]
pub struct RouterCounters {
    routed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    invalid_format: AtomicU64,
    unknown_command: AtomicU64,
    deferred: AtomicU64,
    ownership_rejections: AtomicU64,
    version_mismatches: AtomicU64,
    handler_panics: AtomicU64,
    unknown_names: Mutex<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCountersSnapshot {
    pub routed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub invalid_format: u64,
    pub unknown_command: u64,
    pub deferred: u64,
    pub ownership_rejections: u64,
    pub version_mismatches: u64,
    pub handler_panics: u64,
    pub unknown_names: BTreeMap<String, u64>,
}

impl RouterCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn note_unknown(&self, name: &str) {
        Self::bump(&self.unknown_command);
        if let Ok(mut names) = self.unknown_names.lock() {
            *names.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self) -> RouterCountersSnapshot {
        RouterCountersSnapshot {
            routed: self.routed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            invalid_format: self.invalid_format.load(Ordering::Relaxed),
            unknown_command: self.unknown_command.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            ownership_rejections: self.ownership_rejections.load(Ordering::Relaxed),
            version_mismatches: self.version_mismatches.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            unknown_names: self.unknown_names.lock().map(|n| n.clone()).unwrap_or_default(),
        }
    }
}

pub struct MessageRouter<C: Send> {
    handlers: HashMap<Operation, Arc<dyn OperationHandler<C>>>,
    validator: OwnershipValidator,
    protocol: ProtocolVersion,
    counters: Arc<RouterCounters>,
}

impl<C: Send> Default for MessageRouter<C> {
    fn default() -> Self {
        Self::new(ProtocolVersion::current())
    }
}

impl<C: Send> MessageRouter<C> {
    pub fn new(protocol: ProtocolVersion) -> Self {
        Self {
            handlers: HashMap::new(),
            validator: OwnershipValidator::new(),
            protocol,
            counters: Arc::new(RouterCounters::default()),
        }
    }

    /// Registers `handler` for every operation in `operations`, replacing earlier registrations.
    pub fn register(&mut self, operations: &[Operation], handler: Arc<dyn OperationHandler<C>>) -> &mut Self {
        for operation in operations {
            self.handlers.insert(*operation, handler.clone());
        }
        self
    }

    pub fn counters(&self) -> Arc<RouterCounters> {
        self.counters.clone()
    }

    pub async fn route(&self, ctx: &mut C, raw: &Value, sender: &SenderContext) -> RouteOutcome {
        RouterCounters::bump(&self.counters.routed);
        let message_id = InboundMessage::peek_message_id(raw);

        let message = match InboundMessage::parse(raw) {
            Ok(message) => message,
            Err(ParseRejection::InvalidFormat(reason)) => {
                RouterCounters::bump(&self.counters.invalid_format);
                warn!(sender = ?sender.peer_id, reason = %reason, "Rejected malformed message");
                return self.fail(ErrorCode::InvalidMessageFormat, &reason, message_id);
            }
            Err(ParseRejection::Unknown {
                name,
                key: OperationKey::Type,
            }) => {
                RouterCounters::bump(&self.counters.deferred);
                debug!(type_name = %name, "Deferred message with unrecognized type");
                return RouteOutcome::Deferred { type_name: name };
            }
            Err(ParseRejection::Unknown { name, key }) => {
                self.counters.note_unknown(&name);
                warn!(operation = %name, key = key.as_str(), sender = ?sender.peer_id, "Rejected unknown command");
                return self.fail(
                    ErrorCode::UnknownCommand,
                    &format!("Unknown command: {}", name),
                    message_id,
                );
            }
        };

        if let Some(raw_version) = &message.protocol_version {
            match ProtocolVersion::from_value(raw_version) {
                None => {
                    RouterCounters::bump(&self.counters.invalid_format);
                    warn!(operation = %message.operation, version = %raw_version, "Rejected unparseable protocol version");
                    return self.fail(
                        ErrorCode::InvalidMessageFormat,
                        &format!("Invalid protocol version: {}", raw_version),
                        message_id,
                    );
                }
                Some(version) if version != self.protocol => {
                    RouterCounters::bump(&self.counters.version_mismatches);
                    warn!(
                        operation = %message.operation,
                        peer_version = %version,
                        coordinator_version = %self.protocol,
                        "Protocol version mismatch"
                    );
                }
                Some(_) => {}
            }
        }

        let handler = match self.handlers.get(&message.operation) {
            Some(handler) => handler.clone(),
            None => {
                self.counters.note_unknown(message.operation.as_str());
                warn!(operation = %message.operation, "No handler registered");
                return self.fail(
                    ErrorCode::UnknownCommand,
                    &format!("Unknown command: {}", message.operation),
                    message_id,
                );
            }
        };

        let resolved_peer_id = if message.operation.is_mutation() {
            match self
                .validator
                .validate(&message, sender, message.operation.requires_ownership())
            {
                Ok(peer) => Some(peer),
                Err(e) => {
                    RouterCounters::bump(&self.counters.ownership_rejections);
                    return self.fail(e.code(), &e.to_string(), message_id);
                }
            }
        } else {
            sender.peer_id
        };

        let operation = message.operation;
        let request = RoutedRequest {
            message,
            sender: sender.clone(),
            resolved_peer_id,
        };

        let result = AssertUnwindSafe(handler.handle(ctx, &request)).catch_unwind().await;
        let envelope = match result {
            Ok(Ok(value)) => normalize_response(value, message_id),
            Ok(Err(e)) => ResponseEnvelope::failure(e.code(), &e.to_string(), message_id),
            Err(panic) => {
                RouterCounters::bump(&self.counters.handler_panics);
                let reason = panic_message(panic.as_ref());
                warn!(operation = %operation, reason = %reason, "Handler panicked");
                ResponseEnvelope::failure(
                    ErrorCode::HandlerError,
                    &format!("Handler failed: {}", reason),
                    message_id,
                )
            }
        };

        if envelope.success {
            RouterCounters::bump(&self.counters.succeeded);
            info!(operation = %operation, peer = ?resolved_peer_id, "Routed");
        } else {
            RouterCounters::bump(&self.counters.failed);
            info!(
                operation = %operation,
                peer = ?resolved_peer_id,
                code = ?envelope.code,
                "Routed with failure"
            );
        }
        RouteOutcome::Respond(envelope)
    }

    fn fail(&self, code: ErrorCode, error: &str, message_id: Option<String>) -> RouteOutcome {
        RouterCounters::bump(&self.counters.failed);
        RouteOutcome::Respond(ResponseEnvelope::failure(code, error, message_id))
    }
}

/// Wraps a handler's return value in the response envelope.
///
/// Values already shaped like `{success: bool, ...}` are honored: a failure
/// without an `error` gets a default message and, lacking a known `code`,
/// `HANDLER_ERROR`. Anything else, `null` included, becomes `data`.
pub fn normalize_response(value: Value, message_id: Option<String>) -> ResponseEnvelope {
    let success = match value.get("success") {
        Some(Value::Bool(flag)) => *flag,
        _ => return ResponseEnvelope::ok(value, message_id),
    };

    if success {
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        return ResponseEnvelope::ok(data, message_id);
    }

    let error = value
        .get("error")
        .and_then(Value::as_str)
        .filter(|e| !e.is_empty())
        .unwrap_or(DEFAULT_FAILURE_MESSAGE);
    let code = value
        .get("code")
        .and_then(Value::as_str)
        .and_then(ErrorCode::from_name)
        .unwrap_or(ErrorCode::HandlerError);
    ResponseEnvelope::failure(code, error, message_id)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
