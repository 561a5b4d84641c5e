//! Operation handlers registered on the coordinator's [`MessageRouter`].
//!
//! Handlers receive the coordinator-owned [`SyncContext`] mutably; the router
//! has already validated shape, version and ownership.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::managers::peer_tracker::PeerTracker;
use crate::managers::quick_tab_manager::QuickTabStateHandler;
use crate::message_router::{MessageRouter, OperationHandler, RoutedRequest, RouterCounters};
use crate::types::command::QuickTabCommand;
use crate::types::errors::HandlerError;
use crate::types::message::{Operation, ProtocolVersion};
use crate::types::quick_tab::DEFAULT_CONTAINER_ID;

/// State the handlers operate on. Owned by the coordinator task.
pub struct SyncContext {
    pub state: QuickTabStateHandler,
    pub peers: PeerTracker,
}

/// All mutations: decode, then apply through the state handler.
pub struct MutationHandler;

/// `getState` and `getQuickTab`.
pub struct QueryHandler;

/// `getCurrentPeerId` and `getContainerContext`. Never waits for hydration.
pub struct PeerIdentityHandler;

/// `getDiagnostics`.
pub struct DiagnosticsHandler {
    counters: Arc<RouterCounters>,
}

pub const MUTATIONS: &[Operation] = &[
    Operation::Create,
    Operation::UpdatePosition,
    Operation::UpdatePositionFinal,
    Operation::UpdateSize,
    Operation::UpdateSizeFinal,
    Operation::UpdatePin,
    Operation::ToggleSolo,
    Operation::ToggleMute,
    Operation::Minimize,
    Operation::Restore,
    Operation::BringToFront,
    Operation::Destroy,
    Operation::BatchUpdate,
    Operation::ClearAll,
];

pub const IDENTITY_QUERIES: &[Operation] = &[Operation::GetCurrentPeerId, Operation::GetContainerContext];

#[async_trait]
impl OperationHandler<SyncContext> for MutationHandler {
    async fn handle(&self, ctx: &mut SyncContext, request: &RoutedRequest) -> Result<Value, HandlerError> {
        let actor = request
            .resolved_peer_id
            .ok_or_else(|| HandlerError::Internal("mutation without a resolved peer".to_string()))?;
        let command = QuickTabCommand::decode(request.message.operation, &request.message.body)?;
        let container_hint = request
            .sender
            .container_id
            .clone()
            .or_else(|| ctx.peers.get(actor).and_then(|p| p.container_id));
        ctx.state.execute(command, actor, container_hint.as_deref()).await
    }
}

#[async_trait]
impl OperationHandler<SyncContext> for QueryHandler {
    async fn handle(&self, ctx: &mut SyncContext, request: &RoutedRequest) -> Result<Value, HandlerError> {
        ctx.state.ensure_hydrated().await?;
        match request.message.operation {
            Operation::GetState => {
                let body = &request.message.body;
                let container = if body.get("allContainers").and_then(Value::as_bool).unwrap_or(false) {
                    None
                } else {
                    body.get("containerId")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| request.sender.container_id.clone())
                };
                Ok(ctx.state.get_state(container.as_deref()))
            }
            Operation::GetQuickTab => {
                let id = request
                    .message
                    .quick_tab_id
                    .as_deref()
                    .ok_or_else(|| HandlerError::InvalidPayload("missing id".to_string()))?;
                ctx.state.get_quick_tab(id)
            }
            other => Err(HandlerError::Internal(format!("{} is not a query", other))),
        }
    }
}

impl PeerIdentityHandler {
    /// Answers from the sender context and the peer table only.
    fn answer(peers: &PeerTracker, request: &RoutedRequest) -> Result<Value, HandlerError> {
        let peer_id = request.sender.peer_id;
        match request.message.operation {
            Operation::GetCurrentPeerId => Ok(json!({"peerId": peer_id})),
            Operation::GetContainerContext => {
                let known = peer_id.and_then(|p| peers.get(p));
                let container_id = request
                    .sender
                    .container_id
                    .clone()
                    .or_else(|| known.as_ref().and_then(|p| p.container_id.clone()))
                    .unwrap_or_else(|| DEFAULT_CONTAINER_ID.to_string());
                let url = request
                    .sender
                    .url
                    .clone()
                    .or_else(|| known.as_ref().map(|p| p.url.clone()));
                Ok(json!({
                    "peerId": peer_id,
                    "containerId": container_id,
                    "url": url,
                }))
            }
            other => Err(HandlerError::Internal(format!("{} is not an identity query", other))),
        }
    }
}

#[async_trait]
impl OperationHandler<SyncContext> for PeerIdentityHandler {
    async fn handle(&self, ctx: &mut SyncContext, request: &RoutedRequest) -> Result<Value, HandlerError> {
        Self::answer(&ctx.peers, request)
    }
}

#[async_trait]
impl OperationHandler<PeerTracker> for PeerIdentityHandler {
    async fn handle(&self, peers: &mut PeerTracker, request: &RoutedRequest) -> Result<Value, HandlerError> {
        Self::answer(peers, request)
    }
}

impl DiagnosticsHandler {
    pub fn new(counters: Arc<RouterCounters>) -> Self {
        Self { counters }
    }
}

#[async_trait]
impl OperationHandler<SyncContext> for DiagnosticsHandler {
    async fn handle(&self, ctx: &mut SyncContext, _request: &RoutedRequest) -> Result<Value, HandlerError> {
        Ok(json!({
            "router": self.counters.snapshot(),
            "state": ctx.state.diagnostics(),
            "peers": {
                "count": ctx.peers.len(),
                "ids": ctx.peers.peer_ids(),
            },
        }))
    }
}

/// Builds a router with every operation registered.
pub fn build_router(protocol: ProtocolVersion) -> MessageRouter<SyncContext> {
    let mut router = MessageRouter::new(protocol);
    let diagnostics = Arc::new(DiagnosticsHandler::new(router.counters()));
    router
        .register(MUTATIONS, Arc::new(MutationHandler))
        .register(&[Operation::GetState, Operation::GetQuickTab], Arc::new(QueryHandler))
        .register(
            IDENTITY_QUERIES,
            Arc::new(PeerIdentityHandler),
        )
        .register(&[Operation::GetDiagnostics], diagnostics);
    router
}

/// Router for the identity queries alone, answered off the coordinator task.
pub fn build_identity_router(protocol: ProtocolVersion) -> MessageRouter<PeerTracker> {
    let mut router = MessageRouter::new(protocol);
    router.register(IDENTITY_QUERIES, Arc::new(PeerIdentityHandler));
    router
}
