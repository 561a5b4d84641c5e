//! Unit tests for message routing: normalization, allowlist, version checks,
//! ownership enforcement and failure containment.

use std::sync::Arc;

use async_trait::async_trait;
use quicktabs::message_router::{MessageRouter, OperationHandler, RouteOutcome, RoutedRequest};
use quicktabs::types::errors::HandlerError;
use quicktabs::types::message::{ErrorCode, Operation, ProtocolVersion, ResponseEnvelope, SenderContext};
use quicktabs::types::peer::PeerId;
use serde_json::{json, Value};

#[derive(Default)]
struct Recorder {
    calls: Vec<(Operation, Option<PeerId>)>,
}

struct EchoHandler;

#[async_trait]
impl OperationHandler<Recorder> for EchoHandler {
    async fn handle(&self, ctx: &mut Recorder, request: &RoutedRequest) -> Result<Value, HandlerError> {
        ctx.calls.push((request.message.operation, request.resolved_peer_id));
        Ok(json!({"echo": request.message.quick_tab_id}))
    }
}

struct PanicHandler;

#[async_trait]
impl OperationHandler<Recorder> for PanicHandler {
    async fn handle(&self, _ctx: &mut Recorder, _request: &RoutedRequest) -> Result<Value, HandlerError> {
        panic!("boom");
    }
}

struct MissingHandler;

#[async_trait]
impl OperationHandler<Recorder> for MissingHandler {
    async fn handle(&self, _ctx: &mut Recorder, request: &RoutedRequest) -> Result<Value, HandlerError> {
        Err(HandlerError::NotFound(request.message.quick_tab_id.clone().unwrap_or_default()))
    }
}

struct ShapedFailureHandler;

#[async_trait]
impl OperationHandler<Recorder> for ShapedFailureHandler {
    async fn handle(&self, _ctx: &mut Recorder, _request: &RoutedRequest) -> Result<Value, HandlerError> {
        Ok(json!({"success": false}))
    }
}

fn router() -> MessageRouter<Recorder> {
    let mut router = MessageRouter::new(ProtocolVersion::current());
    router
        .register(
            &[Operation::Minimize, Operation::ClearAll, Operation::GetState],
            Arc::new(EchoHandler),
        )
        .register(&[Operation::Restore], Arc::new(PanicHandler))
        .register(&[Operation::GetQuickTab], Arc::new(MissingHandler))
        .register(&[Operation::BringToFront], Arc::new(ShapedFailureHandler));
    router
}

fn respond(outcome: RouteOutcome) -> ResponseEnvelope {
    match outcome {
        RouteOutcome::Respond(envelope) => envelope,
        other => panic!("expected a response, got {:?}", other),
    }
}

#[tokio::test]
async fn test_valid_mutation_reaches_handler() {
    let router = router();
    let mut ctx = Recorder::default();
    let envelope = respond(
        router
            .route(
                &mut ctx,
                &json!({"operation": "minimize", "id": "qt-1", "originPeerId": 7, "messageId": "m-1"}),
                &SenderContext::peer(PeerId(7)),
            )
            .await,
    );

    assert!(envelope.success);
    assert_eq!(envelope.data, Some(json!({"echo": "qt-1"})));
    assert_eq!(envelope.message_id.as_deref(), Some("m-1"));
    assert_eq!(envelope.version, "1.0.0");
    assert_eq!(ctx.calls, vec![(Operation::Minimize, Some(PeerId(7)))]);
}

#[tokio::test]
async fn test_legacy_action_key_is_accepted() {
    let router = router();
    let mut ctx = Recorder::default();
    let envelope = respond(
        router
            .route(
                &mut ctx,
                &json!({"action": "getState"}),
                &SenderContext::peer(PeerId(1)),
            )
            .await,
    );
    assert!(envelope.success);
    assert_eq!(ctx.calls, vec![(Operation::GetState, Some(PeerId(1)))]);
}

#[tokio::test]
async fn test_unknown_operation_is_rejected() {
    let router = router();
    let mut ctx = Recorder::default();
    let envelope = respond(
        router
            .route(&mut ctx, &json!({"operation": "teleport"}), &SenderContext::peer(PeerId(1)))
            .await,
    );
    assert!(!envelope.success);
    assert_eq!(envelope.code, Some(ErrorCode::UnknownCommand));
    assert!(ctx.calls.is_empty());
    assert_eq!(router.counters().snapshot().unknown_names.get("teleport"), Some(&1));
}

#[tokio::test]
async fn test_unknown_type_is_deferred() {
    let router = router();
    let mut ctx = Recorder::default();
    let outcome = router
        .route(&mut ctx, &json!({"type": "SOME_OTHER_EVENT"}), &SenderContext::peer(PeerId(1)))
        .await;
    assert_eq!(
        outcome,
        RouteOutcome::Deferred {
            type_name: "SOME_OTHER_EVENT".to_string()
        }
    );
    assert!(outcome.response().is_none());
}

#[tokio::test]
async fn test_allowlisted_but_unregistered_is_unknown() {
    let router = router();
    let mut ctx = Recorder::default();
    let envelope = respond(
        router
            .route(
                &mut ctx,
                &json!({"operation": "getDiagnostics"}),
                &SenderContext::peer(PeerId(1)),
            )
            .await,
    );
    assert_eq!(envelope.code, Some(ErrorCode::UnknownCommand));
}

#[tokio::test]
async fn test_malformed_messages_are_rejected() {
    let router = router();
    let mut ctx = Recorder::default();
    for raw in [json!("hello"), json!({}), json!({"operation": 5}), json!({"operation": ""})] {
        let envelope = respond(router.route(&mut ctx, &raw, &SenderContext::peer(PeerId(1))).await);
        assert_eq!(envelope.code, Some(ErrorCode::InvalidMessageFormat), "{}", raw);
    }
    assert_eq!(router.counters().snapshot().invalid_format, 4);
}

#[tokio::test]
async fn test_origin_mismatch_blocks_handler() {
    let router = router();
    let mut ctx = Recorder::default();
    let envelope = respond(
        router
            .route(
                &mut ctx,
                &json!({"operation": "minimize", "id": "qt-1", "originPeerId": 2}),
                &SenderContext::peer(PeerId(1)),
            )
            .await,
    );
    assert_eq!(envelope.code, Some(ErrorCode::OriginMismatch));
    assert!(ctx.calls.is_empty());
    assert_eq!(router.counters().snapshot().ownership_rejections, 1);
}

#[tokio::test]
async fn test_mutation_without_sender_is_rejected() {
    let router = router();
    let mut ctx = Recorder::default();
    let envelope = respond(
        router
            .route(
                &mut ctx,
                &json!({"operation": "minimize", "id": "qt-1", "originPeerId": 2}),
                &SenderContext::default(),
            )
            .await,
    );
    assert_eq!(envelope.code, Some(ErrorCode::SenderTabRequired));
}

#[tokio::test]
async fn test_clear_all_uses_sender_identity() {
    let router = router();
    let mut ctx = Recorder::default();
    let envelope = respond(
        router
            .route(&mut ctx, &json!({"operation": "clearAll"}), &SenderContext::peer(PeerId(9)))
            .await,
    );
    assert!(envelope.success);
    assert_eq!(ctx.calls, vec![(Operation::ClearAll, Some(PeerId(9)))]);
}

#[tokio::test]
async fn test_panicking_handler_yields_handler_error() {
    let router = router();
    let mut ctx = Recorder::default();
    let envelope = respond(
        router
            .route(
                &mut ctx,
                &json!({"operation": "restore", "id": "qt-1", "originPeerId": 1}),
                &SenderContext::peer(PeerId(1)),
            )
            .await,
    );
    assert!(!envelope.success);
    assert_eq!(envelope.code, Some(ErrorCode::HandlerError));
    assert!(envelope.error.unwrap().contains("boom"));
    assert_eq!(router.counters().snapshot().handler_panics, 1);

    // The router keeps serving after a panic.
    let envelope = respond(
        router
            .route(&mut ctx, &json!({"operation": "getState"}), &SenderContext::peer(PeerId(1)))
            .await,
    );
    assert!(envelope.success);
}

#[tokio::test]
async fn test_handler_error_maps_to_code() {
    let router = router();
    let mut ctx = Recorder::default();
    let envelope = respond(
        router
            .route(
                &mut ctx,
                &json!({"operation": "getQuickTab", "id": "ghost"}),
                &SenderContext::peer(PeerId(1)),
            )
            .await,
    );
    assert_eq!(envelope.code, Some(ErrorCode::QuickTabNotFound));
    assert_eq!(envelope.error.as_deref(), Some("Quick Tab not found: ghost"));
}

#[tokio::test]
async fn test_shaped_failure_gets_default_error() {
    let router = router();
    let mut ctx = Recorder::default();
    let envelope = respond(
        router
            .route(
                &mut ctx,
                &json!({"operation": "bringToFront", "id": "qt-1", "originPeerId": 1}),
                &SenderContext::peer(PeerId(1)),
            )
            .await,
    );
    assert!(!envelope.success);
    assert_eq!(envelope.error.as_deref(), Some("Operation failed"));
    assert_eq!(envelope.code, Some(ErrorCode::HandlerError));
}

#[tokio::test]
async fn test_version_mismatch_is_logged_not_rejected() {
    let router = router();
    let mut ctx = Recorder::default();
    let envelope = respond(
        router
            .route(
                &mut ctx,
                &json!({"operation": "getState", "protocolVersion": "2.0.0"}),
                &SenderContext::peer(PeerId(1)),
            )
            .await,
    );
    assert!(envelope.success);
    assert_eq!(router.counters().snapshot().version_mismatches, 1);
}

#[tokio::test]
async fn test_unparseable_version_is_rejected() {
    let router = router();
    let mut ctx = Recorder::default();
    let envelope = respond(
        router
            .route(
                &mut ctx,
                &json!({"operation": "getState", "protocolVersion": "one.two"}),
                &SenderContext::peer(PeerId(1)),
            )
            .await,
    );
    assert_eq!(envelope.code, Some(ErrorCode::InvalidMessageFormat));
    assert!(ctx.calls.is_empty());
}
