//! Wire types for the peer ↔ coordinator protocol.
//!
//! Inbound messages arrive as loosely shaped JSON. [`InboundMessage::parse`] is the
//! single normalization step: it resolves the operation name (including the two
//! legacy key names), checks it against the closed [`Operation`] allowlist and
//! lifts the common envelope fields out of the body.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::peer::PeerId;

/// Protocol version spoken by this coordinator.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Closed allowlist of operations the router accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Create,
    UpdatePosition,
    UpdatePositionFinal,
    UpdateSize,
    UpdateSizeFinal,
    UpdatePin,
    ToggleSolo,
    ToggleMute,
    Minimize,
    Restore,
    BringToFront,
    Destroy,
    BatchUpdate,
    ClearAll,
    GetState,
    GetQuickTab,
    GetCurrentPeerId,
    GetContainerContext,
    GetDiagnostics,
}

impl Operation {
    pub const ALL: &'static [Operation] = &[
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
        Operation::GetState,
        Operation::GetQuickTab,
        Operation::GetCurrentPeerId,
        Operation::GetContainerContext,
        Operation::GetDiagnostics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::UpdatePosition => "updatePosition",
            Operation::UpdatePositionFinal => "updatePositionFinal",
            Operation::UpdateSize => "updateSize",
            Operation::UpdateSizeFinal => "updateSizeFinal",
            Operation::UpdatePin => "updatePin",
            Operation::ToggleSolo => "toggleSolo",
            Operation::ToggleMute => "toggleMute",
            Operation::Minimize => "minimize",
            Operation::Restore => "restore",
            Operation::BringToFront => "bringToFront",
            Operation::Destroy => "destroy",
            Operation::BatchUpdate => "batchUpdate",
            Operation::ClearAll => "clearAll",
            Operation::GetState => "getState",
            Operation::GetQuickTab => "getQuickTab",
            Operation::GetCurrentPeerId => "getCurrentPeerId",
            Operation::GetContainerContext => "getContainerContext",
            Operation::GetDiagnostics => "getDiagnostics",
        }
    }

    pub fn from_name(name: &str) -> Option<Operation> {
        Operation::ALL.iter().copied().find(|op| op.as_str() == name)
    }

    /// Operations that create, mutate or delete a record on behalf of a peer.
    pub fn requires_ownership(&self) -> bool {
        matches!(
            self,
            Operation::Create
                | Operation::UpdatePosition
                | Operation::UpdatePositionFinal
                | Operation::UpdateSize
                | Operation::UpdateSizeFinal
                | Operation::UpdatePin
                | Operation::ToggleSolo
                | Operation::ToggleMute
                | Operation::Minimize
                | Operation::Restore
                | Operation::BringToFront
                | Operation::Destroy
                | Operation::BatchUpdate
        )
    }

    /// Administrative mutations validated with the transport id as fallback.
    pub fn is_administrative(&self) -> bool {
        matches!(self, Operation::ClearAll)
    }

    pub fn is_mutation(&self) -> bool {
        self.requires_ownership() || self.is_administrative()
    }

    /// Queries answered from the sender and peer table, never from state.
    pub fn is_identity(&self) -> bool {
        matches!(self, Operation::GetCurrentPeerId | Operation::GetContainerContext)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::from_name(s).ok_or_else(|| format!("unknown operation: {}", s))
    }
}

/// Which message key carried the operation name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKey {
    Operation,
    /// Legacy command-style key.
    Action,
    /// Legacy event-style key; unknown names here belong to another protocol.
    Type,
}

impl OperationKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKey::Operation => "operation",
            OperationKey::Action => "action",
            OperationKey::Type => "type",
        }
    }
}

/// Wire error codes carried in failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessageFormat,
    UnknownCommand,
    SenderTabRequired,
    OriginMismatch,
    NotInitialized,
    GlobalStateNotReady,
    HandlerError,
    InvalidPayload,
    QuickTabNotFound,
    StorageWriteFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMessageFormat => "INVALID_MESSAGE_FORMAT",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::SenderTabRequired => "SENDER_TAB_REQUIRED",
            ErrorCode::OriginMismatch => "ORIGIN_MISMATCH",
            ErrorCode::NotInitialized => "NOT_INITIALIZED",
            ErrorCode::GlobalStateNotReady => "GLOBAL_STATE_NOT_READY",
            ErrorCode::HandlerError => "HANDLER_ERROR",
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::QuickTabNotFound => "QUICK_TAB_NOT_FOUND",
            ErrorCode::StorageWriteFailed => "STORAGE_WRITE_FAILED",
        }
    }

    pub fn from_name(name: &str) -> Option<ErrorCode> {
        serde_json::from_value(Value::String(name.to_string())).ok()
    }

    /// Whether the caller may reasonably resend the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NotInitialized | ErrorCode::GlobalStateNotReady | ErrorCode::StorageWriteFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `major.minor.patch` protocol version. Missing components read as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub fn current() -> Self {
        // PROTOCOL_VERSION is a literal we control.
        Self::parse(PROTOCOL_VERSION).unwrap_or(Self { major: 1, minor: 0, patch: 0 })
    }

    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim().trim_start_matches('v');
        if trimmed.is_empty() {
            return None;
        }
        let mut parts = [0u32; 3];
        for (i, part) in trimmed.split('.').enumerate() {
            if i >= 3 {
                return None;
            }
            parts[i] = part.parse().ok()?;
        }
        Some(Self {
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
        })
    }

    /// Reads a version from a JSON string or number.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Self::parse(s),
            Value::Number(n) => Self::parse(&n.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Identity of the sender as reported by the transport, never by the message body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderContext {
    #[serde(default)]
    pub peer_id: Option<PeerId>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub container_id: Option<String>,
}

impl SenderContext {
    pub fn peer(peer_id: PeerId) -> Self {
        Self {
            peer_id: Some(peer_id),
            ..Default::default()
        }
    }

    pub fn with_container(mut self, container_id: &str) -> Self {
        self.container_id = Some(container_id.to_string());
        self
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }
}

/// Why a raw message could not be normalized.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseRejection {
    /// Not an object, or no operation key at all.
    InvalidFormat(String),
    /// Well-formed but not on the allowlist.
    Unknown { name: String, key: OperationKey },
}

/// What a message body says about the peer it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum OriginClaim {
    Peer(PeerId),
    /// Present but not a peer id. It can never match a sender.
    Unparsed(String),
}

impl OriginClaim {
    fn from_value(value: &Value) -> Self {
        match parse_peer_id(value) {
            Some(peer) => OriginClaim::Peer(peer),
            None => OriginClaim::Unparsed(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        }
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        match self {
            OriginClaim::Peer(peer) => Some(*peer),
            OriginClaim::Unparsed(_) => None,
        }
    }
}

/// Reads `originPeerId` (or the legacy `originTabId`) from a message or batch entry body.
pub fn origin_claim(body: &Map<String, Value>) -> Option<OriginClaim> {
    match body.get("originPeerId").or_else(|| body.get("originTabId")) {
        None | Some(Value::Null) => None,
        Some(value) => Some(OriginClaim::from_value(value)),
    }
}

/// A normalized inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub operation: Operation,
    pub operation_key: OperationKey,
    pub quick_tab_id: Option<String>,
    pub origin_claim: Option<OriginClaim>,
    pub message_id: Option<String>,
    pub protocol_version: Option<Value>,
    /// The full original body, for operation-specific fields.
    pub body: Map<String, Value>,
}

impl InboundMessage {
    pub fn parse(raw: &Value) -> Result<InboundMessage, ParseRejection> {
        let body = raw
            .as_object()
            .ok_or_else(|| ParseRejection::InvalidFormat("message is not an object".to_string()))?;

        let (name, key) = extract_operation(body)?;
        let operation = Operation::from_name(name).ok_or_else(|| ParseRejection::Unknown {
            name: name.to_string(),
            key,
        })?;

        let message_id = match body.get("messageId") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Ok(InboundMessage {
            operation,
            operation_key: key,
            quick_tab_id: body.get("id").and_then(|v| v.as_str()).map(str::to_string),
            origin_claim: origin_claim(body),
            message_id,
            protocol_version: body.get("protocolVersion").cloned(),
            body: body.clone(),
        })
    }

    /// Best-effort message id for echoing back on rejection paths.
    pub fn peek_message_id(raw: &Value) -> Option<String> {
        match raw.get("messageId") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

fn extract_operation(body: &Map<String, Value>) -> Result<(&str, OperationKey), ParseRejection> {
    let keys = [OperationKey::Operation, OperationKey::Action, OperationKey::Type];
    for key in keys {
        match body.get(key.as_str()) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Ok((s.as_str(), key)),
            Some(Value::Null) | None => continue,
            Some(_) => {
                return Err(ParseRejection::InvalidFormat(format!(
                    "'{}' must be a non-empty string",
                    key.as_str()
                )))
            }
        }
    }
    Err(ParseRejection::InvalidFormat(
        "message has no operation, action or type".to_string(),
    ))
}

/// Peer ids arrive as integers, or as decimal strings from older senders.
pub fn parse_peer_id(value: &Value) -> Option<PeerId> {
    match value {
        Value::Number(n) => n.as_u64().map(PeerId),
        Value::String(s) => s.trim().parse::<u64>().ok().map(PeerId),
        _ => None,
    }
}

/// The single response shape every routed message receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub timestamp: i64,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(data: Value, message_id: Option<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
            timestamp: super::now_millis(),
            version: PROTOCOL_VERSION.to_string(),
            message_id,
        }
    }

    pub fn failure(code: ErrorCode, error: &str, message_id: Option<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            code: Some(code),
            timestamp: super::now_millis(),
            version: PROTOCOL_VERSION.to_string(),
            message_id,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
