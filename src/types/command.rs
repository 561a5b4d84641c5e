//! Typed mutation commands decoded from normalized inbound messages.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::errors::HandlerError;
use super::message::{parse_peer_id, Operation};
use super::peer::PeerId;

/// Fields accepted by `create`. Everything but `id` is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub left: Option<i32>,
    #[serde(default)]
    pub top: Option<i32>,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub minimized: Option<bool>,
    #[serde(default, alias = "cookieStoreId")]
    pub container_id: Option<String>,
    #[serde(default)]
    pub pinned_to_url: Option<String>,
}

const GEOMETRY_FIELDS: &[&str] = &["left", "top", "width", "height"];

/// A decoded mutation. Batch entries are themselves commands (never nested batches).
#[derive(Debug, Clone, PartialEq)]
pub enum QuickTabCommand {
    Create(CreateRequest),
    UpdatePosition { id: String, left: i32, top: i32, final_update: bool },
    UpdateSize { id: String, width: u32, height: u32, final_update: bool },
    UpdatePin { id: String, pinned_to_url: Option<String> },
    ToggleSolo { id: String, peer_id: Option<PeerId> },
    ToggleMute { id: String, peer_id: Option<PeerId> },
    Minimize { id: String },
    Restore { id: String },
    BringToFront { id: String },
    Destroy { id: String },
    ClearAll { container_id: Option<String> },
    Batch { operations: Vec<QuickTabCommand>, clock: BTreeMap<PeerId, u64> },
}

impl QuickTabCommand {
    /// Decodes the operation-specific fields of `body` for `operation`.
    pub fn decode(operation: Operation, body: &Map<String, Value>) -> Result<Self, HandlerError> {
        match operation {
            Operation::Create => {
                // Geometry goes through the same rounding as the update operations.
                let mut fields = body.clone();
                for key in GEOMETRY_FIELDS {
                    fields.remove(*key);
                }
                let mut request: CreateRequest = serde_json::from_value(Value::Object(fields))
                    .map_err(|e| HandlerError::InvalidPayload(format!("create: {}", e)))?;
                if request.id.trim().is_empty() {
                    return Err(HandlerError::InvalidPayload("create: id must not be empty".to_string()));
                }
                request.left = optional_i32(body, "left")?;
                request.top = optional_i32(body, "top")?;
                request.width = optional_i32(body, "width")?.map(i64::from);
                request.height = optional_i32(body, "height")?.map(i64::from);
                Ok(QuickTabCommand::Create(request))
            }
            Operation::UpdatePosition | Operation::UpdatePositionFinal => Ok(QuickTabCommand::UpdatePosition {
                id: require_id(body)?,
                left: require_i32(body, "left")?,
                top: require_i32(body, "top")?,
                final_update: operation == Operation::UpdatePositionFinal || flag(body, "final"),
            }),
            Operation::UpdateSize | Operation::UpdateSizeFinal => Ok(QuickTabCommand::UpdateSize {
                id: require_id(body)?,
                width: require_dimension(body, "width")?,
                height: require_dimension(body, "height")?,
                final_update: operation == Operation::UpdateSizeFinal || flag(body, "final"),
            }),
            Operation::UpdatePin => Ok(QuickTabCommand::UpdatePin {
                id: require_id(body)?,
                pinned_to_url: body
                    .get("pinnedToUrl")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            }),
            Operation::ToggleSolo => Ok(QuickTabCommand::ToggleSolo {
                id: require_id(body)?,
                peer_id: optional_peer(body, "peerId")?,
            }),
            Operation::ToggleMute => Ok(QuickTabCommand::ToggleMute {
                id: require_id(body)?,
                peer_id: optional_peer(body, "peerId")?,
            }),
            Operation::Minimize => Ok(QuickTabCommand::Minimize { id: require_id(body)? }),
            Operation::Restore => Ok(QuickTabCommand::Restore { id: require_id(body)? }),
            Operation::BringToFront => Ok(QuickTabCommand::BringToFront { id: require_id(body)? }),
            Operation::Destroy => Ok(QuickTabCommand::Destroy { id: require_id(body)? }),
            Operation::ClearAll => Ok(QuickTabCommand::ClearAll {
                container_id: body.get("containerId").and_then(|v| v.as_str()).map(str::to_string),
            }),
            Operation::BatchUpdate => decode_batch(body),
            other => Err(HandlerError::InvalidPayload(format!("{} is not a mutation", other))),
        }
    }
}

fn decode_batch(body: &Map<String, Value>) -> Result<QuickTabCommand, HandlerError> {
    let entries = body
        .get("operations")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerError::InvalidPayload("batchUpdate: missing operations array".to_string()))?;

    let mut operations = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let entry_body = entry
            .as_object()
            .ok_or_else(|| HandlerError::InvalidPayload(format!("batchUpdate: entry {} is not an object", index)))?;
        let name = entry_body
            .get("operation")
            .or_else(|| entry_body.get("action"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::InvalidPayload(format!("batchUpdate: entry {} has no operation", index)))?;
        let operation = Operation::from_name(name)
            .filter(|op| op.requires_ownership() && *op != Operation::BatchUpdate)
            .ok_or_else(|| {
                HandlerError::InvalidPayload(format!("batchUpdate: entry {} has unsupported operation '{}'", index, name))
            })?;
        operations.push(QuickTabCommand::decode(operation, entry_body)?);
    }

    let mut clock = BTreeMap::new();
    if let Some(raw_clock) = body.get("clock").or_else(|| body.get("vectorClock")) {
        let map = raw_clock
            .as_object()
            .ok_or_else(|| HandlerError::InvalidPayload("batchUpdate: clock must be an object".to_string()))?;
        for (peer, counter) in map {
            let peer_id = peer
                .parse::<u64>()
                .map(PeerId)
                .map_err(|_| HandlerError::InvalidPayload(format!("batchUpdate: invalid clock peer '{}'", peer)))?;
            let counter = counter
                .as_u64()
                .ok_or_else(|| HandlerError::InvalidPayload(format!("batchUpdate: invalid clock value for '{}'", peer)))?;
            clock.insert(peer_id, counter);
        }
    }

    Ok(QuickTabCommand::Batch { operations, clock })
}

fn require_id(body: &Map<String, Value>) -> Result<String, HandlerError> {
    body.get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| HandlerError::InvalidPayload("missing id".to_string()))
}

fn require_i32(body: &Map<String, Value>, field: &str) -> Result<i32, HandlerError> {
    let value = body
        .get(field)
        .ok_or_else(|| HandlerError::InvalidPayload(format!("missing {}", field)))?;
    let number = value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
        .ok_or_else(|| HandlerError::InvalidPayload(format!("{} must be a number", field)))?;
    i32::try_from(number).map_err(|_| HandlerError::InvalidPayload(format!("{} out of range", field)))
}

fn optional_i32(body: &Map<String, Value>, field: &str) -> Result<Option<i32>, HandlerError> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => require_i32(body, field).map(Some),
    }
}

fn require_dimension(body: &Map<String, Value>, field: &str) -> Result<u32, HandlerError> {
    let value = require_i32(body, field)?;
    if value <= 0 {
        return Err(HandlerError::InvalidPayload(format!("{} must be greater than zero", field)));
    }
    Ok(value as u32)
}

fn optional_peer(body: &Map<String, Value>, field: &str) -> Result<Option<PeerId>, HandlerError> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => parse_peer_id(value)
            .map(Some)
            .ok_or_else(|| HandlerError::InvalidPayload(format!("{} must be a peer id", field))),
    }
}

fn flag(body: &Map<String, Value>, field: &str) -> bool {
    body.get(field).and_then(|v| v.as_bool()).unwrap_or(false)
}
