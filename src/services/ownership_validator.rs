// Quick Tabs Ownership Validator
// Confirms a mutation request comes from the peer it claims to. The transport-supplied
// sender id is the only trust anchor; the message body is never trusted on its own.

use serde_json::Value;
use tracing::{debug, warn};

use crate::types::errors::OwnershipError;
use crate::types::message::{origin_claim, InboundMessage, Operation, OriginClaim, SenderContext};
use crate::types::peer::PeerId;

/// Log target for authenticity rejections.
pub const SECURITY_TARGET: &str = "quicktabs::security";

/// Stateless validator for mutation provenance.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnershipValidator;

impl OwnershipValidator {
    pub fn new() -> Self {
        Self
    }

    /// Returns the peer id the operation should be attributed to.
    ///
    /// With `required` set the message must claim an origin equal to the sender.
    /// Without it (administrative operations) the sender id is used directly,
    /// though a claimed origin that disagrees is still rejected. Every entry of
    /// a `batchUpdate` that claims an origin must claim the sender too.
    pub fn validate(
        &self,
        message: &InboundMessage,
        sender: &SenderContext,
        required: bool,
    ) -> Result<PeerId, OwnershipError> {
        let result = Self::check(message, sender, required);
        match &result {
            Ok(peer) => debug!(
                operation = %message.operation,
                peer = %peer,
                "Ownership validated"
            ),
            Err(e) => warn!(
                target: SECURITY_TARGET,
                operation = %message.operation,
                sender = ?sender.peer_id,
                claimed = ?message.origin_claim,
                quick_tab_id = ?message.quick_tab_id,
                reason = %e,
                "Rejected mutation request"
            ),
        }
        result
    }

    fn check(message: &InboundMessage, sender: &SenderContext, required: bool) -> Result<PeerId, OwnershipError> {
        let actual = sender.peer_id.ok_or(OwnershipError::SenderRequired)?;
        match &message.origin_claim {
            Some(claim) => Self::match_claim(claim, actual)?,
            None if required => return Err(OwnershipError::OriginRequired),
            None => {}
        }
        if message.operation == Operation::BatchUpdate {
            let entries = message.body.get("operations").and_then(Value::as_array);
            for entry in entries.into_iter().flatten().filter_map(Value::as_object) {
                if let Some(claim) = origin_claim(entry) {
                    Self::match_claim(&claim, actual)?;
                }
            }
        }
        Ok(actual)
    }

    fn match_claim(claim: &OriginClaim, actual: PeerId) -> Result<(), OwnershipError> {
        match claim {
            OriginClaim::Peer(claimed) if *claimed != actual => Err(OwnershipError::OriginMismatch {
                claimed: *claimed,
                actual,
            }),
            OriginClaim::Peer(_) => Ok(()),
            OriginClaim::Unparsed(raw) => Err(OwnershipError::UnparsedOrigin {
                claimed: raw.clone(),
                actual,
            }),
        }
    }
}
