//! Wire messages exchanged between nodes.
//!
//! Every inter-node message is a JSON object with a `type` tag, a
//! type-specific `payload`, an optional `sender_uid`, and a `timestamp`.
//! The payload of each message kind is an enumerated struct, so required
//! fields are enforced during deserialization and a message with a
//! missing field is rejected at the boundary instead of deep inside a
//! handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ComputationDescriptor, ComputationId, NodeUid};

/// The tagged body of a wire message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageBody {
    /// A computation descriptor, delivered to coordinators and broadcast
    /// to participants.
    Computation(ComputationDescriptor),
    /// A single share from a contributor to one coordinator.
    Share(SharePayload),
    /// A secondary coordinator confirming initialization to the primary.
    InitConfirm(InitConfirmPayload),
    /// The primary asking a secondary for its partial sum.
    RevealRequest(RevealRequestPayload),
    /// A secondary reporting its partial sum to the primary.
    RevealResponse(RevealResponsePayload),
    /// Asks the receiving node to begin its shutdown drain.
    Shutdown,
}

impl MessageBody {
    /// The wire `type` tag of this body, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Computation(_) => "computation",
            MessageBody::Share(_) => "share",
            MessageBody::InitConfirm(_) => "init_confirm",
            MessageBody::RevealRequest(_) => "reveal_request",
            MessageBody::RevealResponse(_) => "reveal_response",
            MessageBody::Shutdown => "shutdown",
        }
    }
}

/// Payload of a `share` message.
///
/// The share value is a ring element; a value outside `[0, 2^32)` fails
/// deserialization and never reaches the aggregation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharePayload {
    /// The computation the share belongs to.
    pub comp_id: ComputationId,
    /// The contributing participant.
    pub sender_uid: NodeUid,
    /// The share value.
    pub share_value: u32,
}

/// Payload of an `init_confirm` message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfirmPayload {
    /// The computation being confirmed.
    pub comp_id: ComputationId,
    /// The confirming secondary coordinator.
    pub sender_uid: NodeUid,
}

/// Payload of a `reveal_request` message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealRequestPayload {
    /// The computation to reveal.
    pub comp_id: ComputationId,
    /// The requesting primary coordinator.
    pub sender_uid: NodeUid,
}

/// Payload of a `reveal_response` message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealResponsePayload {
    /// The computation being revealed.
    pub comp_id: ComputationId,
    /// The responding secondary coordinator.
    pub sender_uid: NodeUid,
    /// The secondary's local sum of received shares, mod 2^32.
    pub partial_sum: u32,
    /// The secondary's local distinct contributor count.
    pub participant_count: u32,
}

/// The full wire envelope: body plus sender and timestamp.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// The tagged message body.
    #[serde(flatten)]
    pub body: MessageBody,
    /// The sending node, if it identifies itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_uid: Option<NodeUid>,
    /// When the sender created the message.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a message from `sender` stamped with the current time.
    pub fn new(body: MessageBody, sender: NodeUid) -> Self {
        Self {
            body,
            sender_uid: Some(sender),
            timestamp: Utc::now(),
        }
    }
}
