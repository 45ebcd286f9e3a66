//! HTTP response bodies served by every node.

use serde::{Deserialize, Serialize};

use crate::{NodeStatus, NodeUid};

/// Outcome tag of a message acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// The message was accepted.
    Ok,
    /// The message was rejected; `message` carries the reason.
    Error,
}

/// Reply body of `POST /message`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageAck {
    /// Whether the message was accepted.
    pub status: AckStatus,
    /// Human-readable rejection reason, present on errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MessageAck {
    /// An accepting acknowledgement.
    pub fn ok() -> Self {
        Self {
            status: AckStatus::Ok,
            message: None,
        }
    }

    /// A rejecting acknowledgement with a reason.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error,
            message: Some(message.into()),
        }
    }

    /// Returns `true` iff the receiver accepted the message.
    pub fn is_ok(&self) -> bool {
        matches!(self.status, AckStatus::Ok)
    }
}

/// Reply body of `GET /health`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server answers at all.
    pub status: String,
    /// The answering node's uid.
    pub node_id: NodeUid,
    /// The answering node's lifecycle status.
    pub node_status: NodeStatus,
}

/// Reply body of `POST /shutdown`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShutdownResponse {
    /// Always `"shutting_down"`.
    pub status: String,
    /// The node beginning its drain.
    pub node_id: NodeUid,
}
