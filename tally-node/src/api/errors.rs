//! Error type answered on the `/message` request channel.
//!
//! Validation and state errors are always local: they are answered to
//! the sender with a non-fatal error status and never mutate computation
//! state. The messaging fabric treats these non-2xx replies as
//! deliberate and does not retry them.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tally_core::aggregation::AggregationError;
use tally_types::{ComputationId, NodeUid, api::MessageAck};

/// All errors a message handler can answer with.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// The message is malformed or carries a field that fails
    /// validation.
    #[error("invalid message: {0}")]
    Validation(String),
    /// The referenced computation has no state on this node.
    #[error("unknown computation {0}")]
    UnknownComputation(ComputationId),
    /// The referenced node is not registered.
    #[error("unknown node {0}")]
    UnknownNode(NodeUid),
    /// The message arrived in a state that does not accept it.
    #[error("{0}")]
    State(String),
    /// Storage or other internal failure; fatal for this handler only.
    #[error(transparent)]
    Internal(#[from] eyre::Report),
}

impl From<AggregationError> for Error {
    fn from(err: AggregationError) -> Self {
        match err {
            AggregationError::NotACoordinator { .. }
            | AggregationError::UnknownSecondary(_)
            | AggregationError::UnknownPeer(_) => Error::Validation(err.to_string()),
            AggregationError::ShareNotAccepted(_)
            | AggregationError::RevealNotAccepted(_)
            | AggregationError::PeerSumNotAccepted(_) => Error::State(err.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::UnknownComputation(_) | Error::UnknownNode(_) => StatusCode::NOT_FOUND,
            Error::State(_) => StatusCode::CONFLICT,
            Error::Internal(err) => {
                tracing::error!("internal error while handling message: {err:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status != StatusCode::INTERNAL_SERVER_ERROR {
            tracing::debug!("answering message with {status}: {self}");
        }
        (status, Json(MessageAck::error(self.to_string()))).into_response()
    }
}
