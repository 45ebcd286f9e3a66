//! The `/message` endpoint: validation and role dispatch.
//!
//! The body is parsed into the tagged [`Message`] union at the
//! boundary; anything that does not match a known message kind with its
//! required fields is answered as a validation error. Valid messages
//! are dispatched to the role service of this node.

use axum::{Json, Router, extract::State, routing::post};
use tally_types::{
    api::MessageAck,
    message::{Message, MessageBody},
};

use crate::api::{AppState, RoleService, errors::Error};

/// Create a router containing the message endpoint.
pub(crate) fn routes() -> Router<AppState> {
    Router::new().route("/message", post(handle_message))
}

async fn handle_message(
    State(state): State<AppState>,
    Json(raw): Json<serde_json::Value>,
) -> Result<Json<MessageAck>, Error> {
    let message: Message =
        serde_json::from_value(raw).map_err(|err| Error::Validation(err.to_string()))?;
    tracing::debug!("received {} message", message.body.kind());
    match message.body {
        MessageBody::Computation(descriptor) => match &state.role {
            RoleService::Coordinator(coordinator) => {
                coordinator.handle_computation(descriptor).await?
            }
            RoleService::Participant(participant) => {
                participant.handle_computation(descriptor).await?
            }
        },
        MessageBody::Share(payload) => state.coordinator()?.handle_share(payload).await?,
        MessageBody::InitConfirm(payload) => {
            state.coordinator()?.handle_init_confirm(payload).await?
        }
        MessageBody::RevealRequest(payload) => {
            state.coordinator()?.handle_reveal_request(payload).await?
        }
        MessageBody::RevealResponse(payload) => {
            state.coordinator()?.handle_reveal_response(payload).await?
        }
        MessageBody::Shutdown => {
            tracing::info!("node {} received shutdown message", state.uid);
            state.cancellation_token.cancel();
        }
    }
    Ok(Json(MessageAck::ok()))
}
