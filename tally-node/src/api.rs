//! HTTP surface of a tally node.
//!
//! Every node serves the same three endpoints and organizes them into
//! submodules:
//!
//! - [`errors`] – the error type answered on the request channel.
//! - [`health`] – health and shutdown endpoints (`/health`,
//!   `/shutdown`).
//! - [`message`] – the inter-node message endpoint (`/message`).

use std::sync::Arc;

use axum::Router;
use parking_lot::RwLock;
use tally_types::{NodeStatus, NodeUid};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::services::{coordinator::CoordinatorService, participant::ParticipantService};

pub(crate) mod errors;
pub(crate) mod health;
pub(crate) mod message;

/// The role-specific service behind the message endpoint.
#[derive(Clone)]
pub(crate) enum RoleService {
    Coordinator(CoordinatorService),
    Participant(ParticipantService),
}

/// State shared by all handlers of one node.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) uid: NodeUid,
    pub(crate) status: Arc<RwLock<NodeStatus>>,
    pub(crate) role: RoleService,
    pub(crate) cancellation_token: CancellationToken,
}

impl AppState {
    /// The coordinator service, or a validation error for messages only
    /// coordinators accept.
    pub(crate) fn coordinator(&self) -> Result<&CoordinatorService, errors::Error> {
        match &self.role {
            RoleService::Coordinator(coordinator) => Ok(coordinator),
            RoleService::Participant(_) => Err(errors::Error::Validation(
                "message requires a coordinator node".to_owned(),
            )),
        }
    }
}

/// Builds the router of a node.
pub(crate) fn routes(state: AppState) -> Router {
    Router::new()
        .merge(message::routes())
        .merge(health::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
