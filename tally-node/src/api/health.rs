//! Health and lifecycle endpoints.
//!
//! - `/health` – reports the node's uid and lifecycle status.
//! - `/shutdown` – starts the shutdown drain.
//!
//! The health endpoint includes a `Cache-Control: no-cache` header to
//! prevent caching of responses.

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, header},
    routing::{get, post},
};
use tally_types::api::{HealthResponse, ShutdownResponse};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::api::AppState;

/// Create a router containing the health and shutdown endpoints.
pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/shutdown", post(shutdown))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
}

/// General health check endpoint.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_owned(),
        node_id: state.uid,
        node_status: *state.status.read(),
    })
}

/// Begins the shutdown drain and acknowledges.
async fn shutdown(State(state): State<AppState>) -> Json<ShutdownResponse> {
    tracing::info!("node {} received shutdown request", state.uid);
    state.cancellation_token.cancel();
    Json(ShutdownResponse {
        status: "shutting_down".to_owned(),
        node_id: state.uid,
    })
}
