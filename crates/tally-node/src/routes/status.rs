//! Cluster status and health endpoints.

use axum::{extract::State, routing::get, Json, Router};

use crate::error::AppError;
use crate::json::{ClusterState, HealthResponse};
use crate::AppState;

/// Status routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
}

/// Local view of the consensus group.
///
/// Before the node starts, the `NOT_STARTED` answer carries the members
/// this node sees so that peers can tell whether their views agree.
async fn handle_status(State(state): State<AppState>) -> Result<Json<ClusterState>, AppError> {
    if !state.context.is_started() {
        return Err(AppError::Pending(state.context.membership_view()));
    }
    let cluster = state.context.cluster()?;
    Ok(Json(ClusterState::from_cluster(cluster)))
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: state.context.identity().node_id.clone(),
        consensus_started: state.context.is_started(),
    })
}
