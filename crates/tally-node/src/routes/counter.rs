//! Counter endpoints.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tally_raft::Command;

use crate::error::AppError;
use crate::json::CounterJson;
use crate::AppState;

/// Counter routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/next", post(handle_next))
        .route("/get", get(handle_get))
}

/// Query parameters for `/next`.
#[derive(Debug, Deserialize)]
pub struct NextParams {
    /// Client-chosen id; a retried id is applied once.
    pub request_id: Option<String>,
}

/// Replicate one increment and return the new value.
async fn handle_next(
    State(state): State<AppState>,
    Query(params): Query<NextParams>,
) -> Result<Json<CounterJson>, AppError> {
    let cluster = state.context.cluster()?;
    if !cluster.is_leader() {
        return Err(AppError::NotLeader("not leader".to_string()));
    }

    let command = Command::increment().with_request_id(params.request_id);
    let response = cluster.apply(command).await?;
    if response.deduplicated {
        tracing::debug!(counter = ?response.value, "replayed request id");
    }

    let counter = response
        .value
        .ok_or_else(|| AppError::Internal("increment produced no value".to_string()))?;
    Ok(Json(CounterJson { counter }))
}

/// Local counter value.
async fn handle_get(State(state): State<AppState>) -> Result<Json<CounterJson>, AppError> {
    let cluster = state.context.cluster()?;
    Ok(Json(CounterJson {
        counter: cluster.counter().value(),
    }))
}
