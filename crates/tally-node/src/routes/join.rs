//! Join endpoint.
//!
//! The leader admits the caller as a voter. Any other started node relays
//! the request to the leader it knows of, once.

use axum::{
    body::Bytes,
    extract::{Query, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde::Deserialize;
use tally_raft::JoinPlan;

use crate::error::AppError;
use crate::AppState;

/// Marks a join request relayed by a follower.
pub const FORWARDED_HEADER: &str = "x-tally-forwarded";

/// Join routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/join", post(handle_join))
}

/// Query parameters for `/join`.
#[derive(Debug, Default, Deserialize)]
pub struct JoinParams {
    /// Node identifier of the joiner.
    pub id: Option<String>,
    /// Raft address of the joiner.
    pub addr: Option<String>,
    /// Admin address of the joiner. Derived from `id` when absent.
    pub http: Option<String>,
}

fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

async fn handle_join(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Query(params): Query<JoinParams>,
) -> Result<Response, AppError> {
    let (Some(id), Some(addr)) = (required(params.id), required(params.addr)) else {
        return Err(AppError::BadRequest("missing params".to_string()));
    };

    let cluster = state.context.cluster()?;

    if !cluster.is_leader() {
        if headers.contains_key(FORWARDED_HEADER) {
            return Err(AppError::Unavailable(
                "forwarded join reached a non-leader".to_string(),
            ));
        }
        let Some((_, leader)) = cluster.current_leader() else {
            return Err(AppError::Unavailable("no leader found".to_string()));
        };
        return forward(&state, &leader.http_addr, raw_query.as_deref().unwrap_or("")).await;
    }

    let http = required(params.http)
        .or_else(|| state.context.config().scheme.admin_addr(&id))
        .ok_or_else(|| AppError::BadRequest(format!("no admin address known for {id}")))?;

    let plan = cluster.join_voter(&id, &addr, &http).await?;
    let message = match plan {
        JoinPlan::AlreadyVoter => format!("{id} is already a voter\n"),
        JoinPlan::Promote(_) => format!("{id} promoted to voter\n"),
        JoinPlan::Replace { .. } => format!("{id} re-admitted at {addr}\n"),
        JoinPlan::Add => format!("{id} joined as voter\n"),
    };
    tracing::info!(node = %id, raft_addr = %addr, ?plan, "join handled");

    Ok((StatusCode::OK, message).into_response())
}

/// Relay the join to `leader` and pass its answer through.
async fn forward(state: &AppState, leader: &str, query: &str) -> Result<Response, AppError> {
    tracing::info!(leader = %leader, "forwarding join to leader");

    let response = state
        .http
        .post(format!("http://{leader}/join?{query}"))
        .header(FORWARDED_HEADER, state.context.identity().node_id.as_str())
        .timeout(state.context.config().join_timeout)
        .send()
        .await
        .map_err(|e| AppError::BadGateway(format!("failed to forward join to leader: {e}")))?;

    let status = StatusCode::from_u16(response.status().as_u16())
        .map_err(|e| AppError::BadGateway(e.to_string()))?;
    let body: Bytes = response
        .bytes()
        .await
        .map_err(|e| AppError::BadGateway(format!("failed to read leader response: {e}")))?;

    Ok((status, body).into_response())
}
