//! Error types for the node.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tally_raft::RaftError;
use thiserror::Error;

/// Code returned while this node has not joined or founded a group yet.
pub const NOT_STARTED: &str = "NOT_STARTED";

/// Fatal node errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Consensus engine error.
    #[error("raft error: {0}")]
    Raft(#[from] RaftError),

    /// Gossip membership error.
    #[error("membership error: {0}")]
    Membership(String),

    /// Admin handlers were registered a second time.
    #[error("consensus already started")]
    AlreadyStarted,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Admin API error type.
#[derive(Debug)]
pub enum AppError {
    /// Missing or malformed request parameters.
    BadRequest(String),
    /// The request must be served by the leader.
    NotLeader(String),
    /// Requested resource does not exist.
    NotFound(String),
    /// Internal server error.
    Internal(String),
    /// Forwarding to another node failed.
    BadGateway(String),
    /// No node can serve the request right now.
    Unavailable(String),
    /// Consensus has not started on this node.
    NotStarted,
    /// Not started, reporting the members this node currently sees.
    Pending(Vec<String>),
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error flag.
    pub error: bool,
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
    /// Visible members, sent with `NOT_STARTED` from `/status`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut members = Vec::new();
        let (status, code, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            AppError::NotLeader(msg) => (StatusCode::BAD_REQUEST, "NOT_LEADER", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "BAD_GATEWAY", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg),
            AppError::NotStarted => (
                StatusCode::SERVICE_UNAVAILABLE,
                NOT_STARTED,
                "consensus not started".to_string(),
            ),
            AppError::Pending(view) => {
                members = view;
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    NOT_STARTED,
                    "consensus not started".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: true,
            code: code.to_string(),
            message,
            members,
        };

        (status, Json(body)).into_response()
    }
}

impl From<RaftError> for AppError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { .. } => AppError::NotLeader("not leader".to_string()),
            RaftError::NoLeader => AppError::Unavailable("no leader found".to_string()),
            RaftError::BackupNotFound(_) => AppError::NotFound(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}
