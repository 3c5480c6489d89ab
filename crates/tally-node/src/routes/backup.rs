//! Manual backup and restore of the counter.
//!
//! The backup file is independent of the engine's own snapshots: taking a
//! backup never touches them, and a restore only feeds into them through the
//! snapshot it triggers afterwards.

use axum::{extract::State, http::StatusCode, routing::post, Router};

use crate::error::AppError;
use crate::AppState;

/// Backup routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/backup", post(handle_backup))
        .route("/restore", post(handle_restore))
}

async fn handle_backup(
    State(state): State<AppState>,
) -> Result<(StatusCode, &'static str), AppError> {
    let cluster = state.context.cluster()?;
    let path = cluster.config().backup_path();
    let counter = cluster.counter().backup(&path)?;

    tracing::info!(counter, path = %path.display(), "counter backed up");
    Ok((StatusCode::OK, "FSM state backed up"))
}

async fn handle_restore(
    State(state): State<AppState>,
) -> Result<(StatusCode, &'static str), AppError> {
    let cluster = state.context.cluster()?;
    let path = cluster.config().backup_path();
    let counter = cluster.counter().restore(&path)?;

    tracing::info!(counter, path = %path.display(), "counter restored from backup");

    if let Err(e) = cluster.trigger_snapshot().await {
        tracing::warn!(error = %e, "snapshot after restore failed");
    }
    Ok((StatusCode::OK, "FSM state restored from backup"))
}
