use axum::{extract::State, Json};
use tracing::error;

use super::{ApiError, AppState};
use crate::rpc::{dispatch, RpcReply, RpcRequest};

/// `POST /api/v1/rpc`
///
/// Dispatch runs on the blocking pool: several operations wait for
/// training, ranking or ingestion to finish.
pub async fn rpc(
    State(state): State<AppState>,
    Json(request): Json<RpcRequest>,
) -> Result<Json<RpcReply>, ApiError> {
    let manager = state.manager.clone();
    let reply = tokio::task::spawn_blocking(move || dispatch(&manager, &request))
        .await
        .map_err(|e| {
            error!(error = %e, "RPC dispatch task failed");
            ApiError::Internal(format!("dispatch failed: {}", e))
        })?;
    Ok(Json(reply))
}
