//! Snapshot, apply, rollback, and status endpoints.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::Serialize;

use nettune_core::apply::{ApplyRequest, RollbackRequest};
use nettune_core::state::{SnapshotMeta, SystemState};
use nettune_core::CoreError;

use super::response::{ok, ApiError};
use crate::state::SharedState;

#[derive(Debug, Serialize)]
struct SnapshotCreatedReply {
    snapshot_id: String,
    current_state: SystemState,
}

/// `POST /sys/snapshot`
pub async fn create_snapshot(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let engine = Arc::clone(&state.engine);
    let snapshot = tokio::task::spawn_blocking(move || engine.snapshots().create()).await??;
    Ok(ok(SnapshotCreatedReply {
        snapshot_id: snapshot.id,
        current_state: snapshot.state,
    }))
}

#[derive(Debug, Serialize)]
struct SnapshotsReply {
    snapshots: Vec<SnapshotMeta>,
}

/// `GET /sys/snapshots`
pub async fn list_snapshots(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let engine = Arc::clone(&state.engine);
    let snapshots = tokio::task::spawn_blocking(move || engine.snapshots().list()).await??;
    Ok(ok(SnapshotsReply { snapshots }))
}

/// `GET /sys/snapshot/{id}`
pub async fn get_snapshot(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let engine = Arc::clone(&state.engine);
    let snapshot = tokio::task::spawn_blocking(move || engine.snapshots().get(&id)).await??;
    Ok(ok(snapshot))
}

/// `POST /sys/apply`
pub async fn apply(
    State(state): State<SharedState>,
    payload: Result<Json<ApplyRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|err| ApiError::invalid_request(err.body_text()))?;

    let engine = Arc::clone(&state.engine);
    let result = tokio::task::spawn_blocking(move || engine.apply(&request)).await??;
    Ok(ok(result))
}

/// `POST /sys/rollback`
pub async fn rollback(
    State(state): State<SharedState>,
    payload: Result<Json<RollbackRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|err| ApiError::invalid_request(err.body_text()))?;

    let engine = Arc::clone(&state.engine);
    let result = tokio::task::spawn_blocking(move || {
        let snapshot_id = if request.rollback_last {
            engine
                .snapshots()
                .get_latest()
                .map_err(|err| match err {
                    CoreError::SnapshotNotFound(_) => {
                        CoreError::SnapshotNotFound("no snapshots available".to_string())
                    }
                    other => other,
                })?
                .id
        } else if let Some(id) = request.snapshot_id.clone() {
            id
        } else {
            return Err(CoreError::Validation(
                "either snapshot_id or rollback_last is required".to_string(),
            ));
        };
        engine.rollback(&snapshot_id)
    })
    .await??;
    Ok(ok(result))
}

/// `GET /sys/status`
pub async fn status(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let engine = Arc::clone(&state.engine);
    let status = tokio::task::spawn_blocking(move || engine.status()).await??;
    Ok(ok(status))
}
