//! Profile listing and retrieval.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;
use serde::Serialize;

use nettune_core::profile::ProfileMeta;

use super::response::{ok, ApiError};
use crate::state::SharedState;

#[derive(Debug, Serialize)]
struct ProfilesReply {
    profiles: Vec<ProfileMeta>,
}

/// `GET /profiles`
pub async fn list(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let engine = Arc::clone(&state.engine);
    let profiles = tokio::task::spawn_blocking(move || engine.profiles().list()).await??;
    Ok(ok(ProfilesReply { profiles }))
}

/// `GET /profiles/{id}`
pub async fn get(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let engine = Arc::clone(&state.engine);
    let profile = tokio::task::spawn_blocking(move || engine.profiles().get(&id)).await??;
    Ok(ok(profile))
}
