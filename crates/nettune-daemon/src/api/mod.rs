//! Router assembly for the nettune HTTP API.

pub mod auth;
pub mod probe;
pub mod profiles;
pub mod rate_limit;
pub mod response;
pub mod system;


use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::state::SharedState;

/// Upload bodies are capped here; download sizes are validated separately.
const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Builds the full router: probe pipes, profile reads, and system
/// endpoints, wrapped in rate limiting (outermost) then bearer auth.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/probe/echo", get(probe::echo))
        .route("/probe/download", get(probe::download))
        .route("/probe/upload", post(probe::upload))
        .route("/probe/info", get(probe::info))
        .route("/profiles", get(profiles::list))
        .route("/profiles/{id}", get(profiles::get))
        .route("/sys/snapshot", post(system::create_snapshot))
        .route("/sys/snapshots", get(system::list_snapshots))
        .route("/sys/snapshot/{id}", get(system::get_snapshot))
        .route("/sys/apply", post(system::apply))
        .route("/sys/rollback", post(system::rollback))
        .route("/sys/status", get(system::status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::limit_by_ip,
        ))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}
