//! Bearer authentication middleware.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use super::response::ApiError;
use crate::state::SharedState;

/// Verifies `Authorization: Bearer <key>` with a constant-time comparison
/// so the key cannot be recovered through response timing.
pub async fn require_bearer(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let Some(header) = header else {
        return ApiError::unauthorized("missing authorization header").into_response();
    };

    let Some(presented) = header.strip_prefix("Bearer ") else {
        return ApiError::unauthorized("invalid authorization header format").into_response();
    };

    // Slice ct_eq is length-guarded and constant-time over the contents.
    if !bool::from(presented.as_bytes().ct_eq(state.api_key.as_bytes())) {
        return ApiError::unauthorized("invalid api key").into_response();
    }

    next.run(request).await
}
