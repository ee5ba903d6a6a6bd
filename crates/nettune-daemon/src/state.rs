//! Shared state handed to every handler.

use std::sync::Arc;

use nettune_core::{ApplyEngine, HostAdapter};

use crate::api::rate_limit::RateLimiter;

/// State shared across the router.
pub struct AppState {
    /// The transaction engine and its stores.
    pub engine: Arc<ApplyEngine>,
    /// Host adapters for read-only fact collection.
    pub host: HostAdapter,
    /// Bearer key every request must present.
    pub api_key: String,
    /// Per-client-IP rate limiter.
    pub limiter: RateLimiter,
}

/// The router's state handle.
pub type SharedState = Arc<AppState>;
