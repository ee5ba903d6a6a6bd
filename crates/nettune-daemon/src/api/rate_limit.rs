//! Per-client-IP token bucket rate limiting.
//!
//! Each client IP gets `burst` tokens per interval; the bucket refills in
//! full on the first request after the interval elapses. State lives behind
//! one in-process mutex, and idle buckets are swept periodically so spoofed
//! source addresses cannot grow the map without bound.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::response::ApiError;
use crate::state::SharedState;

/// Sweep idle buckets every this many `allow` calls.
const CLEANUP_EVERY: u64 = 4096;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests accepted per interval per client IP.
    pub burst: u32,
    /// Refill interval.
    pub interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // Generous enough that probe echo storms and load workers pass;
        // tight enough to stop brute force against the bearer key.
        Self {
            burst: 300,
            interval: Duration::from_secs(1),
        }
    }
}

struct Bucket {
    tokens: u32,
    last_reset: Instant,
}

/// Token buckets keyed by client IP.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
    calls: AtomicU64,
}

impl RateLimiter {
    /// Creates a limiter with the given configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Whether a request from `ip` is allowed right now.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();

        let calls = self.calls.fetch_add(1, Ordering::Relaxed);
        if calls > 0 && calls % CLEANUP_EVERY == 0 {
            self.cleanup(now);
        }

        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        match buckets.get_mut(&ip) {
            None => {
                buckets.insert(
                    ip,
                    Bucket {
                        tokens: self.config.burst.saturating_sub(1),
                        last_reset: now,
                    },
                );
                true
            }
            Some(bucket) if now.duration_since(bucket.last_reset) >= self.config.interval => {
                bucket.tokens = self.config.burst.saturating_sub(1);
                bucket.last_reset = now;
                true
            }
            Some(bucket) if bucket.tokens > 0 => {
                bucket.tokens -= 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Drops buckets idle for at least two intervals.
    fn cleanup(&self, now: Instant) {
        let horizon = self.config.interval * 2;
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        buckets.retain(|_, bucket| now.duration_since(bucket.last_reset) < horizon);
    }

    #[cfg(test)]
    fn tracked_ips(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

/// Middleware applying the limiter before any authentication work.
pub async fn limit_by_ip(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = addr.ip();
    if !state.limiter.allow(ip) {
        warn!(%ip, "rate limit exceeded");
        return ApiError::rate_limited().into_response();
    }
    next.run(request).await
}
