//! Throughput measurement over parallel connections.

use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use rand::RngCore;
use serde::Serialize;

use crate::client::ApiClient;

/// Default transfer volume when the caller passes zero.
const DEFAULT_BYTES: u64 = 100 * 1024 * 1024;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Server streams to the client.
    Download,
    /// Client streams to the server.
    Upload,
}

/// Throughput probe outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ThroughputResult {
    /// Transfer direction.
    pub direction: Direction,
    /// Total bytes that actually moved.
    pub bytes: u64,
    /// Wall time from first start to last finish.
    pub duration_ms: u64,
    /// Megabits per second over the whole window.
    pub throughput_mbps: f64,
    /// Connections used.
    pub parallel: usize,
    /// Per-connection failures.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Splits `total_bytes` evenly across `parallel` connections, runs them all
/// concurrently, and aggregates the bytes that moved. Per-connection errors
/// are collected, not fatal.
pub fn measure(
    client: &ApiClient,
    direction: Direction,
    total_bytes: u64,
    parallel: usize,
) -> ThroughputResult {
    let total_bytes = if total_bytes == 0 {
        DEFAULT_BYTES
    } else {
        total_bytes
    };
    let parallel = parallel.max(1);
    let per_connection = total_bytes / parallel as u64;

    // Upload payload is generated once and shared; the server only counts
    // bytes, so every connection can push the same buffer.
    let upload_payload = match direction {
        Direction::Upload => {
            let mut data = vec![0u8; usize::try_from(per_connection).unwrap_or(usize::MAX)];
            rand::thread_rng().fill_bytes(&mut data);
            Some(data)
        }
        Direction::Download => None,
    };

    let moved = Mutex::new(0u64);
    let errors = Mutex::new(Vec::new());
    let started = Instant::now();

    thread::scope(|scope| {
        for _ in 0..parallel {
            let client = client.clone();
            let moved = &moved;
            let errors = &errors;
            let upload_payload = upload_payload.as_deref();
            scope.spawn(move || {
                let outcome = match direction {
                    Direction::Download => client.download(per_connection).map(|(bytes, _)| bytes),
                    Direction::Upload => client
                        .upload(upload_payload.unwrap_or_default().to_vec())
                        .map(|reply| reply.received_bytes),
                };
                match outcome {
                    Ok(bytes) => {
                        *moved.lock().unwrap_or_else(std::sync::PoisonError::into_inner) += bytes;
                    }
                    Err(err) => errors
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .push(err.to_string()),
                }
            });
        }
    });

    let duration = started.elapsed();
    let bytes = moved.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner);
    let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

    ThroughputResult {
        direction,
        bytes,
        duration_ms,
        throughput_mbps: mbps(bytes, duration_ms),
        parallel,
        errors: errors.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner),
    }
}

/// Mbps = total bits / total milliseconds / 1000.
fn mbps(bytes: u64, duration_ms: u64) -> f64 {
    (bytes as f64 * 8.0) / duration_ms.max(1) as f64 / 1000.0
}
