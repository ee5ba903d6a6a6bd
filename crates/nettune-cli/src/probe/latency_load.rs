//! Latency-under-load: echo sampling while download workers saturate the
//! path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use super::rtt;
use super::stats::Stats;
use crate::client::{ApiClient, ClientError};

/// Echo round trips used for the unloaded baseline.
const BASELINE_SAMPLES: usize = 20;

/// Size of each load-generating download.
const LOAD_CHUNK_BYTES: u64 = 10 * 1024 * 1024;

const DEFAULT_DURATION_SEC: u64 = 10;
const DEFAULT_LOAD_PARALLEL: usize = 4;
const DEFAULT_ECHO_INTERVAL_MS: u64 = 100;

/// Latency-under-load probe outcome.
#[derive(Debug, Clone, Serialize)]
pub struct LatencyUnderLoadResult {
    /// RTT statistics without load.
    pub baseline: Stats,
    /// RTT statistics while the load workers ran; `None` when no echo
    /// completed inside the window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub under_load: Option<Stats>,
    /// Echo samples collected under load.
    pub samples: usize,
    /// Load throughput over the window in Mbps.
    pub load_mbps: f64,
    /// Length of the load window.
    pub load_duration_ms: u64,
    /// p50 under load divided by baseline p50.
    pub inflation_p50: f64,
    /// p99 under load divided by baseline p99.
    pub inflation_p99: f64,
}

/// Measures a baseline RTT, then samples RTT while `load_parallel` workers
/// loop fixed-size downloads for `duration_sec`. Workers share a
/// cancellation flag armed when the window closes.
pub fn measure(
    client: &ApiClient,
    duration_sec: u64,
    load_parallel: usize,
    echo_interval_ms: u64,
) -> Result<LatencyUnderLoadResult, ClientError> {
    let duration_sec = if duration_sec == 0 {
        DEFAULT_DURATION_SEC
    } else {
        duration_sec
    };
    let load_parallel = if load_parallel == 0 {
        DEFAULT_LOAD_PARALLEL
    } else {
        load_parallel
    };
    let echo_interval = Duration::from_millis(if echo_interval_ms == 0 {
        DEFAULT_ECHO_INTERVAL_MS
    } else {
        echo_interval_ms
    });
    let window = Duration::from_secs(duration_sec);

    let baseline = rtt::measure(client, BASELINE_SAMPLES)?;

    let cancel = AtomicBool::new(false);
    let load_bytes = Mutex::new(0u64);
    let samples = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for _ in 0..load_parallel {
            let client = client.clone();
            let cancel = &cancel;
            let load_bytes = &load_bytes;
            scope.spawn(move || {
                while !cancel.load(Ordering::Relaxed) {
                    // Errors are expected while the window closes; the
                    // partial byte count still contributes.
                    match client.download(LOAD_CHUNK_BYTES) {
                        Ok((received, _)) => {
                            *load_bytes
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner) += received;
                        }
                        Err(err) => {
                            debug!(error = %err, "load worker download failed");
                        }
                    }
                }
            });
        }

        {
            let client = client.clone();
            let cancel = &cancel;
            let samples = &samples;
            scope.spawn(move || {
                let deadline = Instant::now() + window;
                while !cancel.load(Ordering::Relaxed) && Instant::now() < deadline {
                    thread::sleep(echo_interval);
                    let started = Instant::now();
                    if client.echo().is_ok() {
                        samples
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .push(started.elapsed().as_secs_f64() * 1000.0);
                    }
                }
            });
        }

        thread::sleep(window);
        cancel.store(true, Ordering::Relaxed);
    });

    let total_bytes = load_bytes
        .into_inner()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let samples = samples
        .into_inner()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let under_load = Stats::from_samples(&samples);

    let (inflation_p50, inflation_p99) = match &under_load {
        Some(loaded) => (
            ratio(loaded.p50, baseline.rtt.p50),
            ratio(loaded.p99, baseline.rtt.p99),
        ),
        None => (0.0, 0.0),
    };

    Ok(LatencyUnderLoadResult {
        baseline: baseline.rtt,
        under_load,
        samples: samples.len(),
        load_mbps: (total_bytes as f64 * 8.0) / duration_sec as f64 / 1_000_000.0,
        load_duration_ms: duration_sec * 1000,
        inflation_p50,
        inflation_p99,
    })
}

fn ratio(loaded: f64, baseline: f64) -> f64 {
    if baseline > 0.0 {
        loaded / baseline
    } else {
        0.0
    }
}
