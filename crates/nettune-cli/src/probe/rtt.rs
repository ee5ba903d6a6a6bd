//! RTT measurement: serial echo round trips.

use std::time::Instant;

use serde::Serialize;

use super::stats::{jitter, Stats};
use crate::client::{ApiClient, ClientError};

/// Default number of echo round trips.
const DEFAULT_COUNT: usize = 20;

/// RTT probe outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RttResult {
    /// Round trips that completed.
    pub count: usize,
    /// Round-trip time statistics in milliseconds.
    pub rtt: Stats,
    /// Mean absolute deviation from the mean RTT.
    pub jitter_ms: f64,
}

/// Performs `count` serial echoes, each a complete HTTP round trip.
pub fn measure(client: &ApiClient, count: usize) -> Result<RttResult, ClientError> {
    let count = if count == 0 { DEFAULT_COUNT } else { count };

    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        let started = Instant::now();
        client.echo()?;
        samples.push(started.elapsed().as_secs_f64() * 1000.0);
    }

    // count >= 1, so the statistics always exist.
    let rtt = Stats::from_samples(&samples).expect("non-empty sample set");
    Ok(RttResult {
        count: samples.len(),
        rtt,
        jitter_ms: jitter(&samples),
    })
}
