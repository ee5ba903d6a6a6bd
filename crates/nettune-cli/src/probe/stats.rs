//! Sample statistics for latency probes.

use serde::Serialize;

/// Summary statistics over a set of millisecond samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stats {
    /// Smallest sample.
    pub min: f64,
    /// Largest sample.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// 50th percentile (nearest-rank).
    pub p50: f64,
    /// 90th percentile (nearest-rank).
    pub p90: f64,
    /// 99th percentile (nearest-rank).
    pub p99: f64,
}

impl Stats {
    /// Computes statistics over `samples`; `None` when empty.
    #[must_use]
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Some(Self {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean: mean(samples),
            p50: percentile(&sorted, 50.0),
            p90: percentile(&sorted, 90.0),
            p99: percentile(&sorted, 99.0),
        })
    }
}

/// Arithmetic mean; zero for an empty slice.
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Nearest-rank percentile over an ascending-sorted slice.
#[must_use]
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Jitter as mean absolute deviation from the mean.
#[must_use]
pub fn jitter(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mid = mean(values);
    values.iter().map(|v| (v - mid).abs()).sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_over_a_simple_series() {
        let stats = Stats::from_samples(&[10.0, 20.0, 30.0, 40.0, 50.0]).unwrap();
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 50.0);
        assert_eq!(stats.mean, 30.0);
        assert_eq!(stats.p50, 30.0);
    }

    #[test]
    fn stats_of_nothing_is_none() {
        assert!(Stats::from_samples(&[]).is_none());
    }

    #[test]
    fn single_sample_collapses_all_fields() {
        let stats = Stats::from_samples(&[42.0]).unwrap();
        assert_eq!(stats.min, 42.0);
        assert_eq!(stats.max, 42.0);
        assert_eq!(stats.mean, 42.0);
        assert_eq!(stats.p99, 42.0);
    }

    #[test]
    fn nearest_rank_percentiles() {
        let sorted: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 50.0), 5.0);
        assert_eq!(percentile(&sorted, 90.0), 9.0);
        assert_eq!(percentile(&sorted, 99.0), 10.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn jitter_is_zero_for_identical_samples() {
        assert_eq!(jitter(&[10.0, 10.0, 10.0, 10.0]), 0.0);
    }

    #[test]
    fn jitter_is_mean_absolute_deviation() {
        // Mean is 15; deviations are 15, 5, 5, 15 -> mean 10.
        assert_eq!(jitter(&[0.0, 10.0, 20.0, 30.0]), 10.0);
    }

    #[test]
    fn mean_handles_edge_inputs() {
        assert_eq!(mean(&[1.0, 2.0, 3.0, 4.0, 5.0]), 3.0);
        assert_eq!(mean(&[10.0]), 10.0);
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[-5.0, 5.0]), 0.0);
    }
}
