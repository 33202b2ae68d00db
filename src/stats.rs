//! Pure statistics over resolved probe samples.
//!
//! Everything here is computed from immutable snapshots; the engine threads
//! only append samples. Empty input yields all-zero stats rather than an
//! error so a 100%-loss run still produces a report.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Descriptive statistics of a delay series.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DelayStats {
    pub count: usize,
    #[serde(with = "humantime_serde")]
    pub mean: Duration,
    #[serde(with = "humantime_serde")]
    pub median: Duration,
    #[serde(with = "humantime_serde")]
    pub std_dev: Duration,
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    #[serde(with = "humantime_serde")]
    pub p95: Duration,
    #[serde(with = "humantime_serde")]
    pub p99: Duration,
}

impl DelayStats {
    /// Compute stats over `samples`. Empty input → all zeros; a single
    /// sample → zero std-dev with all percentiles equal to the value.
    pub fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted: Vec<f64> = samples.iter().map(Duration::as_secs_f64).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let variance = sorted.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;

        Self {
            count: n,
            mean: Duration::from_secs_f64(mean),
            median: Duration::from_secs_f64(percentile(&sorted, 50.0)),
            std_dev: Duration::from_secs_f64(variance.sqrt()),
            min: Duration::from_secs_f64(sorted[0]),
            max: Duration::from_secs_f64(sorted[n - 1]),
            p95: Duration::from_secs_f64(percentile(&sorted, 95.0)),
            p99: Duration::from_secs_f64(percentile(&sorted, 99.0)),
        }
    }

    /// Mean in milliseconds, for log lines and correlation math.
    pub fn mean_ms(&self) -> f64 {
        self.mean.as_secs_f64() * 1000.0
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Absolute successive differences of an RTT series.
pub fn jitter_series(rtts: &[Duration]) -> Vec<Duration> {
    rtts.windows(2)
        .map(|w| {
            if w[1] >= w[0] {
                w[1] - w[0]
            } else {
                w[0] - w[1]
            }
        })
        .collect()
}

/// Aggregate outcome of a probe run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeStatistics {
    pub sent: u64,
    pub received: u64,
    pub timed_out: u64,
    /// Responses whose id matched no pending probe.
    pub mismatches: u64,
    /// Injection ticks skipped because the write arbiter was busy.
    pub skipped_ticks: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Lost / sent; 0.0 when nothing was sent, 1.0 when everything was lost.
    pub loss_rate: f64,
    pub rtt: DelayStats,
    pub jitter: DelayStats,
}

impl ProbeStatistics {
    pub fn loss_percent(&self) -> f64 {
        self.loss_rate * 100.0
    }
}

/// Compute the loss rate from raw counters.
pub fn loss_rate(sent: u64, timed_out: u64) -> f64 {
    if sent == 0 {
        0.0
    } else {
        timed_out as f64 / sent as f64
    }
}

/// Per-declared-size RTT breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerSizeStats {
    pub buckets: BTreeMap<u16, DelayStats>,
}

impl PerSizeStats {
    pub fn from_buckets(samples: &BTreeMap<u16, Vec<Duration>>) -> Self {
        Self {
            buckets: samples
                .iter()
                .map(|(&size, rtts)| (size, DelayStats::from_samples(rtts)))
                .collect(),
        }
    }
}

/// Pearson correlation coefficient; `None` when either series is constant
/// or the lengths differ.
pub fn pearson_correlation(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn empty_samples_give_zero_stats() {
        let stats = DelayStats::from_samples(&[]);
        assert_eq!(stats.count, 0);
        assert_eq!(stats.mean, Duration::ZERO);
        assert_eq!(stats.p99, Duration::ZERO);
    }

    #[test]
    fn single_sample_has_zero_spread() {
        let stats = DelayStats::from_samples(&[ms(42)]);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.mean, ms(42));
        assert_eq!(stats.median, ms(42));
        assert_eq!(stats.min, ms(42));
        assert_eq!(stats.max, ms(42));
        assert_eq!(stats.p95, ms(42));
        assert_eq!(stats.std_dev, Duration::ZERO);
    }

    #[test]
    fn basic_series_stats() {
        let samples: Vec<Duration> = (1..=100).map(ms).collect();
        let stats = DelayStats::from_samples(&samples);
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, ms(1));
        assert_eq!(stats.max, ms(100));
        assert!((stats.mean.as_secs_f64() - 0.0505).abs() < 1e-9);
        assert_eq!(stats.p95, ms(95));
        assert_eq!(stats.p99, ms(99));
    }

    #[test]
    fn jitter_is_absolute_difference() {
        let rtts = [ms(10), ms(14), ms(11), ms(11)];
        assert_eq!(jitter_series(&rtts), vec![ms(4), ms(3), ms(0)]);
        assert!(jitter_series(&[ms(5)]).is_empty());
        assert!(jitter_series(&[]).is_empty());
    }

    #[test]
    fn loss_rate_edge_cases() {
        assert_eq!(loss_rate(0, 0), 0.0);
        assert_eq!(loss_rate(20, 0), 0.0);
        assert_eq!(loss_rate(20, 20), 1.0);
        assert!((loss_rate(20, 5) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn pearson_on_linear_data() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let up = [2.0, 4.0, 6.0, 8.0];
        let down = [8.0, 6.0, 4.0, 2.0];
        assert!((pearson_correlation(&xs, &up).unwrap() - 1.0).abs() < 1e-12);
        assert!((pearson_correlation(&xs, &down).unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn pearson_rejects_degenerate_input() {
        assert!(pearson_correlation(&[1.0], &[2.0]).is_none());
        assert!(pearson_correlation(&[1.0, 2.0], &[5.0, 5.0]).is_none());
        assert!(pearson_correlation(&[1.0, 2.0], &[1.0, 2.0, 3.0]).is_none());
    }

    #[test]
    fn per_size_buckets() {
        let mut samples = BTreeMap::new();
        samples.insert(24u16, vec![ms(10), ms(12)]);
        samples.insert(82u16, vec![ms(20)]);
        let per_size = PerSizeStats::from_buckets(&samples);
        assert_eq!(per_size.buckets.len(), 2);
        assert_eq!(per_size.buckets[&24].count, 2);
        assert_eq!(per_size.buckets[&82].mean, ms(20));
    }
}
