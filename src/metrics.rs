use serde::{Deserialize, Serialize};

/// Number of one-microsecond histogram buckets. The last bucket collects
/// every observation at or above `HISTOGRAM_BUCKETS - 1`.
pub const HISTOGRAM_BUCKETS: usize = 65_536;

/// Percentiles reported in every latency summary, in percent.
pub const SUMMARY_PERCENTILES: [f64; 5] = [50.0, 90.0, 99.0, 99.99, 99.9999];

/// Fractions are resolved to parts per million before ranking.
const PERCENTILE_SCALE: u128 = 1_000_000;

/// Latency measurement types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyType {
    OneWay,
    RoundTrip,
}

impl LatencyType {
    /// Convert a measured round trip into the reported observation.
    pub fn observe(self, round_trip_us: u64) -> u64 {
        match self {
            LatencyType::OneWay => round_trip_us / 2,
            LatencyType::RoundTrip => round_trip_us,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LatencyType::OneWay => "One-way",
            LatencyType::RoundTrip => "Round-trip",
        }
    }
}

impl std::fmt::Display for LatencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Running aggregation of latency observations in microseconds.
///
/// Keeps count, sum, sum of squares, min and max for the moments, plus a
/// fixed array histogram for percentile extraction. Recording is O(1) and
/// never allocates after construction.
#[derive(Debug, Clone)]
pub struct StatisticsAccumulator {
    buckets: Vec<u64>,
    count: u64,
    sum: u128,
    sum_sq: u128,
    min: u64,
    max: u64,
}

impl Default for StatisticsAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsAccumulator {
    pub fn new() -> Self {
        Self {
            buckets: vec![0; HISTOGRAM_BUCKETS],
            count: 0,
            sum: 0,
            sum_sq: 0,
            min: u64::MAX,
            max: 0,
        }
    }

    /// Fold one observation into the aggregate.
    pub fn record(&mut self, value_us: u64) {
        let bucket = (value_us as usize).min(HISTOGRAM_BUCKETS - 1);
        self.buckets[bucket] += 1;
        self.count += 1;
        self.sum += value_us as u128;
        self.sum_sq += (value_us as u128) * (value_us as u128);
        self.min = self.min.min(value_us);
        self.max = self.max.max(value_us);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Smallest observation, or 0 when nothing was recorded.
    pub fn min(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }

    /// Population standard deviation, clamped at zero against cancellation.
    pub fn stddev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self.sum_sq as f64 / self.count as f64 - mean * mean;
        variance.max(0.0).sqrt()
    }

    /// Value at percentile `p` (0..=100).
    ///
    /// The target rank is `floor(count * p / 100)` computed in integer
    /// arithmetic, clamped to the last observation. The histogram is scanned
    /// from bucket 0 and the first bucket whose cumulative count passes the
    /// rank is returned. Observations that overflowed into the last bucket
    /// report the exact maximum.
    pub fn percentile(&self, p: f64) -> u64 {
        if self.count == 0 {
            return 0;
        }

        let fraction_ppm = (p.clamp(0.0, 100.0) * 10_000.0).round() as u128;
        let rank = (self.count as u128 * fraction_ppm / PERCENTILE_SCALE) as u64;
        let rank = rank.min(self.count - 1);

        let mut cumulative = 0u64;
        for (value, &occupancy) in self.buckets.iter().enumerate() {
            cumulative += occupancy;
            if cumulative > rank {
                if value == HISTOGRAM_BUCKETS - 1 {
                    return self.max;
                }
                return value as u64;
            }
        }
        self.max
    }

    pub fn reset(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = 0);
        self.count = 0;
        self.sum = 0;
        self.sum_sq = 0;
        self.min = u64::MAX;
        self.max = 0;
    }
}

/// One latency interval report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyInterval {
    pub data_length: usize,
    pub latency_us: u64,
    pub mean_us: f64,
    pub stddev_us: f64,
    pub min_us: u64,
    pub max_us: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
}

/// Per-size latency summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub data_length: usize,
    pub latency_type: LatencyType,
    pub count: u64,
    pub mean_us: f64,
    pub stddev_us: f64,
    pub min_us: u64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
    pub p9999_us: u64,
    pub p999999_us: u64,
    /// Rounds abandoned because no echo arrived in time.
    pub lost_rounds: u64,
    /// Observations discarded because the receive time preceded the send time.
    pub clock_anomalies: u64,
    /// Process CPU load in percent, when CPU monitoring is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
}

impl LatencySummary {
    pub fn from_accumulator(
        data_length: usize,
        latency_type: LatencyType,
        stats: &StatisticsAccumulator,
        lost_rounds: u64,
        clock_anomalies: u64,
    ) -> Self {
        let [p50, p90, p99, p9999, p999999] = SUMMARY_PERCENTILES.map(|p| stats.percentile(p));
        Self {
            data_length,
            latency_type,
            count: stats.count(),
            mean_us: stats.mean(),
            stddev_us: stats.stddev(),
            min_us: stats.min(),
            max_us: stats.max(),
            p50_us: p50,
            p90_us: p90,
            p99_us: p99,
            p9999_us: p9999,
            p999999_us: p999999,
            lost_rounds,
            clock_anomalies,
            cpu_percent: None,
        }
    }
}
