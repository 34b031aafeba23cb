//! Throughput and loss tracking on the subscriber side
//!
//! Each publisher instance gets its own sequence tracker the first time one
//! of its samples arrives. The tracker tolerates reordering and duplicates:
//! a gap is counted as lost when it is first observed and forgiven if the
//! missing sample arrives later, so the final loss count only depends on
//! which sequence numbers were delivered, not on their order.
//!
//! Counters are kept for the whole run; each payload size and each
//! reporting interval is measured as a delta against a baseline snapshot.

use crate::envelope::SampleEnvelope;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

/// Upper bound on remembered gaps per publisher. Beyond it the oldest gap
/// is forgotten and a late fill of it is treated as a duplicate.
pub const MAX_TRACKED_GAPS: usize = 4096;

/// How a received sequence number related to the stream so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// First sample ever seen from this publisher.
    First,
    /// Exactly the expected sequence number.
    InOrder,
    /// Jumped ahead; this many samples are now considered lost.
    Gap(u64),
    /// Filled a previously recorded gap.
    LateFill,
    /// Already seen or too old to place.
    Duplicate,
    /// Older than anything seen so far; the skipped range is lost.
    Rewound(u64),
}

/// Per-publisher expected-next-sequence state.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    expected: u64,
    base: u64,
    lost: u64,
    /// Missing ranges as `start -> end` (exclusive).
    gaps: BTreeMap<u64, u64>,
}

impl SequenceTracker {
    fn new(first: u64) -> Self {
        Self {
            expected: first.saturating_add(1),
            base: first,
            lost: 0,
            gaps: BTreeMap::new(),
        }
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    fn observe(&mut self, seq: u64) -> SequenceOutcome {
        if seq == self.expected {
            self.expected = self.expected.saturating_add(1);
            return SequenceOutcome::InOrder;
        }

        if seq > self.expected {
            let missing = seq - self.expected;
            self.remember_gap(self.expected, seq);
            self.lost += missing;
            self.expected = seq.saturating_add(1);
            return SequenceOutcome::Gap(missing);
        }

        if seq < self.base {
            let missing = self.base - seq - 1;
            if missing > 0 {
                self.remember_gap(seq.saturating_add(1), self.base);
            }
            self.lost += missing;
            self.base = seq;
            return SequenceOutcome::Rewound(missing);
        }

        if self.fill_gap(seq) {
            self.lost = self.lost.saturating_sub(1);
            SequenceOutcome::LateFill
        } else {
            SequenceOutcome::Duplicate
        }
    }

    fn remember_gap(&mut self, start: u64, end: u64) {
        self.gaps.insert(start, end);
        while self.gaps.len() > MAX_TRACKED_GAPS {
            let oldest = self.gaps.keys().next().copied();
            match oldest {
                Some(key) => {
                    self.gaps.remove(&key);
                }
                None => break,
            }
        }
    }

    fn fill_gap(&mut self, seq: u64) -> bool {
        let (start, end) = match self.gaps.range(..=seq).next_back() {
            Some((&start, &end)) if seq < end => (start, end),
            _ => return false,
        };
        self.gaps.remove(&start);
        if start < seq {
            self.gaps.insert(start, seq);
        }
        let next = seq.saturating_add(1);
        if next < end {
            self.gaps.insert(next, end);
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputTotals {
    pub samples: u64,
    pub bytes: u64,
    pub lost: u64,
    pub duplicates: u64,
}

/// One interval throughput report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputInterval {
    pub data_length: usize,
    /// Samples received so far for the current size.
    pub total_samples: u64,
    pub samples_per_sec: u64,
    pub ave_samples_per_sec: f64,
    pub mbps: f64,
    pub ave_mbps: f64,
    pub lost_samples: u64,
    pub lost_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
}

/// Per-size throughput summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSummary {
    pub data_length: usize,
    pub total_samples: u64,
    pub elapsed_us: u64,
    pub ave_samples_per_sec: f64,
    pub ave_mbps: f64,
    pub lost_samples: u64,
    pub lost_percent: f64,
    /// Mean process CPU load over the size, when CPU monitoring is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
}

#[derive(Debug, Clone)]
struct SizeWindow {
    data_length: usize,
    started: Instant,
    baseline: ThroughputTotals,
    last_tick: Instant,
    last_tick_totals: ThroughputTotals,
    ave_count: u64,
    ave_samples_per_sec: f64,
    ave_bytes_per_sec: f64,
}

/// Subscriber-side throughput state for a whole run.
#[derive(Debug, Default)]
pub struct ThroughputTracker {
    streams: HashMap<i32, SequenceTracker>,
    totals: ThroughputTotals,
    /// Loss owed by publishers that were retired mid-run.
    retired_lost: u64,
    window: Option<SizeWindow>,
}

fn lost_percent(lost: u64, received: u64) -> f64 {
    let expected = lost + received;
    if expected == 0 {
        0.0
    } else {
        lost as f64 * 100.0 / expected as f64
    }
}

fn per_second(amount: u64, elapsed: Duration) -> f64 {
    amount as f64 * 1_000_000.0 / elapsed.as_micros() as f64
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a received data envelope into the run.
    pub fn record(&mut self, envelope: &SampleEnvelope) -> SequenceOutcome {
        self.totals.samples += 1;
        self.totals.bytes += envelope.sample_length() as u64;

        let outcome = match self.streams.get_mut(&envelope.entity_id) {
            Some(stream) => stream.observe(envelope.sequence_number),
            None => {
                debug!(
                    "First sample from publisher {} (seq {})",
                    envelope.entity_id, envelope.sequence_number
                );
                self.streams.insert(
                    envelope.entity_id,
                    SequenceTracker::new(envelope.sequence_number),
                );
                SequenceOutcome::First
            }
        };

        if outcome == SequenceOutcome::Duplicate {
            self.totals.duplicates += 1;
        }
        self.totals.lost = self.current_lost();
        outcome
    }

    fn current_lost(&self) -> u64 {
        self.retired_lost + self.streams.values().map(|s| s.lost).sum::<u64>()
    }

    /// Drop the per-publisher state for a publisher that went away.
    /// Its loss stays in the run totals.
    pub fn retire(&mut self, entity_id: i32) {
        if let Some(stream) = self.streams.remove(&entity_id) {
            debug!(
                "Retiring publisher {} (expected {}, lost {})",
                entity_id, stream.expected, stream.lost
            );
            self.retired_lost += stream.lost;
        }
    }

    pub fn stream(&self, entity_id: i32) -> Option<&SequenceTracker> {
        self.streams.get(&entity_id)
    }

    pub fn totals(&self) -> ThroughputTotals {
        self.totals
    }

    pub fn current_size(&self) -> Option<usize> {
        self.window.as_ref().map(|w| w.data_length)
    }

    /// Start measuring a new payload size at `now`.
    pub fn begin_size(&mut self, data_length: usize, now: Instant) {
        self.window = Some(SizeWindow {
            data_length,
            started: now,
            baseline: self.totals,
            last_tick: now,
            last_tick_totals: self.totals,
            ave_count: 0,
            ave_samples_per_sec: 0.0,
            ave_bytes_per_sec: 0.0,
        });
    }

    /// Close the current interval at `now`.
    ///
    /// Returns `None` when no size is being measured, when nothing arrived
    /// since the last tick, or when no time has elapsed (a clock that did
    /// not advance). In the last case the tick is skipped and the samples
    /// roll into the next interval.
    pub fn interval(&mut self, now: Instant) -> Option<ThroughputInterval> {
        let totals = self.totals;
        let window = self.window.as_mut()?;

        let elapsed = now.saturating_duration_since(window.last_tick);
        if elapsed.as_micros() == 0 {
            return None;
        }

        let samples = totals.samples - window.last_tick_totals.samples;
        if samples == 0 {
            window.last_tick = now;
            return None;
        }
        let bytes = totals.bytes - window.last_tick_totals.bytes;

        let samples_per_sec = per_second(samples, elapsed);
        let bytes_per_sec = per_second(bytes, elapsed);

        window.ave_count += 1;
        window.ave_samples_per_sec +=
            (samples_per_sec - window.ave_samples_per_sec) / window.ave_count as f64;
        window.ave_bytes_per_sec +=
            (bytes_per_sec - window.ave_bytes_per_sec) / window.ave_count as f64;
        window.last_tick = now;
        window.last_tick_totals = totals;

        let size_samples = totals.samples - window.baseline.samples;
        let size_lost = totals.lost.saturating_sub(window.baseline.lost);

        Some(ThroughputInterval {
            data_length: window.data_length,
            total_samples: size_samples,
            samples_per_sec: samples_per_sec as u64,
            ave_samples_per_sec: window.ave_samples_per_sec,
            mbps: bytes_per_sec * 8.0 / 1_000_000.0,
            ave_mbps: window.ave_bytes_per_sec * 8.0 / 1_000_000.0,
            lost_samples: size_lost,
            lost_percent: lost_percent(size_lost, size_samples),
            cpu_percent: None,
        })
    }

    /// Finish the current size and summarize it. `None` if no size is open.
    pub fn close_size(&mut self, now: Instant) -> Option<ThroughputSummary> {
        let window = self.window.take()?;
        let totals = self.totals;

        let elapsed = now.saturating_duration_since(window.started);
        let samples = totals.samples - window.baseline.samples;
        let bytes = totals.bytes - window.baseline.bytes;
        let lost = totals.lost.saturating_sub(window.baseline.lost);

        let (ave_samples_per_sec, ave_mbps) = if elapsed.as_micros() == 0 {
            (0.0, 0.0)
        } else {
            (
                per_second(samples, elapsed),
                per_second(bytes, elapsed) * 8.0 / 1_000_000.0,
            )
        };

        Some(ThroughputSummary {
            data_length: window.data_length,
            total_samples: samples,
            elapsed_us: elapsed.as_micros() as u64,
            ave_samples_per_sec,
            ave_mbps,
            lost_samples: lost,
            lost_percent: lost_percent(lost, samples),
            cpu_percent: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::NOT_A_PING;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn sample(entity: i32, seq: u64) -> SampleEnvelope {
        SampleEnvelope::encode(entity, seq, 0, NOT_A_PING, vec![0; 64])
    }

    fn feed(tracker: &mut ThroughputTracker, entity: i32, seqs: &[u64]) {
        for &seq in seqs {
            tracker.record(&sample(entity, seq));
        }
    }

    #[test]
    fn test_reorder_is_not_loss() {
        let mut tracker = ThroughputTracker::new();
        feed(&mut tracker, 0, &[0, 1, 3, 2, 4]);
        assert_eq!(tracker.totals().samples, 5);
        assert_eq!(tracker.totals().lost, 0);
        assert_eq!(tracker.stream(0).unwrap().expected(), 5);
    }

    #[test]
    fn test_gaps_are_counted() {
        let mut tracker = ThroughputTracker::new();
        let outcomes: Vec<_> = [0, 2, 5]
            .iter()
            .map(|&s| tracker.record(&sample(0, s)))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                SequenceOutcome::First,
                SequenceOutcome::Gap(1),
                SequenceOutcome::Gap(2)
            ]
        );
        assert_eq!(tracker.totals().lost, 3);
    }

    #[test]
    fn test_duplicates_do_not_change_loss() {
        let mut tracker = ThroughputTracker::new();
        feed(&mut tracker, 0, &[0, 1, 1, 2, 0]);
        assert_eq!(tracker.totals().lost, 0);
        assert_eq!(tracker.totals().duplicates, 2);
    }

    #[test]
    fn test_sequence_numbers_at_the_top_of_the_range() {
        let mut tracker = ThroughputTracker::new();
        let outcomes: Vec<_> = [u64::MAX - 2, u64::MAX, u64::MAX - 1]
            .iter()
            .map(|&s| tracker.record(&sample(0, s)))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                SequenceOutcome::First,
                SequenceOutcome::Gap(1),
                SequenceOutcome::LateFill
            ]
        );
        assert_eq!(tracker.totals().lost, 0);
        assert_eq!(tracker.stream(0).unwrap().expected(), u64::MAX);

        let mut single = ThroughputTracker::new();
        assert_eq!(single.record(&sample(1, u64::MAX)), SequenceOutcome::First);
    }

    #[test]
    fn test_loss_is_order_invariant() {
        let delivered: Vec<u64> = (0..200u64).filter(|s| s % 7 != 3 && s % 11 != 5).collect();
        let max = *delivered.iter().max().unwrap();
        let expected_lost = (max + 1) - delivered.len() as u64;

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let mut order = delivered.clone();
            order.shuffle(&mut rng);
            let mut tracker = ThroughputTracker::new();
            feed(&mut tracker, 0, &order);
            assert_eq!(tracker.totals().lost, expected_lost, "order {:?}", order);
        }
    }

    #[test]
    fn test_publishers_are_tracked_independently() {
        let mut tracker = ThroughputTracker::new();
        feed(&mut tracker, 0, &[0, 1, 2]);
        feed(&mut tracker, 1, &[10, 13]);
        assert_eq!(tracker.stream(0).unwrap().lost(), 0);
        assert_eq!(tracker.stream(1).unwrap().lost(), 2);
        assert_eq!(tracker.totals().lost, 2);

        tracker.retire(1);
        assert!(tracker.stream(1).is_none());
        feed(&mut tracker, 0, &[3]);
        assert_eq!(tracker.totals().lost, 2);
    }

    #[test]
    fn test_zero_elapsed_interval_is_skipped() {
        let mut tracker = ThroughputTracker::new();
        let start = Instant::now();
        tracker.begin_size(100, start);
        feed(&mut tracker, 0, &[0, 1, 2]);

        assert!(tracker.interval(start).is_none());
        // A tick from before the start is treated as zero elapsed.
        assert!(tracker.interval(start - Duration::from_millis(5)).is_none());

        let report = tracker.interval(start + Duration::from_secs(1)).unwrap();
        assert_eq!(report.total_samples, 3);
        assert_eq!(report.samples_per_sec, 3);
        assert_eq!(report.ave_samples_per_sec, 3.0);
    }

    #[test]
    fn test_interval_running_average() {
        let mut tracker = ThroughputTracker::new();
        let start = Instant::now();
        tracker.begin_size(100, start);

        feed(&mut tracker, 0, &[0, 1]);
        tracker.interval(start + Duration::from_secs(1)).unwrap();
        feed(&mut tracker, 0, &[2, 3, 4, 5]);
        let report = tracker.interval(start + Duration::from_secs(2)).unwrap();

        assert_eq!(report.samples_per_sec, 4);
        assert_eq!(report.ave_samples_per_sec, 3.0);
        assert_eq!(report.total_samples, 6);
        // 64 payload + 36 header = 100 bytes per sample.
        assert!((report.mbps - 4.0 * 100.0 * 8.0 / 1e6).abs() < 1e-12);
    }

    #[test]
    fn test_size_summary_uses_deltas() {
        let mut tracker = ThroughputTracker::new();
        let start = Instant::now();

        tracker.begin_size(100, start);
        feed(&mut tracker, 0, &[0, 1, 3]);
        let first = tracker.close_size(start + Duration::from_secs(1)).unwrap();
        assert_eq!(first.total_samples, 3);
        assert_eq!(first.lost_samples, 1);
        assert_eq!(first.ave_samples_per_sec, 3.0);
        assert!((first.lost_percent - 25.0).abs() < 1e-9);

        tracker.begin_size(200, start + Duration::from_secs(1));
        feed(&mut tracker, 0, &[4, 5]);
        let second = tracker.close_size(start + Duration::from_secs(3)).unwrap();
        assert_eq!(second.total_samples, 2);
        assert_eq!(second.lost_samples, 0);
        assert_eq!(second.ave_samples_per_sec, 1.0);

        assert_eq!(tracker.totals().samples, 5);
        assert!(tracker.close_size(start).is_none());
    }
}
