//! Per-stage latency tracking and analysis
//!
//! A sampled fraction of ticks carries a clock through the pipeline;
//! completed clocks become immutable samples in a bounded ring buffer
//! from which percentile reports and threshold alerts are derived.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Pipeline boundaries a tracked tick is stamped at, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received = 0,
    Queued = 1,
    DecodeStart = 2,
    DecodeEnd = 3,
    StrategyStart = 4,
    StrategyEnd = 5,
    BroadcastStart = 6,
    BroadcastEnd = 7,
}

const STAGE_COUNT: usize = 8;

/// Names of the derived stage durations, in pipeline order
pub const STAGE_NAMES: [&str; 7] = [
    "ingest",
    "raw_queue",
    "decode",
    "decoded_queue",
    "strategy",
    "signal_queue",
    "broadcast",
];

/// Monotonic stage timestamps for one sampled tick
///
/// Created at ingestion, carried through the queues, consumed once by
/// [`LatencyTracker::complete`].
#[derive(Debug, Clone)]
pub struct TickClock {
    marks: [Option<Instant>; STAGE_COUNT],
}

impl TickClock {
    /// Start a clock stamped at `Received`
    pub fn start() -> Self {
        let mut clock = Self {
            marks: [None; STAGE_COUNT],
        };
        clock.marks[Stage::Received as usize] = Some(Instant::now());
        clock
    }

    pub fn mark(&mut self, stage: Stage) {
        self.marks[stage as usize] = Some(Instant::now());
    }

    fn mark_at(&mut self, stage: Stage, at: Instant) {
        self.marks[stage as usize] = Some(at);
    }

    /// Derive per-stage durations
    ///
    /// Timestamps are monotonic and stage-ordered, so every duration is
    /// `end - start >= 0` by construction. A stage the tick never
    /// reached (a tick that produced no signal skips the broadcast
    /// boundaries) contributes zero.
    fn into_sample(self) -> Option<LatencySample> {
        let first = self.marks.iter().flatten().next().copied()?;
        let mut stages = [Duration::ZERO; STAGE_NAMES.len()];
        let mut previous = first;
        let mut last = first;
        for (i, mark) in self.marks.iter().enumerate().skip(1) {
            let at = mark.unwrap_or(previous);
            stages[i - 1] = at.saturating_duration_since(previous);
            previous = at;
            last = last.max(at);
        }
        Some(LatencySample {
            stages,
            total: last.saturating_duration_since(first),
        })
    }
}

/// Immutable derived timings for one completed tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    /// Durations indexed like [`STAGE_NAMES`]
    pub stages: [Duration; STAGE_NAMES.len()],
    pub total: Duration,
}

/// Summary statistics for one stage
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageStats {
    pub mean_ms: f64,
    pub stdev_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Percentile/mean report over the current ring buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyReport {
    pub samples: usize,
    pub total: StageStats,
    /// Keyed by [`STAGE_NAMES`] order
    pub stages: Vec<(String, StageStats)>,
    /// Stage whose share of total latency exceeds the contribution
    /// threshold, else "balanced"
    pub dominant_stage: String,
    pub threshold_violations: u64,
}

/// Tracker configuration
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Track one in every N ticks; 0 disables sampling entirely
    pub sample_rate: u64,
    pub ring_capacity: usize,
    pub alert_threshold: Duration,
    pub alert_cooldown: Duration,
    /// Share of total latency above which a stage is called dominant
    pub dominant_share: f64,
}

/// Records sampled tick clocks and serves latency reports
#[derive(Debug)]
pub struct LatencyTracker {
    config: TrackerConfig,
    tick_counter: AtomicU64,
    ring: Mutex<VecDeque<LatencySample>>,
    violations: AtomicU64,
    last_alert: Mutex<Option<Instant>>,
}

impl LatencyTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let capacity = config.ring_capacity;
        Self {
            config,
            tick_counter: AtomicU64::new(0),
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            violations: AtomicU64::new(0),
            last_alert: Mutex::new(None),
        }
    }

    /// Decide once, at ingestion, whether this tick is tracked
    pub fn sample_clock(&self) -> Option<TickClock> {
        if self.config.sample_rate == 0 {
            return None;
        }
        let n = self.tick_counter.fetch_add(1, Ordering::Relaxed);
        (n % self.config.sample_rate == 0).then(TickClock::start)
    }

    /// Finish a tracked tick: derive its sample, store it, check the
    /// alert threshold
    pub fn complete(&self, clock: TickClock) {
        let Some(sample) = clock.into_sample() else {
            return;
        };

        if sample.total >= self.config.alert_threshold {
            self.violations.fetch_add(1, Ordering::Relaxed);
            self.maybe_alert(sample.total);
        }

        let mut ring = self.ring.lock().expect("latency ring poisoned");
        if ring.len() >= self.config.ring_capacity {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    /// Rate-limited threshold warning; the violation counter runs
    /// regardless of whether the warning was emitted
    fn maybe_alert(&self, total: Duration) {
        let mut last = self.last_alert.lock().expect("alert gate poisoned");
        let due = last.map_or(true, |at| at.elapsed() >= self.config.alert_cooldown);
        if due {
            *last = Some(Instant::now());
            warn!(
                total_ms = total.as_millis() as u64,
                threshold_ms = self.config.alert_threshold.as_millis() as u64,
                violations = self.violations.load(Ordering::Relaxed),
                "End-to-end latency above threshold"
            );
        }
    }

    pub fn threshold_violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Mean end-to-end latency over the current ring, in milliseconds
    pub fn mean_total_ms(&self) -> f64 {
        let ring = self.ring.lock().expect("latency ring poisoned");
        if ring.is_empty() {
            return 0.0;
        }
        let sum: f64 = ring.iter().map(|s| duration_ms(s.total)).sum();
        sum / ring.len() as f64
    }

    /// Percentile/mean/stdev report plus dominant-stage classification
    pub fn report(&self) -> LatencyReport {
        let ring = self.ring.lock().expect("latency ring poisoned");
        let samples: Vec<LatencySample> = ring.iter().copied().collect();
        drop(ring);

        let total_values: Vec<f64> = samples.iter().map(|s| duration_ms(s.total)).collect();
        let total = stage_stats(&total_values);

        let mut stages = Vec::with_capacity(STAGE_NAMES.len());
        for (i, name) in STAGE_NAMES.iter().enumerate() {
            let values: Vec<f64> = samples.iter().map(|s| duration_ms(s.stages[i])).collect();
            stages.push((name.to_string(), stage_stats(&values)));
        }

        let dominant_stage = dominant(&stages, total.mean_ms, self.config.dominant_share);

        LatencyReport {
            samples: samples.len(),
            total,
            stages,
            dominant_stage,
            threshold_violations: self.threshold_violations(),
        }
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn stage_stats(values: &[f64]) -> StageStats {
    if values.is_empty() {
        return StageStats::default();
    }

    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;

    let mut sorted: Vec<OrderedFloat<f64>> =
        values.iter().map(|v| OrderedFloat(*v)).collect();
    sorted.sort();

    StageStats {
        mean_ms: mean,
        stdev_ms: variance.sqrt(),
        p50_ms: percentile(&sorted, 0.50),
        p90_ms: percentile(&sorted, 0.90),
        p95_ms: percentile(&sorted, 0.95),
        p99_ms: percentile(&sorted, 0.99),
    }
}

fn percentile(sorted: &[OrderedFloat<f64>], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[rank.min(sorted.len() - 1)].into_inner()
}

fn dominant(stages: &[(String, StageStats)], total_mean: f64, share: f64) -> String {
    if total_mean <= 0.0 {
        return "balanced".to_string();
    }
    stages
        .iter()
        .max_by_key(|(_, s)| OrderedFloat(s.mean_ms))
        .filter(|(_, s)| s.mean_ms / total_mean > share)
        .map(|(name, _)| name.clone())
        .unwrap_or_else(|| "balanced".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(sample_rate: u64, threshold: Duration) -> TrackerConfig {
        TrackerConfig {
            sample_rate,
            ring_capacity: 16,
            alert_threshold: threshold,
            alert_cooldown: Duration::from_secs(10),
            dominant_share: 0.3,
        }
    }

    fn clock_with_offsets(offsets_ms: [u64; 8]) -> TickClock {
        let base = Instant::now();
        let mut clock = TickClock {
            marks: [None; STAGE_COUNT],
        };
        for (i, offset) in offsets_ms.iter().enumerate() {
            clock.marks[i] = Some(base + Duration::from_millis(*offset));
        }
        clock
    }

    #[test]
    fn test_sample_durations_non_negative_and_total_exact() {
        let clock = clock_with_offsets([0, 1, 3, 8, 10, 45, 46, 50]);
        let sample = clock.into_sample().unwrap();

        assert_eq!(sample.total, Duration::from_millis(50));
        let sum: Duration = sample.stages.iter().sum();
        assert_eq!(sum, sample.total);
        assert_eq!(sample.stages[2], Duration::from_millis(5)); // decode
        assert_eq!(sample.stages[4], Duration::from_millis(35)); // strategy
    }

    #[test]
    fn test_unreached_stage_contributes_zero() {
        let base = Instant::now();
        let mut clock = TickClock {
            marks: [None; STAGE_COUNT],
        };
        clock.mark_at(Stage::Received, base);
        clock.mark_at(Stage::Queued, base + Duration::from_millis(1));
        clock.mark_at(Stage::DecodeStart, base + Duration::from_millis(2));
        clock.mark_at(Stage::DecodeEnd, base + Duration::from_millis(4));
        clock.mark_at(Stage::StrategyStart, base + Duration::from_millis(5));
        clock.mark_at(Stage::StrategyEnd, base + Duration::from_millis(9));

        let sample = clock.into_sample().unwrap();
        assert_eq!(sample.total, Duration::from_millis(9));
        assert_eq!(sample.stages[5], Duration::ZERO); // signal_queue
        assert_eq!(sample.stages[6], Duration::ZERO); // broadcast
    }

    #[test]
    fn test_sampling_one_in_n() {
        let tracker = LatencyTracker::new(config(4, Duration::from_secs(1)));
        let tracked: usize = (0..16)
            .filter(|_| tracker.sample_clock().is_some())
            .count();
        assert_eq!(tracked, 4);
    }

    #[test]
    fn test_sampling_disabled() {
        let tracker = LatencyTracker::new(config(0, Duration::from_secs(1)));
        assert!(tracker.sample_clock().is_none());
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut cfg = config(1, Duration::from_secs(3600));
        cfg.ring_capacity = 4;
        let tracker = LatencyTracker::new(cfg);

        for i in 0..10 {
            tracker.complete(clock_with_offsets([0, 0, 0, 0, 0, 0, 0, i]));
        }

        let report = tracker.report();
        assert_eq!(report.samples, 4);
        // Oldest evicted: remaining totals are 6..9 ms
        assert!(report.total.mean_ms >= 6.0);
    }

    #[test]
    fn test_violation_counter_runs_despite_cooldown() {
        let tracker = LatencyTracker::new(config(1, Duration::ZERO));
        for _ in 0..5 {
            tracker.complete(clock_with_offsets([0, 0, 0, 0, 0, 0, 0, 1]));
        }
        // One warning at most inside the cooldown window, five violations
        assert_eq!(tracker.threshold_violations(), 5);
    }

    #[test]
    fn test_report_percentiles_and_dominant() {
        let tracker = LatencyTracker::new(config(1, Duration::from_secs(3600)));
        for _ in 0..10 {
            // Strategy dominates: 8 of 10 ms
            tracker.complete(clock_with_offsets([0, 1, 1, 2, 2, 10, 10, 10]));
        }

        let report = tracker.report();
        assert_eq!(report.samples, 10);
        assert!((report.total.p99_ms - 10.0).abs() < 0.5);
        assert_eq!(report.dominant_stage, "strategy");
    }

    #[test]
    fn test_balanced_classification() {
        let tracker = LatencyTracker::new(config(1, Duration::from_secs(3600)));
        // Every stage contributes ~equally (1ms each over 7 stages)
        tracker.complete(clock_with_offsets([0, 1, 2, 3, 4, 5, 6, 7]));

        let report = tracker.report();
        assert_eq!(report.dominant_stage, "balanced");
    }

    #[test]
    fn test_empty_report() {
        let tracker = LatencyTracker::new(config(1, Duration::from_secs(1)));
        let report = tracker.report();
        assert_eq!(report.samples, 0);
        assert_eq!(report.dominant_stage, "balanced");
        assert_eq!(report.total.mean_ms, 0.0);
    }
}
