//! Pipeline metrics
//!
//! One process-wide instance. Workers bump atomic counters with no
//! shared lock; the health monitor and the /metrics endpoint read
//! point-in-time snapshots.

use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::queue::QueueStats;

/// Monotonic pipeline counters plus queue handles
#[derive(Debug)]
pub struct PipelineMetrics {
    ticks_received: AtomicU64,
    ticks_decoded: AtomicU64,
    ticks_processed: AtomicU64,
    signals_generated: AtomicU64,
    payloads_broadcast: AtomicU64,
    decode_errors: AtomicU64,
    strategy_errors: AtomicU64,
    broadcast_errors: AtomicU64,
    raw_queue: Arc<QueueStats>,
    decoded_queue: Arc<QueueStats>,
    signal_queue: Arc<QueueStats>,
}

/// Point-in-time view of one queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub depth: usize,
    pub capacity: usize,
    pub dropped: u64,
    pub utilization: f64,
}

impl QueueSnapshot {
    fn of(stats: &QueueStats) -> Self {
        Self {
            depth: stats.depth(),
            capacity: stats.capacity(),
            dropped: stats.dropped(),
            utilization: stats.utilization(),
        }
    }
}

/// Point-in-time view of the whole pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub ticks_received: u64,
    pub ticks_decoded: u64,
    pub ticks_processed: u64,
    pub signals_generated: u64,
    pub payloads_broadcast: u64,
    pub decode_errors: u64,
    pub strategy_errors: u64,
    pub broadcast_errors: u64,
    pub raw_queue: QueueSnapshot,
    pub decoded_queue: QueueSnapshot,
    pub signal_queue: QueueSnapshot,
}

impl PipelineMetrics {
    pub fn new(
        raw_queue: Arc<QueueStats>,
        decoded_queue: Arc<QueueStats>,
        signal_queue: Arc<QueueStats>,
    ) -> Self {
        Self {
            ticks_received: AtomicU64::new(0),
            ticks_decoded: AtomicU64::new(0),
            ticks_processed: AtomicU64::new(0),
            signals_generated: AtomicU64::new(0),
            payloads_broadcast: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            strategy_errors: AtomicU64::new(0),
            broadcast_errors: AtomicU64::new(0),
            raw_queue,
            decoded_queue,
            signal_queue,
        }
    }

    pub fn inc_received(&self) {
        self.ticks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_decoded(&self) {
        self.ticks_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_processed(&self) {
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_signals(&self) {
        self.signals_generated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_broadcast(&self) {
        self.payloads_broadcast.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_strategy_errors(&self) {
        self.strategy_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_broadcast_errors(&self) {
        self.broadcast_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks_received: self.ticks_received.load(Ordering::Relaxed),
            ticks_decoded: self.ticks_decoded.load(Ordering::Relaxed),
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            signals_generated: self.signals_generated.load(Ordering::Relaxed),
            payloads_broadcast: self.payloads_broadcast.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            strategy_errors: self.strategy_errors.load(Ordering::Relaxed),
            broadcast_errors: self.broadcast_errors.load(Ordering::Relaxed),
            raw_queue: QueueSnapshot::of(&self.raw_queue),
            decoded_queue: QueueSnapshot::of(&self.decoded_queue),
            signal_queue: QueueSnapshot::of(&self.signal_queue),
        }
    }
}

/// Render a snapshot in Prometheus text exposition format
///
/// Gauges are rebuilt per scrape from the atomic snapshot, so the hot
/// path never touches a registry.
pub fn encode_prometheus(snapshot: &MetricsSnapshot) -> String {
    let registry = Registry::new();

    let counters = [
        ("chainflow_ticks_received_total", snapshot.ticks_received),
        ("chainflow_ticks_decoded_total", snapshot.ticks_decoded),
        ("chainflow_ticks_processed_total", snapshot.ticks_processed),
        ("chainflow_signals_generated_total", snapshot.signals_generated),
        ("chainflow_payloads_broadcast_total", snapshot.payloads_broadcast),
        ("chainflow_decode_errors_total", snapshot.decode_errors),
        ("chainflow_strategy_errors_total", snapshot.strategy_errors),
        ("chainflow_broadcast_errors_total", snapshot.broadcast_errors),
    ];
    for (name, value) in counters {
        set_gauge(&registry, name, value as i64);
    }

    let queues = [
        ("raw", &snapshot.raw_queue),
        ("decoded", &snapshot.decoded_queue),
        ("signal", &snapshot.signal_queue),
    ];
    for (stage, queue) in queues {
        set_gauge(
            &registry,
            &format!("chainflow_{}_queue_depth", stage),
            queue.depth as i64,
        );
        set_gauge(
            &registry,
            &format!("chainflow_{}_queue_dropped_total", stage),
            queue.dropped as i64,
        );
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

fn set_gauge(registry: &Registry, name: &str, value: i64) {
    if let Ok(gauge) = IntGauge::new(name, name) {
        gauge.set(value);
        // Registration only fails on duplicate names within this registry
        let _ = registry.register(Box::new(gauge));
    }
}

#[cfg(test)]
mod tests {
    use super::super::queue::bounded;
    use super::*;
    use std::time::Duration;

    fn metrics() -> PipelineMetrics {
        let (raw, _) = bounded::<u8>("raw", 4, Duration::from_millis(1));
        let (decoded, _) = bounded::<u8>("decoded", 4, Duration::from_millis(1));
        let (signal, _) = bounded::<u8>("signal", 4, Duration::from_millis(1));
        PipelineMetrics::new(raw.stats(), decoded.stats(), signal.stats())
    }

    #[test]
    fn test_counters_accumulate() {
        let m = metrics();
        m.inc_received();
        m.inc_received();
        m.inc_decoded();
        m.inc_decode_errors();

        let snap = m.snapshot();
        assert_eq!(snap.ticks_received, 2);
        assert_eq!(snap.ticks_decoded, 1);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.ticks_processed, 0);
    }

    #[test]
    fn test_prometheus_exposition() {
        let m = metrics();
        m.inc_received();
        let text = encode_prometheus(&m.snapshot());
        assert!(text.contains("chainflow_ticks_received_total 1"));
        assert!(text.contains("chainflow_raw_queue_depth 0"));
    }
}
