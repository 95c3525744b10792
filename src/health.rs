//! Pipeline health monitor
//!
//! Polls pipeline metrics and latency reports on a fixed interval.
//! Unhealthy status is advisory: it is logged and exposed, never used to
//! halt the pipeline.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::latency::LatencyTracker;
use crate::pipeline::metrics::{PipelineMetrics, QueueSnapshot};

/// Advisory health verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub issues: Vec<String>,
}

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Queue utilization fraction above which a queue is flagged
    pub queue_alarm_fraction: f64,
    /// Mean per-stage latency ceiling in milliseconds
    pub stage_ceiling_ms: f64,
}

/// Watches queue utilization and stage latency ceilings
pub struct HealthMonitor {
    metrics: Arc<PipelineMetrics>,
    tracker: Arc<LatencyTracker>,
    config: MonitorConfig,
}

impl HealthMonitor {
    pub fn new(
        metrics: Arc<PipelineMetrics>,
        tracker: Arc<LatencyTracker>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            metrics,
            tracker,
            config,
        }
    }

    /// Evaluate health from current metrics
    pub fn evaluate(&self) -> HealthStatus {
        let snapshot = self.metrics.snapshot();
        let mut issues = Vec::new();

        let queues = [
            ("raw", &snapshot.raw_queue),
            ("decoded", &snapshot.decoded_queue),
            ("signal", &snapshot.signal_queue),
        ];
        for (name, queue) in queues {
            self.check_queue(name, queue, &mut issues);
        }

        let report = self.tracker.report();
        for (stage, stats) in &report.stages {
            if stats.mean_ms > self.config.stage_ceiling_ms {
                issues.push(format!(
                    "stage {} mean latency {:.1}ms exceeds ceiling {:.0}ms",
                    stage, stats.mean_ms, self.config.stage_ceiling_ms
                ));
            }
        }

        HealthStatus {
            healthy: issues.is_empty(),
            issues,
        }
    }

    fn check_queue(&self, name: &str, queue: &QueueSnapshot, issues: &mut Vec<String>) {
        if queue.utilization > self.config.queue_alarm_fraction {
            issues.push(format!(
                "{} queue at {:.0}% utilization ({}/{})",
                name,
                queue.utilization * 100.0,
                queue.depth,
                queue.capacity
            ));
        }
    }

    /// Poll loop; stops on the shutdown signal
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = self.evaluate();
                    if status.healthy {
                        debug!("Pipeline healthy");
                    } else {
                        warn!(issues = ?status.issues, "Pipeline degraded");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latency::{LatencyTracker, TrackerConfig};
    use crate::pipeline::queue::bounded;

    fn monitor(
        queue_capacity: usize,
    ) -> (
        HealthMonitor,
        crate::pipeline::queue::QueueProducer<u8>,
        Vec<crate::pipeline::queue::QueueConsumer<u8>>,
    ) {
        let (raw, raw_rx) = bounded::<u8>("raw", queue_capacity, Duration::from_millis(1));
        let (decoded, rx1) = bounded::<u8>("decoded", 100, Duration::from_millis(1));
        let (signal, rx2) = bounded::<u8>("signal", 100, Duration::from_millis(1));
        let metrics = Arc::new(PipelineMetrics::new(
            raw.stats(),
            decoded.stats(),
            signal.stats(),
        ));
        let tracker = Arc::new(LatencyTracker::new(TrackerConfig {
            sample_rate: 1,
            ring_capacity: 8,
            alert_threshold: Duration::from_secs(3600),
            alert_cooldown: Duration::from_secs(10),
            dominant_share: 0.3,
        }));
        (
            HealthMonitor::new(
                metrics,
                tracker,
                MonitorConfig {
                    poll_interval: Duration::from_millis(10),
                    queue_alarm_fraction: 0.8,
                    stage_ceiling_ms: 250.0,
                },
            ),
            raw,
            vec![raw_rx, rx1, rx2],
        )
    }

    #[tokio::test]
    async fn test_healthy_when_idle() {
        let (monitor, _raw, _consumers) = monitor(10);
        let status = monitor.evaluate();
        assert!(status.healthy);
        assert!(status.issues.is_empty());
    }

    #[tokio::test]
    async fn test_flags_saturated_queue() {
        let (monitor, raw, _consumers) = monitor(4);
        for i in 0..4 {
            raw.push(i);
        }

        let status = monitor.evaluate();
        assert!(!status.healthy);
        assert!(status.issues[0].contains("raw queue"));
    }
}
