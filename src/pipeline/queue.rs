//! Bounded stage queues with drop-newest backpressure
//!
//! Enqueue never blocks: the producer is the single WebSocket read loop
//! and must keep draining the socket, so a full queue sheds the new item
//! and counts it instead of stalling upstream.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Shared counters for one stage queue
#[derive(Debug)]
pub struct QueueStats {
    name: &'static str,
    capacity: usize,
    depth: AtomicUsize,
    dropped: AtomicU64,
}

impl QueueStats {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current depth as a fraction of capacity
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.depth() as f64 / self.capacity as f64
        }
    }
}

/// Producer handle for a bounded stage queue
#[derive(Debug, Clone)]
pub struct QueueProducer<T> {
    tx: mpsc::Sender<T>,
    stats: Arc<QueueStats>,
}

impl<T> QueueProducer<T> {
    /// Non-blocking enqueue
    ///
    /// Returns false when the item was shed (queue full or consumers
    /// gone); the overflow counter records it either way.
    pub fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.stats.depth.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total.is_power_of_two() {
                    warn!(
                        queue = self.stats.name,
                        dropped_total = total,
                        capacity = self.stats.capacity,
                        "Queue full, shedding newest item"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }
}

/// Result of one bounded consumer poll
#[derive(Debug)]
pub enum Popped<T> {
    Item(T),
    /// Poll timeout elapsed; caller re-checks shutdown and retries
    Empty,
    /// All producers dropped
    Closed,
}

/// Consumer handle shared by one stage's worker pool
#[derive(Debug, Clone)]
pub struct QueueConsumer<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    stats: Arc<QueueStats>,
    poll_timeout: Duration,
}

impl<T> QueueConsumer<T> {
    /// Dequeue bounded by the poll timeout so workers observe shutdown
    pub async fn pop(&self) -> Popped<T> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(self.poll_timeout, rx.recv()).await {
            Ok(Some(item)) => {
                self.stats.depth.fetch_sub(1, Ordering::Relaxed);
                Popped::Item(item)
            }
            Ok(None) => Popped::Closed,
            Err(_) => Popped::Empty,
        }
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }
}

/// Build one stage queue
pub fn bounded<T>(
    name: &'static str,
    capacity: usize,
    poll_timeout: Duration,
) -> (QueueProducer<T>, QueueConsumer<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let stats = Arc::new(QueueStats {
        name,
        capacity,
        depth: AtomicUsize::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        QueueProducer {
            tx,
            stats: stats.clone(),
        },
        QueueConsumer {
            rx: Arc::new(Mutex::new(rx)),
            stats,
            poll_timeout,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_past_capacity_never_blocks() {
        let (tx, _rx) = bounded::<u32>("raw", 4, Duration::from_millis(10));

        let mut accepted = 0;
        for i in 0..10 {
            if tx.push(i) {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 4);
        assert_eq!(tx.stats().dropped(), 6);
        assert_eq!(tx.stats().depth(), 4);
    }

    #[tokio::test]
    async fn test_pop_drains_fifo() {
        let (tx, rx) = bounded::<u32>("raw", 8, Duration::from_millis(10));
        tx.push(1);
        tx.push(2);

        match rx.pop().await {
            Popped::Item(v) => assert_eq!(v, 1),
            other => panic!("expected item, got {:?}", other),
        }
        match rx.pop().await {
            Popped::Item(v) => assert_eq!(v, 2),
            other => panic!("expected item, got {:?}", other),
        }
        assert_eq!(rx.stats().depth(), 0);
    }

    #[tokio::test]
    async fn test_pop_times_out_on_empty() {
        let (_tx, rx) = bounded::<u32>("raw", 8, Duration::from_millis(5));
        assert!(matches!(rx.pop().await, Popped::Empty));
    }

    #[tokio::test]
    async fn test_pop_reports_closed() {
        let (tx, rx) = bounded::<u32>("raw", 8, Duration::from_millis(50));
        drop(tx);
        assert!(matches!(rx.pop().await, Popped::Closed));
    }

    #[tokio::test]
    async fn test_utilization() {
        let (tx, rx) = bounded::<u32>("raw", 4, Duration::from_millis(10));
        tx.push(1);
        tx.push(2);
        assert!((rx.stats().utilization() - 0.5).abs() < f64::EPSILON);
    }
}
