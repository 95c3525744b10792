//! Staged tick ingestion pipeline
//!
//! Four stages (ingest, decode, process, broadcast) connected by bounded
//! queues with drop-newest backpressure. Worker counts, capacities and
//! timeouts all come from configuration; every stage scales
//! independently.

pub mod metrics;
pub mod queue;
pub mod supervisor;
mod workers;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

use crate::chain::{ChainManager, ChainPayload};
use crate::config::Config;
use crate::error::Result;
use crate::latency::{LatencyTracker, Stage, TickClock};
use crate::strategy::{Signal, Strategy};
use metrics::{MetricsSnapshot, PipelineMetrics};
use queue::{bounded, QueueConsumer, QueueProducer};
use supervisor::TaskSupervisor;

/// Raw WebSocket frame queued for decode
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub clock: Option<TickClock>,
}

/// Decoded tick queued for processing
#[derive(Debug, Clone)]
pub struct DecodedTick {
    pub tick: crate::decoder::FeedTick,
    pub clock: Option<TickClock>,
}

/// What the broadcast stage fans out
#[derive(Debug, Clone, Serialize)]
pub enum Outbound {
    Signal(Signal),
    Chain(ChainPayload),
}

/// Broadcast-stage queue entry
#[derive(Debug, Clone)]
pub struct OutboundItem {
    pub item: Outbound,
    pub clock: Option<TickClock>,
}

/// A registered downstream consumer of signals and chain payloads
///
/// Delivery runs under the per-broadcast timeout; a slow or failing
/// handler is logged and skipped without affecting siblings.
pub trait BroadcastHandler: Send + Sync {
    fn name(&self) -> &str;

    fn deliver<'a>(&'a self, item: &'a Outbound) -> BoxFuture<'a, Result<()>>;
}

struct StageConsumers {
    raw: QueueConsumer<RawFrame>,
    decoded: QueueConsumer<DecodedTick>,
    outbound: QueueConsumer<OutboundItem>,
}

/// The staged ingestion pipeline
pub struct IngestionPipeline {
    config: Arc<Config>,
    manager: Arc<ChainManager>,
    tracker: Arc<LatencyTracker>,
    metrics: Arc<PipelineMetrics>,
    raw_tx: QueueProducer<RawFrame>,
    decoded_tx: QueueProducer<DecodedTick>,
    outbound_tx: QueueProducer<OutboundItem>,
    consumers: StageConsumers,
    strategies: Arc<RwLock<Vec<Arc<dyn Strategy>>>>,
    handlers: Arc<RwLock<Vec<Arc<dyn BroadcastHandler>>>>,
    started: AtomicBool,
}

impl IngestionPipeline {
    pub fn new(
        config: Arc<Config>,
        manager: Arc<ChainManager>,
        tracker: Arc<LatencyTracker>,
    ) -> Self {
        let poll = Duration::from_millis(config.queue_poll_ms);
        let (raw_tx, raw_rx) = bounded("raw", config.raw_queue_capacity, poll);
        let (decoded_tx, decoded_rx) = bounded("decoded", config.decoded_queue_capacity, poll);
        let (outbound_tx, outbound_rx) = bounded("signal", config.signal_queue_capacity, poll);

        let metrics = Arc::new(PipelineMetrics::new(
            raw_tx.stats(),
            decoded_tx.stats(),
            outbound_tx.stats(),
        ));

        Self {
            config,
            manager,
            tracker,
            metrics,
            raw_tx,
            decoded_tx,
            outbound_tx,
            consumers: StageConsumers {
                raw: raw_rx,
                decoded: decoded_rx,
                outbound: outbound_rx,
            },
            strategies: Arc::new(RwLock::new(Vec::new())),
            handlers: Arc::new(RwLock::new(Vec::new())),
            started: AtomicBool::new(false),
        }
    }

    /// Hand a raw frame from the socket reader to the pipeline
    ///
    /// Never blocks; on a full raw queue the frame is shed and counted
    /// so the reader keeps draining the socket.
    pub fn ingest_raw(&self, data: Bytes) -> bool {
        self.metrics.inc_received();
        let mut clock = self.tracker.sample_clock();
        if let Some(clock) = clock.as_mut() {
            clock.mark(Stage::Queued);
        }
        self.raw_tx.push(RawFrame { data, clock })
    }

    /// Queue a coalesced chain payload for broadcast
    ///
    /// Entry point for the batch compute loop.
    pub fn enqueue_payload(&self, payload: ChainPayload) -> bool {
        self.outbound_tx.push(OutboundItem {
            item: Outbound::Chain(payload),
            clock: None,
        })
    }

    pub async fn register_strategy(&self, strategy: Arc<dyn Strategy>) {
        info!(strategy = strategy.name(), "Registering strategy");
        self.strategies.write().await.push(strategy);
    }

    pub async fn register_broadcast_handler(&self, handler: Arc<dyn BroadcastHandler>) {
        info!(handler = handler.name(), "Registering broadcast handler");
        self.handlers.write().await.push(handler);
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn tracker(&self) -> Arc<LatencyTracker> {
        self.tracker.clone()
    }

    /// Spawn all stage worker pools under the supervisor
    pub fn start(&self, supervisor: &TaskSupervisor) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            decode_workers = self.config.decode_workers,
            strategy_workers = self.config.strategy_workers,
            broadcast_workers = self.config.broadcast_workers,
            "Starting ingestion pipeline"
        );

        for id in 0..self.config.decode_workers {
            supervisor.spawn(
                format!("decode-{}", id),
                workers::decode_worker(
                    id,
                    self.consumers.raw.clone(),
                    self.decoded_tx.clone(),
                    self.metrics.clone(),
                    supervisor.subscribe(),
                ),
            );
        }

        for id in 0..self.config.strategy_workers {
            supervisor.spawn(
                format!("strategy-{}", id),
                workers::strategy_worker(
                    id,
                    self.consumers.decoded.clone(),
                    self.outbound_tx.clone(),
                    self.manager.clone(),
                    self.strategies.clone(),
                    Duration::from_millis(self.config.strategy_timeout_ms),
                    self.metrics.clone(),
                    self.tracker.clone(),
                    supervisor.subscribe(),
                ),
            );
        }

        for id in 0..self.config.broadcast_workers {
            supervisor.spawn(
                format!("broadcast-{}", id),
                workers::broadcast_worker(
                    id,
                    self.consumers.outbound.clone(),
                    self.handlers.clone(),
                    Duration::from_millis(self.config.broadcast_timeout_ms),
                    self.metrics.clone(),
                    self.tracker.clone(),
                    supervisor.subscribe(),
                ),
            );
        }
    }
}
