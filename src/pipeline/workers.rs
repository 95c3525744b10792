//! Stage worker loops
//!
//! Each pool drains its stage queue until shutdown or queue closure.
//! Decode work runs here, off the socket-read path, so a tick burst
//! cannot starve the network reader.

use std::sync::Arc;
use std::time::Duration;
use futures_util::future::join_all;
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::metrics::PipelineMetrics;
use super::queue::{Popped, QueueConsumer, QueueProducer};
use super::{BroadcastHandler, DecodedTick, Outbound, OutboundItem, RawFrame};
use crate::chain::ChainManager;
use crate::decoder;
use crate::latency::{LatencyTracker, Stage};
use crate::strategy::Strategy;

pub(super) async fn decode_worker(
    id: usize,
    raw: QueueConsumer<RawFrame>,
    decoded: QueueProducer<DecodedTick>,
    metrics: Arc<PipelineMetrics>,
    shutdown: watch::Receiver<bool>,
) {
    debug!(worker = id, "Decode worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let mut frame = match raw.pop().await {
            Popped::Item(frame) => frame,
            Popped::Empty => continue,
            Popped::Closed => break,
        };

        if let Some(clock) = frame.clock.as_mut() {
            clock.mark(Stage::DecodeStart);
        }

        match decoder::decode(&frame.data) {
            Ok(tick) => {
                metrics.inc_decoded();
                if let Some(clock) = frame.clock.as_mut() {
                    clock.mark(Stage::DecodeEnd);
                }
                decoded.push(DecodedTick {
                    tick,
                    clock: frame.clock,
                });
            }
            Err(e) => {
                // Stale by the time a retry could help: count and drop
                metrics.inc_decode_errors();
                debug!(worker = id, error = %e, "Dropping undecodable frame");
            }
        }
    }
    debug!(worker = id, "Decode worker stopped");
}

#[allow(clippy::too_many_arguments)]
pub(super) async fn strategy_worker(
    id: usize,
    decoded: QueueConsumer<DecodedTick>,
    signals: QueueProducer<OutboundItem>,
    manager: Arc<ChainManager>,
    strategies: Arc<RwLock<Vec<Arc<dyn Strategy>>>>,
    strategy_timeout: Duration,
    metrics: Arc<PipelineMetrics>,
    tracker: Arc<LatencyTracker>,
    shutdown: watch::Receiver<bool>,
) {
    debug!(worker = id, "Strategy worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let mut item = match decoded.pop().await {
            Popped::Item(item) => item,
            Popped::Empty => continue,
            Popped::Closed => break,
        };

        if let Some(clock) = item.clock.as_mut() {
            clock.mark(Stage::StrategyStart);
        }

        let chain = manager.apply_tick(&item.tick).await;
        metrics.inc_processed();

        let mut generated = Vec::new();
        if let Some(chain) = chain {
            let context = chain.read().await.context();
            let registered = strategies.read().await.clone();
            if !registered.is_empty() {
                let tick = Arc::new(item.tick.clone());
                let context = Arc::new(context);

                let evaluations = registered.into_iter().map(|strategy| {
                    let tick = tick.clone();
                    let context = context.clone();
                    let name = strategy.name().to_string();
                    let task = tokio::task::spawn_blocking(move || {
                        strategy.evaluate(&tick, &context)
                    });
                    async move { (name, task.await) }
                });

                match timeout(strategy_timeout, join_all(evaluations)).await {
                    Ok(results) => {
                        for (name, result) in results {
                            match result {
                                Ok(Some(signal)) => {
                                    metrics.inc_signals();
                                    generated.push(signal);
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    // Isolated per callback: siblings are unaffected
                                    metrics.inc_strategy_errors();
                                    warn!(worker = id, strategy = %name, error = %e, "Strategy callback failed");
                                }
                            }
                        }
                    }
                    Err(_) => {
                        metrics.inc_strategy_errors();
                        warn!(
                            worker = id,
                            timeout_ms = strategy_timeout.as_millis() as u64,
                            "Strategy callbacks timed out"
                        );
                    }
                }
            }
        }

        if let Some(clock) = item.clock.as_mut() {
            clock.mark(Stage::StrategyEnd);
        }

        if generated.is_empty() {
            // Tick's journey ends here; close out its clock
            if let Some(clock) = item.clock.take() {
                tracker.complete(clock);
            }
        } else {
            // The clock rides the first signal through broadcast
            let mut clock = item.clock.take();
            for signal in generated {
                signals.push(OutboundItem {
                    item: Outbound::Signal(signal),
                    clock: clock.take(),
                });
            }
        }
    }
    debug!(worker = id, "Strategy worker stopped");
}

pub(super) async fn broadcast_worker(
    id: usize,
    outbound: QueueConsumer<OutboundItem>,
    handlers: Arc<RwLock<Vec<Arc<dyn BroadcastHandler>>>>,
    broadcast_timeout: Duration,
    metrics: Arc<PipelineMetrics>,
    tracker: Arc<LatencyTracker>,
    shutdown: watch::Receiver<bool>,
) {
    debug!(worker = id, "Broadcast worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let mut item = match outbound.pop().await {
            Popped::Item(item) => item,
            Popped::Empty => continue,
            Popped::Closed => break,
        };

        if let Some(clock) = item.clock.as_mut() {
            clock.mark(Stage::BroadcastStart);
        }

        let registered = handlers.read().await.clone();
        let deliveries = registered.iter().map(|handler| {
            let payload = &item.item;
            async move {
                let outcome = timeout(broadcast_timeout, handler.deliver(payload)).await;
                (handler.name().to_string(), outcome)
            }
        });

        for (name, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // A failing handler never blocks its siblings
                    metrics.inc_broadcast_errors();
                    warn!(worker = id, handler = %name, error = %e, "Broadcast handler failed");
                }
                Err(_) => {
                    metrics.inc_broadcast_errors();
                    warn!(
                        worker = id,
                        handler = %name,
                        timeout_ms = broadcast_timeout.as_millis() as u64,
                        "Broadcast handler timed out, skipping"
                    );
                }
            }
        }

        metrics.inc_broadcast();
        if let Some(mut clock) = item.clock.take() {
            clock.mark(Stage::BroadcastEnd);
            tracker.complete(clock);
        }
    }
    debug!(worker = id, "Broadcast worker stopped");
}
