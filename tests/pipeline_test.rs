//! End-to-end pipeline scenarios
//!
//! Drives the full ingest -> decode -> process -> broadcast path with
//! synthetic feed frames and checks window stability, rebalance diffs,
//! OI reconciliation and heartbeat behavior from the outside.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};

use chainflow_market_data::broker::{OiSnapshot, OiSource, SpotSource};
use chainflow_market_data::chain::{ChainKey, ChainState, InstrumentPair, StrikeMap};
use chainflow_market_data::compute::{run_batch_cycle, run_oi_cycle};
use chainflow_market_data::decoder::frames;
use chainflow_market_data::pipeline::supervisor::TaskSupervisor;
use chainflow_market_data::websocket::{SubscriptionCommand, SubscriptionHandle};
use chainflow_market_data::{
    BroadcastHandler, ChainManager, Config, FeedError, IngestionPipeline, LatencyTracker,
    Outbound, Result, TrackerConfig,
};

const SPOT_KEY: &str = "NSE_INDEX|Nifty 50";

fn nifty_strike_map() -> StrikeMap {
    // Strikes 23000..=24000 in 50-point steps
    let strikes: BTreeMap<Decimal, InstrumentPair> = (460..=480)
        .map(|i| {
            let strike = Decimal::from(i * 50);
            (
                strike,
                InstrumentPair {
                    ce: format!("NSE_FO|{}CE", i * 50),
                    pe: format!("NSE_FO|{}PE", i * 50),
                },
            )
        })
        .collect();
    StrikeMap {
        strikes,
        spot_key: SPOT_KEY.to_string(),
        strike_step: dec!(50),
    }
}

fn test_config() -> Arc<Config> {
    let mut config = Config::default();
    config.decode_workers = 2;
    config.strategy_workers = 2;
    config.broadcast_workers = 1;
    config.queue_poll_ms = 10;
    config.window_half_width = 2;
    config.rebalance_hysteresis = 2;
    Arc::new(config)
}

fn tracker() -> Arc<LatencyTracker> {
    Arc::new(LatencyTracker::new(TrackerConfig {
        sample_rate: 1,
        ring_capacity: 2048,
        alert_threshold: Duration::from_secs(3600),
        alert_cooldown: Duration::from_secs(10),
        dominant_share: 0.3,
    }))
}

struct NoSpot;

impl SpotSource for NoSpot {
    fn fetch_spot(&self, _symbol: &str) -> BoxFuture<'static, Result<Decimal>> {
        Box::pin(async { Err(FeedError::Rest("fallback unavailable".to_string())) })
    }
}

struct FixedOi {
    snapshot: OiSnapshot,
}

impl OiSource for FixedOi {
    fn fetch_full_chain_oi(
        &self,
        _symbol: &str,
        _expiry: &str,
    ) -> BoxFuture<'static, Result<OiSnapshot>> {
        let snapshot = self.snapshot.clone();
        Box::pin(async move { Ok(snapshot) })
    }
}

struct Capture {
    items: Arc<Mutex<Vec<Outbound>>>,
}

impl BroadcastHandler for Capture {
    fn name(&self) -> &str {
        "capture"
    }

    fn deliver<'a>(&'a self, item: &'a Outbound) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.items.lock().await.push(item.clone());
            Ok(())
        })
    }
}

struct Harness {
    chain: Arc<RwLock<ChainState>>,
    pipeline: Arc<IngestionPipeline>,
    supervisor: TaskSupervisor,
    subscriptions: SubscriptionHandle,
    commands: mpsc::Receiver<SubscriptionCommand>,
    captured: Arc<Mutex<Vec<Outbound>>>,
}

async fn harness() -> Harness {
    let config = test_config();
    let manager = Arc::new(ChainManager::new());
    let chain = manager
        .insert_chain(
            ChainKey::new("NIFTY", "2025-01-30"),
            nifty_strike_map(),
            config.window_half_width,
            config.rebalance_hysteresis,
        )
        .await;

    let pipeline = Arc::new(IngestionPipeline::new(config, manager, tracker()));
    let captured = Arc::new(Mutex::new(Vec::new()));
    pipeline
        .register_broadcast_handler(Arc::new(Capture {
            items: captured.clone(),
        }))
        .await;

    let supervisor = TaskSupervisor::new();
    pipeline.start(&supervisor);

    let (tx, commands) = mpsc::channel(64);
    Harness {
        chain,
        pipeline,
        supervisor,
        subscriptions: SubscriptionHandle::from_sender(tx),
        commands,
        captured,
    }
}

/// Wait until the pipeline has processed `count` ticks
async fn await_processed(pipeline: &IngestionPipeline, count: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if pipeline.metrics_snapshot().ticks_processed >= count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pipeline did not process {} ticks in time",
            count
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn drain_commands(commands: &mut mpsc::Receiver<SubscriptionCommand>) -> Vec<SubscriptionCommand> {
    let mut drained = Vec::new();
    while let Ok(command) = commands.try_recv() {
        drained.push(command);
    }
    drained
}

#[tokio::test]
async fn test_oscillating_spot_never_rebalances_then_jump_rebalances_once() {
    let mut h = harness().await;

    // 1,000 spot ticks oscillating 40 points (inside the 100-point
    // hysteresis band), a compute cycle after every 100 ticks
    let mut processed = 0u64;
    for batch in 0..10i64 {
        for i in 0..100i64 {
            let n = batch * 100 + i;
            let ltp = if n % 2 == 0 { 23500.0 } else { 23540.0 };
            h.pipeline
                .ingest_raw(Bytes::from(frames::index_spot(SPOT_KEY, 1000 + n, ltp)));
        }
        processed += 100;
        await_processed(&h.pipeline, processed).await;
        run_batch_cycle(&h.chain, &h.pipeline, &h.subscriptions, &NoSpot).await;
    }

    // Exactly one subscription command over the whole oscillation: the
    // initial window (last tick of the first batch is 23540, ATM 23550)
    let commands = drain_commands(&mut h.commands);
    assert_eq!(commands.len(), 1);
    match &commands[0] {
        SubscriptionCommand::Subscribe(keys) => {
            // Spot plus both legs of the 5-strike window
            assert_eq!(keys.len(), 11);
            assert!(keys.contains(&SPOT_KEY.to_string()));
        }
        other => panic!("expected initial subscribe, got {:?}", other),
    }
    assert_eq!(h.chain.read().await.current_atm(), Some(dec!(23550)));

    // Jump 150 points: exactly one rebalance with correctly diffed sets
    h.pipeline
        .ingest_raw(Bytes::from(frames::index_spot(SPOT_KEY, 5000, 23650.0)));
    await_processed(&h.pipeline, 1001).await;
    run_batch_cycle(&h.chain, &h.pipeline, &h.subscriptions, &NoSpot).await;

    // Window moves 23450..23650 -> 23550..23750
    let rebalance = drain_commands(&mut h.commands);
    assert_eq!(rebalance.len(), 2);
    match &rebalance[0] {
        SubscriptionCommand::Unsubscribe(keys) => {
            // Strikes 23450 and 23500 leave, both legs each
            assert_eq!(keys.len(), 4);
            assert!(keys.iter().all(|k| k != SPOT_KEY));
        }
        other => panic!("expected unsubscribe first, got {:?}", other),
    }
    match &rebalance[1] {
        SubscriptionCommand::Subscribe(keys) => {
            // Strikes 23700 and 23750 join
            assert_eq!(keys.len(), 4);
        }
        other => panic!("expected subscribe second, got {:?}", other),
    }

    // And it is stable afterwards
    run_batch_cycle(&h.chain, &h.pipeline, &h.subscriptions, &NoSpot).await;
    assert!(drain_commands(&mut h.commands).is_empty());

    h.supervisor.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_oi_reconciliation_through_pipeline() {
    let mut h = harness().await;

    // Establish the window at 23500
    h.pipeline
        .ingest_raw(Bytes::from(frames::index_spot(SPOT_KEY, 1000, 23500.0)));
    await_processed(&h.pipeline, 1).await;
    run_batch_cycle(&h.chain, &h.pipeline, &h.subscriptions, &NoSpot).await;
    drain_commands(&mut h.commands);

    // WS window call OI accumulates to 25,000 across two strikes
    h.pipeline.ingest_raw(Bytes::from(frames::option_quote(
        "NSE_FO|23500CE",
        1001,
        142.55,
        1000,
        15_000,
        142.4,
        142.7,
        None,
    )));
    h.pipeline.ingest_raw(Bytes::from(frames::option_quote(
        "NSE_FO|23550CE",
        1002,
        98.10,
        800,
        10_000,
        98.0,
        98.3,
        None,
    )));
    await_processed(&h.pipeline, 3).await;

    // REST baseline: 100,000 full-chain calls, 20,000 of them inside the window
    let oi = FixedOi {
        snapshot: OiSnapshot {
            call_oi: 100_000,
            put_oi: 80_000,
            per_strike: [
                (dec!(23500), (12_000u64, 0u64)),
                (dec!(23550), (8_000, 0)),
                (dec!(23000), (30_000, 40_000)), // outside window
            ]
            .into_iter()
            .collect(),
        },
    };
    run_oi_cycle(&h.chain, &oi).await;

    let breakdown = h.chain.read().await.oi_breakdown();
    assert_eq!(breakdown.global_call_oi, 100_000);
    assert_eq!(breakdown.rest_window_call_oi, 20_000);
    assert_eq!(breakdown.window_call_oi, 25_000);
    // 100,000 - 20,000 + 25,000
    assert_eq!(breakdown.adjusted_call_oi, 105_000);
    assert_eq!(breakdown.adjusted_put_oi, 80_000);

    h.supervisor.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_heartbeat_broadcast_with_zero_oi() {
    let mut h = harness().await;

    // Market closed: spot known, no option quotes at all
    h.pipeline
        .ingest_raw(Bytes::from(frames::index_spot(SPOT_KEY, 1000, 23500.0)));
    await_processed(&h.pipeline, 1).await;

    for _ in 0..3 {
        run_batch_cycle(&h.chain, &h.pipeline, &h.subscriptions, &NoSpot).await;
    }
    drain_commands(&mut h.commands);

    // Every cycle still broadcast a payload
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if h.captured.lock().await.len() >= 3 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "heartbeat payloads never arrived"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let captured = h.captured.lock().await;
    for item in captured.iter() {
        match item {
            Outbound::Chain(payload) => {
                assert_eq!(payload.symbol, "NIFTY");
                assert_eq!(payload.spot, dec!(23500));
                assert!(payload.calls.is_empty());
                assert_eq!(payload.pcr, 0.0);
                assert_eq!(payload.oi_breakdown.adjusted_call_oi, 0);
            }
            other => panic!("expected chain payload, got {:?}", other),
        }
    }
    drop(captured);

    h.supervisor.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_backpressure_sheds_instead_of_blocking() {
    // Tiny raw queue, no workers started: pushes must shed, never block
    let mut config = Config::default();
    config.raw_queue_capacity = 8;
    let manager = Arc::new(ChainManager::new());
    let pipeline = IngestionPipeline::new(Arc::new(config), manager, tracker());

    for i in 0..20i64 {
        pipeline.ingest_raw(Bytes::from(frames::index_spot(SPOT_KEY, i, 23500.0)));
    }

    let snap = pipeline.metrics_snapshot();
    assert_eq!(snap.ticks_received, 20);
    assert_eq!(snap.raw_queue.depth, 8);
    assert_eq!(snap.raw_queue.dropped, 12);
}

#[tokio::test]
async fn test_latency_samples_cover_full_path() {
    let h = harness().await;

    for i in 0..50i64 {
        h.pipeline
            .ingest_raw(Bytes::from(frames::index_spot(SPOT_KEY, 1000 + i, 23500.0)));
    }
    await_processed(&h.pipeline, 50).await;

    let report = h.pipeline.tracker().report();
    assert!(report.samples > 0);
    assert!(report.total.p99_ms >= report.total.p50_ms);
    for (_, stats) in &report.stages {
        assert!(stats.mean_ms >= 0.0);
    }

    h.supervisor.shutdown(Duration::from_secs(1)).await;
}
