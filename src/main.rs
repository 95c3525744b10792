//! ChainFlow - Option-Chain Aggregation Service
//!
//! Ingests the broker's binary option-chain feed, maintains per-symbol
//! live chains inside a bounded ATM window, reconciles open interest
//! against the periodic REST baseline, and republishes coalesced
//! payloads to downstream consumers at a fixed cadence.

mod broker;
mod chain;
mod compute;
mod config;
mod decoder;
mod error;
mod health;
mod latency;
mod pipeline;
mod publisher;
mod strategy;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::{routing::get, Json, Router};
use futures_util::future::BoxFuture;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::broker::{InstrumentRegistry, RateLimiter, RestBroker, SharedTokenGate, TokenProvider};
use crate::chain::ChainManager;
use crate::config::Config;
use crate::error::FeedError;
use crate::health::{HealthMonitor, MonitorConfig};
use crate::latency::{LatencyTracker, TrackerConfig};
use crate::pipeline::supervisor::TaskSupervisor;
use crate::pipeline::IngestionPipeline;
use crate::publisher::Publisher;
use crate::strategy::PcrThresholdStrategy;
use crate::websocket::FeedManager;

/// Application state shared with the HTTP endpoints
struct AppState {
    pipeline: Arc<IngestionPipeline>,
    monitor: Arc<HealthMonitor>,
}

/// Token provider backed by an environment variable
///
/// The OAuth exchange/refresh flow lives in the host deployment; this
/// stand-in surfaces `AuthRequired` when no token is present.
struct EnvTokenProvider;

impl TokenProvider for EnvTokenProvider {
    fn valid_token(&self) -> BoxFuture<'static, crate::error::Result<String>> {
        Box::pin(async {
            std::env::var("BROKER_ACCESS_TOKEN")
                .map_err(|_| FeedError::AuthRequired("BROKER_ACCESS_TOKEN not set".to_string()))
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting ChainFlow option-chain aggregation service");

    // Load configuration
    let config = Arc::new(Config::load()?);
    info!(symbols = ?config.symbols, "Configuration loaded");

    // Broker REST client shared by discovery, OI refresh and spot fallback
    let token = Arc::new(SharedTokenGate::new(Arc::new(EnvTokenProvider)));
    let limiter = Arc::new(RateLimiter::new(Duration::from_millis(
        config.rest_min_interval_ms,
    )));
    let rest = Arc::new(RestBroker::new(
        config.rest_endpoint.clone(),
        token.clone(),
        limiter,
        Duration::from_secs(config.request_timeout_secs),
        config.rest_max_retries,
    )?);

    // Resolve the instrument registry for every configured chain;
    // a missing registry is an unrecoverable startup failure
    let chains = Arc::new(ChainManager::new());
    for symbol_config in &config.symbols {
        let strike_map = rest
            .resolve_instruments(&symbol_config.symbol, &symbol_config.expiry)
            .await?;
        info!(
            symbol = %symbol_config.symbol,
            expiry = %symbol_config.expiry,
            strikes = strike_map.strikes.len(),
            "Instrument registry resolved"
        );
        chains
            .insert_chain(
                chain::ChainKey::new(
                    symbol_config.symbol.clone(),
                    symbol_config.expiry.clone(),
                ),
                strike_map,
                config.window_half_width,
                config.rebalance_hysteresis,
            )
            .await;
    }

    // Latency tracker and pipeline
    let tracker = Arc::new(LatencyTracker::new(TrackerConfig {
        sample_rate: config.latency_sample_rate,
        ring_capacity: config.latency_ring_capacity,
        alert_threshold: Duration::from_millis(config.latency_alert_threshold_ms),
        alert_cooldown: Duration::from_secs(config.latency_alert_cooldown_secs),
        dominant_share: config.latency_dominant_share,
    }));
    let pipeline = Arc::new(IngestionPipeline::new(
        config.clone(),
        chains.clone(),
        tracker.clone(),
    ));

    // Default signal scoring and the IPC publisher
    pipeline
        .register_strategy(Arc::new(PcrThresholdStrategy::default()))
        .await;
    let ipc_publisher = Arc::new(Publisher::new(&config.ipc_socket_path).await?);
    pipeline.register_broadcast_handler(ipc_publisher).await;

    // Supervised background tasks
    let supervisor = TaskSupervisor::new();
    pipeline.start(&supervisor);

    let (mut feed_manager, subscriptions) = FeedManager::new(
        config.clone(),
        pipeline.clone(),
        chains.clone(),
        token.clone(),
    );

    for key in chains.keys().await {
        let chain = chains
            .get(&key)
            .await
            .ok_or_else(|| anyhow::anyhow!("chain {} vanished during startup", key))?;
        supervisor.spawn(
            format!("batch-compute-{}", key),
            compute::batch_compute_loop(
                chain.clone(),
                pipeline.clone(),
                subscriptions.clone(),
                rest.clone(),
                Duration::from_millis(config.batch_compute_ms),
                supervisor.subscribe(),
            ),
        );
        supervisor.spawn(
            format!("oi-refresh-{}", key),
            compute::oi_refresh_loop(
                chain,
                rest.clone(),
                Duration::from_secs(config.oi_refresh_secs),
                supervisor.subscribe(),
            ),
        );
    }

    let monitor = Arc::new(HealthMonitor::new(
        pipeline.metrics(),
        tracker.clone(),
        MonitorConfig {
            poll_interval: Duration::from_secs(config.health_poll_secs),
            queue_alarm_fraction: config.queue_alarm_fraction,
            stage_ceiling_ms: config.stage_latency_ceiling_ms as f64,
        },
    ));
    supervisor.spawn("health-monitor", monitor.clone().run(supervisor.subscribe()));

    // HTTP server for health checks and metrics
    let app_state = Arc::new(AppState {
        pipeline: pipeline.clone(),
        monitor,
    });
    let health_port = config.health_port;
    supervisor.spawn("health-server", async move {
        if let Err(e) = start_health_server(app_state, health_port).await {
            warn!(error = %e, "Health server error");
        }
    });

    // Run the feed until SIGINT or an auth failure
    let feed_shutdown = supervisor.subscribe();
    let outcome = tokio::select! {
        result = feed_manager.run(feed_shutdown) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            Ok(())
        }
    };

    supervisor.shutdown(Duration::from_secs(5)).await;

    if let Err(e) = outcome {
        error!(error = %e, "Feed terminated with error");
        return Err(e.into());
    }
    info!("Shutdown complete");
    Ok(())
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    use std::net::SocketAddr;

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/latency", get(latency_report))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = state.monitor.evaluate();
    Json(serde_json::json!({
        "status": if status.healthy { "healthy" } else { "degraded" },
        "component": "chainflow-market-data",
        "issues": status.issues,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    pipeline::metrics::encode_prometheus(&state.pipeline.metrics_snapshot())
}

async fn latency_report(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let report = state.pipeline.tracker().report();
    Json(serde_json::to_value(report).unwrap_or_default())
}
