//! Batch compute and OI refresh loops
//!
//! The batch loop decouples the uncapped tick rate from the capped
//! broadcast rate: once per period it rebalances the ATM window, builds
//! the final chain and queues the payload — unconditionally, so
//! downstream consumers always get a heartbeat-equivalent update even
//! with zero live OI. Both loops survive per-cycle failures and stop
//! only on cancellation.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, warn};

use crate::broker::{OiSource, SpotSource};
use crate::chain::{ChainBuild, ChainState};
use crate::pipeline::IngestionPipeline;
use crate::websocket::SubscriptionHandle;

/// One batch compute cycle for one chain
pub async fn run_batch_cycle(
    chain: &Arc<RwLock<ChainState>>,
    pipeline: &IngestionPipeline,
    subscriptions: &SubscriptionHandle,
    spot_source: &dyn SpotSource,
) {
    // REST fallback when no spot tick has arrived yet
    let (symbol, needs_spot) = {
        let state = chain.read().await;
        (state.key().symbol.clone(), state.spot_price().is_none())
    };
    if needs_spot {
        match spot_source.fetch_spot(&symbol).await {
            Ok(spot) => {
                debug!(symbol = %symbol, spot = %spot, "Seeded spot from REST fallback");
                chain.write().await.set_spot_fallback(spot);
            }
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "Spot fallback failed");
            }
        }
    }

    // Window maintenance
    let diff = chain.write().await.maybe_rebalance();
    if let Some(diff) = diff {
        debug!(
            symbol = %symbol,
            unsubscribe = diff.to_unsubscribe.len(),
            subscribe = diff.to_subscribe.len(),
            "Rebalancing ATM window"
        );
        subscriptions.apply_diff(diff).await;
    }

    // Coalesced broadcast
    match chain.read().await.build_final_chain() {
        ChainBuild::Ready(payload) => {
            if !pipeline.enqueue_payload(payload) {
                warn!(symbol = %symbol, "Signal queue full, payload shed");
            }
        }
        ChainBuild::Insufficient(reason) => {
            debug!(symbol = %symbol, reason = %reason, "Chain not ready to broadcast");
        }
    }
}

/// Fixed-period batch compute loop for one chain
pub async fn batch_compute_loop(
    chain: Arc<RwLock<ChainState>>,
    pipeline: Arc<IngestionPipeline>,
    subscriptions: SubscriptionHandle,
    spot_source: Arc<dyn SpotSource>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_batch_cycle(&chain, &pipeline, &subscriptions, spot_source.as_ref()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// One full-chain OI refresh cycle for one chain
pub async fn run_oi_cycle(chain: &Arc<RwLock<ChainState>>, oi_source: &dyn OiSource) {
    let (symbol, expiry) = {
        let state = chain.read().await;
        (state.key().symbol.clone(), state.key().expiry.clone())
    };

    match oi_source.fetch_full_chain_oi(&symbol, &expiry).await {
        Ok(snapshot) => {
            let mut state = chain.write().await;
            let (rest_window_call, rest_window_put) = state.window_restrict(&snapshot.per_strike);
            state.refresh_global_oi(
                snapshot.call_oi,
                snapshot.put_oi,
                rest_window_call,
                rest_window_put,
            );
            debug!(
                symbol = %symbol,
                call_oi = snapshot.call_oi,
                put_oi = snapshot.put_oi,
                rest_window_call,
                rest_window_put,
                "Refreshed full-chain OI baseline"
            );
        }
        Err(e) if e.is_transient() => {
            warn!(symbol = %symbol, error = %e, "OI refresh failed, keeping stale baseline");
        }
        Err(e) => {
            // AuthRequired and friends: the host has to act, the loop keeps
            // the last-known baseline so broadcasts continue
            error!(symbol = %symbol, error = %e, "OI refresh failed");
        }
    }
}

/// Fixed-period OI refresh loop for one chain
pub async fn oi_refresh_loop(
    chain: Arc<RwLock<ChainState>>,
    oi_source: Arc<dyn OiSource>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_oi_cycle(&chain, oi_source.as_ref()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
