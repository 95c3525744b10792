//! ChainFlow - Option-Chain Aggregation Library
//!
//! This crate ingests the broker's binary option-chain feed, maintains a
//! consistent live view per (symbol, expiry) inside a bounded ATM window,
//! reconciles open interest across the REST baseline and the windowed
//! tick stream, and republishes coalesced chain payloads at a fixed
//! cadence.

use std::sync::Arc;

pub mod broker;
pub mod chain;
pub mod compute;
pub mod config;
pub mod decoder;
pub mod error;
pub mod health;
pub mod latency;
pub mod pipeline;
pub mod publisher;
pub mod strategy;
pub mod websocket;

pub use chain::{ChainKey, ChainManager, ChainPayload, ChainState};
pub use config::Config;
pub use decoder::{decode, FeedTick};
pub use error::{FeedError, Result};
pub use health::{HealthMonitor, HealthStatus};
pub use latency::{LatencyTracker, TrackerConfig};
pub use pipeline::{BroadcastHandler, IngestionPipeline, Outbound};
pub use publisher::Publisher;
pub use strategy::{Signal, SignalAction, Strategy};
pub use websocket::{FeedManager, SubscriptionHandle};

/// Application state shared across components
pub struct AppState {
    pub config: Arc<Config>,
    pub chains: Arc<ChainManager>,
    pub pipeline: Arc<IngestionPipeline>,
    pub monitor: Arc<HealthMonitor>,
}
