//! Configuration module for the option-chain aggregation service

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

/// A `SYMBOL:EXPIRY` pair the service aggregates a chain for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    /// Expiry date in `YYYY-MM-DD` form
    pub expiry: String,
}

impl SymbolConfig {
    fn parse(raw: &str) -> Option<Self> {
        let (symbol, expiry) = raw.split_once(':')?;
        let symbol = symbol.trim();
        let expiry = expiry.trim();
        if symbol.is_empty() || expiry.is_empty() {
            return None;
        }
        Some(Self {
            symbol: symbol.to_uppercase(),
            expiry: expiry.to_string(),
        })
    }
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Chains to aggregate (e.g. ["NIFTY:2025-01-30"])
    pub symbols: Vec<SymbolConfig>,

    /// WebSocket endpoint for the broker feed
    pub ws_endpoint: String,

    /// REST API endpoint for OI snapshots and instrument discovery
    pub rest_endpoint: String,

    /// IPC socket path for publishing chain payloads
    pub ipc_socket_path: String,

    /// Port for the health/metrics HTTP server
    pub health_port: u16,

    /// Queue capacities per pipeline stage
    pub raw_queue_capacity: usize,
    pub decoded_queue_capacity: usize,
    pub signal_queue_capacity: usize,

    /// Worker pool sizes per pipeline stage
    pub decode_workers: usize,
    pub strategy_workers: usize,
    pub broadcast_workers: usize,

    /// How long a worker waits on an empty queue before re-checking shutdown
    pub queue_poll_ms: u64,

    /// Combined timeout for all strategy callbacks on one tick
    pub strategy_timeout_ms: u64,

    /// Per-payload timeout for broadcast handler fan-out
    pub broadcast_timeout_ms: u64,

    /// Batch compute (coalescing) period per chain
    pub batch_compute_ms: u64,

    /// Full-chain OI refresh period via REST
    pub oi_refresh_secs: u64,

    /// ATM window half-width in strikes
    pub window_half_width: u32,

    /// Rebalance hysteresis as a multiple of the strike step
    pub rebalance_hysteresis: u32,

    /// Strike step used when a symbol has no override
    pub default_strike_step: Decimal,

    /// Per-symbol strike step overrides
    pub strike_steps: HashMap<String, Decimal>,

    /// Latency sampling: track one in every N ticks
    pub latency_sample_rate: u64,

    /// End-to-end latency alert threshold in milliseconds
    pub latency_alert_threshold_ms: u64,

    /// Minimum gap between two latency warnings
    pub latency_alert_cooldown_secs: u64,

    /// Capacity of the latency sample ring buffer
    pub latency_ring_capacity: usize,

    /// Share of total latency above which one stage is called dominant
    pub latency_dominant_share: f64,

    /// Queue utilization fraction above which the monitor flags unhealthy
    pub queue_alarm_fraction: f64,

    /// Mean per-stage latency ceiling for the health monitor
    pub stage_latency_ceiling_ms: u64,

    /// Health monitor poll interval
    pub health_poll_secs: u64,

    /// Minimum delay between any two REST requests (shared across symbols)
    pub rest_min_interval_ms: u64,

    /// Bounded retry attempts on HTTP 429
    pub rest_max_retries: u32,

    /// Per-request REST timeout
    pub request_timeout_secs: u64,

    /// WebSocket read timeout for stale-connection detection
    pub ws_read_timeout_secs: u64,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub max_backoff_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let symbols: Vec<SymbolConfig> = env::var("SYMBOLS")
            .unwrap_or_else(|_| "NIFTY:2025-01-30".to_string())
            .split(',')
            .filter_map(SymbolConfig::parse)
            .collect();

        if symbols.is_empty() {
            anyhow::bail!("SYMBOLS must contain at least one SYMBOL:EXPIRY pair");
        }

        Ok(Self {
            symbols,
            ws_endpoint: env::var("WS_ENDPOINT")
                .unwrap_or_else(|_| "wss://feed.chainflow.internal/v3/marketdata".to_string()),
            rest_endpoint: env::var("REST_ENDPOINT")
                .unwrap_or_else(|_| "https://api.chainflow.internal/v2".to_string()),
            ipc_socket_path: env::var("IPC_SOCKET_PATH")
                .unwrap_or_else(|_| "/tmp/chainflow.sock".to_string()),
            health_port: parse_env("HEALTH_PORT", 9090),
            raw_queue_capacity: parse_env("RAW_QUEUE_CAPACITY", 8192),
            decoded_queue_capacity: parse_env("DECODED_QUEUE_CAPACITY", 4096),
            signal_queue_capacity: parse_env("SIGNAL_QUEUE_CAPACITY", 1024),
            decode_workers: parse_env("DECODE_WORKERS", 2),
            strategy_workers: parse_env("STRATEGY_WORKERS", 4),
            broadcast_workers: parse_env("BROADCAST_WORKERS", 2),
            queue_poll_ms: parse_env("QUEUE_POLL_MS", 100),
            strategy_timeout_ms: parse_env("STRATEGY_TIMEOUT_MS", 2000),
            broadcast_timeout_ms: parse_env("BROADCAST_TIMEOUT_MS", 1000),
            batch_compute_ms: parse_env("BATCH_COMPUTE_MS", 500),
            oi_refresh_secs: parse_env("OI_REFRESH_SECS", 60),
            window_half_width: parse_env("WINDOW_HALF_WIDTH", 10),
            rebalance_hysteresis: parse_env("REBALANCE_HYSTERESIS", 2),
            default_strike_step: parse_decimal_env("DEFAULT_STRIKE_STEP", Decimal::from(50)),
            strike_steps: parse_strike_steps(
                &env::var("STRIKE_STEPS").unwrap_or_else(|_| "BANKNIFTY=100".to_string()),
            ),
            latency_sample_rate: parse_env("LATENCY_SAMPLE_RATE", 10),
            latency_alert_threshold_ms: parse_env("LATENCY_ALERT_THRESHOLD_MS", 500),
            latency_alert_cooldown_secs: parse_env("LATENCY_ALERT_COOLDOWN_SECS", 10),
            latency_ring_capacity: parse_env("LATENCY_RING_CAPACITY", 1024),
            latency_dominant_share: parse_env("LATENCY_DOMINANT_SHARE", 0.3),
            queue_alarm_fraction: parse_env("QUEUE_ALARM_FRACTION", 0.8),
            stage_latency_ceiling_ms: parse_env("STAGE_LATENCY_CEILING_MS", 250),
            health_poll_secs: parse_env("HEALTH_POLL_SECS", 15),
            rest_min_interval_ms: parse_env("REST_MIN_INTERVAL_MS", 250),
            rest_max_retries: parse_env("REST_MAX_RETRIES", 3),
            request_timeout_secs: parse_env("REQUEST_TIMEOUT_SECS", 10),
            ws_read_timeout_secs: parse_env("WS_READ_TIMEOUT_SECS", 45),
            reconnect_delay_ms: parse_env("RECONNECT_DELAY_MS", 1000),
            max_backoff_ms: parse_env("MAX_BACKOFF_MS", 60_000),
        })
    }

    /// Strike step for a symbol, falling back to the default
    pub fn strike_step(&self, symbol: &str) -> Decimal {
        self.strike_steps
            .get(symbol)
            .copied()
            .unwrap_or(self.default_strike_step)
    }
}

fn parse_env<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_decimal_env(key: &str, default: Decimal) -> Decimal {
    env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(&v).ok())
        .unwrap_or(default)
}

fn parse_strike_steps(raw: &str) -> HashMap<String, Decimal> {
    raw.split(',')
        .filter_map(|pair| {
            let (symbol, step) = pair.split_once('=')?;
            Some((
                symbol.trim().to_uppercase(),
                Decimal::from_str(step.trim()).ok()?,
            ))
        })
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec![SymbolConfig {
                symbol: "NIFTY".to_string(),
                expiry: "2025-01-30".to_string(),
            }],
            ws_endpoint: "wss://feed.chainflow.internal/v3/marketdata".to_string(),
            rest_endpoint: "https://api.chainflow.internal/v2".to_string(),
            ipc_socket_path: "/tmp/chainflow.sock".to_string(),
            health_port: 9090,
            raw_queue_capacity: 8192,
            decoded_queue_capacity: 4096,
            signal_queue_capacity: 1024,
            decode_workers: 2,
            strategy_workers: 4,
            broadcast_workers: 2,
            queue_poll_ms: 100,
            strategy_timeout_ms: 2000,
            broadcast_timeout_ms: 1000,
            batch_compute_ms: 500,
            oi_refresh_secs: 60,
            window_half_width: 10,
            rebalance_hysteresis: 2,
            default_strike_step: Decimal::from(50),
            strike_steps: HashMap::from([("BANKNIFTY".to_string(), Decimal::from(100))]),
            latency_sample_rate: 10,
            latency_alert_threshold_ms: 500,
            latency_alert_cooldown_secs: 10,
            latency_ring_capacity: 1024,
            latency_dominant_share: 0.3,
            queue_alarm_fraction: 0.8,
            stage_latency_ceiling_ms: 250,
            health_poll_secs: 15,
            rest_min_interval_ms: 250,
            rest_max_retries: 3,
            request_timeout_secs: 10,
            ws_read_timeout_secs: 45,
            reconnect_delay_ms: 1000,
            max_backoff_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_symbol_config_parse() {
        let sc = SymbolConfig::parse("nifty:2025-01-30").unwrap();
        assert_eq!(sc.symbol, "NIFTY");
        assert_eq!(sc.expiry, "2025-01-30");

        assert!(SymbolConfig::parse("NIFTY").is_none());
        assert!(SymbolConfig::parse(":2025-01-30").is_none());
    }

    #[test]
    fn test_strike_step_lookup() {
        let config = Config::default();
        assert_eq!(config.strike_step("NIFTY"), dec!(50));
        assert_eq!(config.strike_step("BANKNIFTY"), dec!(100));
    }

    #[test]
    fn test_parse_strike_steps() {
        let steps = parse_strike_steps("BANKNIFTY=100, finnifty=40");
        assert_eq!(steps.get("BANKNIFTY"), Some(&dec!(100)));
        assert_eq!(steps.get("FINNIFTY"), Some(&dec!(40)));
    }
}
