//! Strategy callback seam
//!
//! Signal scoring itself is host-defined; the pipeline only owns the
//! registration surface and the isolation/timeout rules around callbacks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::ChainContext;
use crate::decoder::FeedTick;

/// Trade-direction label produced by a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// A scored signal emitted by a strategy callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub strategy: String,
    pub symbol: String,
    pub expiry: String,
    pub action: SignalAction,
    /// Strategy-defined confidence in [0, 1]
    pub score: f64,
    pub reason: String,
    pub generated_at: DateTime<Utc>,
}

/// A registered signal-scoring callback
///
/// `evaluate` runs on the blocking pool under the combined strategy
/// timeout; it must be CPU-cheap and must not block on I/O. Returning
/// None means no signal for this tick.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, tick: &FeedTick, context: &ChainContext) -> Option<Signal>;
}

/// Rule-based PCR threshold scoring
///
/// Emits BUY below the lower threshold and SELL above the upper one;
/// in-band readings produce no signal rather than a HOLD per tick.
#[derive(Debug, Clone)]
pub struct PcrThresholdStrategy {
    pub buy_below: f64,
    pub sell_above: f64,
}

impl Default for PcrThresholdStrategy {
    fn default() -> Self {
        Self {
            buy_below: 0.7,
            sell_above: 1.3,
        }
    }
}

impl Strategy for PcrThresholdStrategy {
    fn name(&self) -> &str {
        "pcr_threshold"
    }

    fn evaluate(&self, _tick: &FeedTick, context: &ChainContext) -> Option<Signal> {
        // No reading without OI on both sides
        if context.adjusted_call_oi == 0 || context.adjusted_put_oi == 0 {
            return None;
        }

        let pcr = context.pcr;
        let action = if pcr <= self.buy_below {
            SignalAction::Buy
        } else if pcr >= self.sell_above {
            SignalAction::Sell
        } else {
            return None;
        };

        let distance = match action {
            SignalAction::Buy => (self.buy_below - pcr) / self.buy_below,
            _ => (pcr - self.sell_above) / self.sell_above,
        };

        Some(Signal {
            strategy: self.name().to_string(),
            symbol: context.symbol.clone(),
            expiry: context.expiry.clone(),
            action,
            score: distance.clamp(0.0, 1.0),
            reason: format!("pcr={:.3}", pcr),
            generated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::TickPayload;
    use rust_decimal_macros::dec;

    fn context(pcr: f64, call_oi: u64, put_oi: u64) -> ChainContext {
        ChainContext {
            symbol: "NIFTY".to_string(),
            expiry: "2025-01-30".to_string(),
            spot: Some(dec!(23500)),
            atm_strike: Some(dec!(23500)),
            pcr,
            adjusted_call_oi: call_oi,
            adjusted_put_oi: put_oi,
        }
    }

    fn tick() -> FeedTick {
        FeedTick {
            instrument_key: "NSE_INDEX|Nifty 50".to_string(),
            timestamp_ms: 1,
            payload: TickPayload::Spot { ltp: dec!(23500) },
        }
    }

    #[test]
    fn test_buy_below_threshold() {
        let strategy = PcrThresholdStrategy::default();
        let signal = strategy.evaluate(&tick(), &context(0.5, 100, 50)).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        assert!(signal.score > 0.0);
    }

    #[test]
    fn test_sell_above_threshold() {
        let strategy = PcrThresholdStrategy::default();
        let signal = strategy.evaluate(&tick(), &context(1.8, 100, 180)).unwrap();
        assert_eq!(signal.action, SignalAction::Sell);
    }

    #[test]
    fn test_in_band_is_silent() {
        let strategy = PcrThresholdStrategy::default();
        assert!(strategy.evaluate(&tick(), &context(1.0, 100, 100)).is_none());
    }

    #[test]
    fn test_no_signal_without_oi() {
        let strategy = PcrThresholdStrategy::default();
        assert!(strategy.evaluate(&tick(), &context(0.0, 0, 0)).is_none());
    }
}
