//! Option chain module
//!
//! Maintains the live per-(symbol, expiry) chain view inside the ATM
//! window and reconciles open interest from the REST baseline and the
//! windowed tick stream.

mod manager;
mod state;
pub mod window;

pub use manager::ChainManager;
pub use state::ChainState;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::decoder::Greeks;

/// Identifies one aggregated chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainKey {
    pub symbol: String,
    pub expiry: String,
}

impl ChainKey {
    pub fn new(symbol: impl Into<String>, expiry: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            expiry: expiry.into(),
        }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.expiry)
    }
}

/// Call or put leg of a strike
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionSide {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

/// Instrument keys for both legs of one strike
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentPair {
    pub ce: String,
    pub pe: String,
}

/// Static instrument inventory for one chain, loaded from the registry
///
/// Immutable after load.
#[derive(Debug, Clone)]
pub struct StrikeMap {
    pub strikes: BTreeMap<Decimal, InstrumentPair>,
    /// Instrument key of the underlying index/spot
    pub spot_key: String,
    pub strike_step: Decimal,
}

impl StrikeMap {
    /// All known strikes in ascending order
    pub fn strike_prices(&self) -> Vec<Decimal> {
        self.strikes.keys().copied().collect()
    }
}

/// Live quote for one option leg, last-write-wins per field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionQuote {
    pub ltp: Decimal,
    pub volume: u64,
    pub open_interest: u64,
    pub bid: Decimal,
    pub ask: Decimal,
    pub greeks: Option<Greeks>,
    /// Exchange timestamp of the tick that wrote these fields
    pub updated_at_ms: i64,
}

/// Both legs of one strike in the live chain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrikeQuote {
    pub ce: Option<OptionQuote>,
    pub pe: Option<OptionQuote>,
}

/// Diagnostic record of every OI reconciliation input and output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OiBreakdown {
    pub global_call_oi: u64,
    pub global_put_oi: u64,
    pub window_call_oi: u64,
    pub window_put_oi: u64,
    pub rest_window_call_oi: u64,
    pub rest_window_put_oi: u64,
    pub adjusted_call_oi: u64,
    pub adjusted_put_oi: u64,
    pub last_oi_update: Option<i64>,
}

/// One side's row in the broadcast payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrikeRow {
    pub strike: Decimal,
    pub ltp: Decimal,
    pub oi: u64,
    pub volume: u64,
    pub bid: Decimal,
    pub ask: Decimal,
    pub iv: Option<f64>,
}

/// Coalesced chain payload broadcast once per compute cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainPayload {
    pub symbol: String,
    pub expiry: String,
    pub spot: Decimal,
    pub calls: Vec<StrikeRow>,
    pub puts: Vec<StrikeRow>,
    pub pcr: f64,
    pub timestamp: DateTime<Utc>,
    pub oi_breakdown: OiBreakdown,
}

/// Result of materializing a chain
///
/// Explicit variants instead of error-driven control flow: a chain with
/// no spot price yet is a normal condition, not a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainBuild {
    Ready(ChainPayload),
    Insufficient(String),
}

impl ChainBuild {
    pub fn ready(self) -> Option<ChainPayload> {
        match self {
            ChainBuild::Ready(payload) => Some(payload),
            ChainBuild::Insufficient(_) => None,
        }
    }
}

/// Cheap point-in-time summary handed to strategy callbacks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainContext {
    pub symbol: String,
    pub expiry: String,
    pub spot: Option<Decimal>,
    pub atm_strike: Option<Decimal>,
    pub pcr: f64,
    pub adjusted_call_oi: u64,
    pub adjusted_put_oi: u64,
}

/// Subscription intents produced by a window rebalance
///
/// Unsubscribes are issued before subscribes to bound the number of
/// concurrent subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDiff {
    pub to_unsubscribe: Vec<String>,
    pub to_subscribe: Vec<String>,
}

impl SubscriptionDiff {
    pub fn is_empty(&self) -> bool {
        self.to_unsubscribe.is_empty() && self.to_subscribe.is_empty()
    }
}
