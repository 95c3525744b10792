//! Live chain state and OI delta-sync reconciliation
//!
//! One `ChainState` exists per (symbol, expiry). The windowed WS feed and
//! the periodic full-chain REST baseline disagree in scope and freshness;
//! the adjusted-OI formula substitutes the REST-known window OI with the
//! fresher WS-known window OI without double counting.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::window::{compute_atm, diff_keys, should_rebalance, window};
use super::{
    ChainBuild, ChainContext, ChainKey, ChainPayload, InstrumentPair, OiBreakdown, OptionQuote,
    OptionSide, StrikeMap, StrikeQuote, StrikeRow, SubscriptionDiff,
};
use crate::decoder::{FeedTick, TickPayload};

/// Live view of one option chain inside its ATM window
#[derive(Debug)]
pub struct ChainState {
    key: ChainKey,
    strike_map: StrikeMap,
    /// Instrument key -> (strike, side) routing index, derived once
    instrument_index: HashMap<String, (Decimal, OptionSide)>,
    /// Quotes keyed by strike, sorted; last-write-wins per leg
    live_chain: BTreeMap<Decimal, StrikeQuote>,
    spot_price: Option<Decimal>,
    spot_updated_ms: i64,
    current_atm: Option<Decimal>,
    subscribed_strikes: BTreeSet<Decimal>,
    active_keys: BTreeSet<String>,
    /// Full-chain OI from the REST baseline
    global_call_oi: u64,
    global_put_oi: u64,
    /// REST-reported OI restricted to the currently subscribed window
    rest_window_call_oi: u64,
    rest_window_put_oi: u64,
    /// Epoch ms of the last REST OI refresh
    last_oi_update: Option<i64>,
    /// Epoch ms of the last applied tick
    last_update_ms: i64,
    window_half_width: u32,
    rebalance_hysteresis: u32,
}

impl ChainState {
    pub fn new(
        key: ChainKey,
        strike_map: StrikeMap,
        window_half_width: u32,
        rebalance_hysteresis: u32,
    ) -> Self {
        let mut instrument_index = HashMap::with_capacity(strike_map.strikes.len() * 2);
        for (strike, pair) in &strike_map.strikes {
            instrument_index.insert(pair.ce.clone(), (*strike, OptionSide::Call));
            instrument_index.insert(pair.pe.clone(), (*strike, OptionSide::Put));
        }

        Self {
            key,
            strike_map,
            instrument_index,
            live_chain: BTreeMap::new(),
            spot_price: None,
            spot_updated_ms: 0,
            current_atm: None,
            subscribed_strikes: BTreeSet::new(),
            active_keys: BTreeSet::new(),
            global_call_oi: 0,
            global_put_oi: 0,
            rest_window_call_oi: 0,
            rest_window_put_oi: 0,
            last_oi_update: None,
            last_update_ms: 0,
            window_half_width,
            rebalance_hysteresis,
        }
    }

    pub fn key(&self) -> &ChainKey {
        &self.key
    }

    pub fn spot_key(&self) -> &str {
        &self.strike_map.spot_key
    }

    pub fn strike_step(&self) -> Decimal {
        self.strike_map.strike_step
    }

    pub fn spot_price(&self) -> Option<Decimal> {
        self.spot_price
    }

    pub fn current_atm(&self) -> Option<Decimal> {
        self.current_atm
    }

    pub fn subscribed_strikes(&self) -> &BTreeSet<Decimal> {
        &self.subscribed_strikes
    }

    pub fn active_keys(&self) -> &BTreeSet<String> {
        &self.active_keys
    }

    /// Exchange timestamp of the most recent applied tick
    pub fn last_update_ms(&self) -> i64 {
        self.last_update_ms
    }

    /// Whether this chain routes the given instrument key
    pub fn owns_instrument(&self, instrument_key: &str) -> bool {
        instrument_key == self.strike_map.spot_key
            || self.instrument_index.contains_key(instrument_key)
    }

    /// Apply one decoded tick
    ///
    /// Routes by instrument key to the CE/PE slot of the matching strike,
    /// or to the spot price for the index key. All fields of one tick are
    /// applied in this single call. A tick older than the stored quote
    /// for the same leg is a no-op, so out-of-order applies for one
    /// instrument converge to the newest tick.
    ///
    /// Returns true if the tick mutated state.
    pub fn apply_tick(&mut self, tick: &FeedTick) -> bool {
        match &tick.payload {
            TickPayload::Spot { ltp } => {
                if tick.instrument_key != self.strike_map.spot_key {
                    return false;
                }
                if tick.timestamp_ms < self.spot_updated_ms {
                    return false;
                }
                self.spot_price = Some(*ltp);
                self.spot_updated_ms = tick.timestamp_ms;
                self.last_update_ms = self.last_update_ms.max(tick.timestamp_ms);
                true
            }
            TickPayload::Quote(quote) => {
                let Some((strike, side)) = self.instrument_index.get(&tick.instrument_key) else {
                    return false;
                };
                let (strike, side) = (*strike, *side);

                let slot = self.live_chain.entry(strike).or_default();
                let leg = match side {
                    OptionSide::Call => &mut slot.ce,
                    OptionSide::Put => &mut slot.pe,
                };
                if let Some(existing) = leg {
                    if tick.timestamp_ms < existing.updated_at_ms {
                        return false;
                    }
                }
                *leg = Some(OptionQuote {
                    ltp: quote.ltp,
                    volume: quote.volume,
                    open_interest: quote.open_interest,
                    bid: quote.bid,
                    ask: quote.ask,
                    greeks: quote.greeks,
                    updated_at_ms: tick.timestamp_ms,
                });
                self.last_update_ms = self.last_update_ms.max(tick.timestamp_ms);
                true
            }
        }
    }

    /// Seed the spot price from a REST quote when no tick has arrived yet
    pub fn set_spot_fallback(&mut self, spot: Decimal) {
        if self.spot_price.is_none() {
            self.spot_price = Some(spot);
        }
    }

    /// Record a full-chain OI refresh from the REST baseline
    ///
    /// `rest_window_call/put` are the REST-reported OI restricted to the
    /// currently subscribed strikes, computed by the caller.
    pub fn refresh_global_oi(
        &mut self,
        call_oi: u64,
        put_oi: u64,
        rest_window_call: u64,
        rest_window_put: u64,
    ) {
        self.global_call_oi = call_oi;
        self.global_put_oi = put_oi;
        self.rest_window_call_oi = rest_window_call;
        self.rest_window_put_oi = rest_window_put;
        self.last_oi_update = Some(Utc::now().timestamp_millis());
    }

    /// Restrict a per-strike REST OI report to the subscribed window
    ///
    /// Returns (call, put) totals over `subscribed_strikes`.
    pub fn window_restrict(&self, per_strike: &BTreeMap<Decimal, (u64, u64)>) -> (u64, u64) {
        per_strike
            .iter()
            .filter(|(strike, _)| self.subscribed_strikes.contains(*strike))
            .fold((0, 0), |(c, p), (_, (call, put))| (c + call, p + put))
    }

    /// WS-accumulated OI over the currently subscribed window
    fn window_ws_oi(&self) -> (u64, u64) {
        self.subscribed_strikes
            .iter()
            .filter_map(|strike| self.live_chain.get(strike))
            .fold((0, 0), |(c, p), quote| {
                (
                    c + quote.ce.as_ref().map_or(0, |q| q.open_interest),
                    p + quote.pe.as_ref().map_or(0, |q| q.open_interest),
                )
            })
    }

    /// Delta-sync adjusted OI, clamped at zero
    ///
    /// `adjusted = global - rest_window + ws_window`: the stale REST view
    /// of the window is replaced by the fresh WS view, leaving the
    /// out-of-window REST OI untouched.
    pub fn adjusted_oi(&self) -> (u64, u64) {
        let (ws_call, ws_put) = self.window_ws_oi();
        let call = self.global_call_oi as i128 - self.rest_window_call_oi as i128 + ws_call as i128;
        let put = self.global_put_oi as i128 - self.rest_window_put_oi as i128 + ws_put as i128;
        (call.max(0) as u64, put.max(0) as u64)
    }

    /// Put-call ratio over adjusted OI; 0 when call OI is 0
    pub fn pcr(&self) -> f64 {
        let (call, put) = self.adjusted_oi();
        if call == 0 {
            0.0
        } else {
            put as f64 / call as f64
        }
    }

    pub fn oi_breakdown(&self) -> OiBreakdown {
        let (ws_call, ws_put) = self.window_ws_oi();
        let (adjusted_call, adjusted_put) = self.adjusted_oi();
        OiBreakdown {
            global_call_oi: self.global_call_oi,
            global_put_oi: self.global_put_oi,
            window_call_oi: ws_call,
            window_put_oi: ws_put,
            rest_window_call_oi: self.rest_window_call_oi,
            rest_window_put_oi: self.rest_window_put_oi,
            adjusted_call_oi: adjusted_call,
            adjusted_put_oi: adjusted_put,
            last_oi_update: self.last_oi_update,
        }
    }

    /// Recompute the ATM window and swap subscriptions if spot moved enough
    ///
    /// Returns the subscription diff to issue, or None when the window is
    /// unchanged. Until the first spot price arrives no option window
    /// exists, so only the spot instrument itself is subscribed.
    pub fn maybe_rebalance(&mut self) -> Option<SubscriptionDiff> {
        let Some(spot) = self.spot_price else {
            // Bootstrap: hold only the spot instrument subscription
            if self.active_keys.is_empty() {
                let new_keys = BTreeSet::from([self.strike_map.spot_key.clone()]);
                let diff = diff_keys(&self.active_keys, &new_keys);
                self.active_keys = new_keys;
                return Some(diff);
            }
            return None;
        };

        let new_atm = compute_atm(spot, self.strike_map.strike_step);
        match self.current_atm {
            Some(current)
                if !should_rebalance(
                    current,
                    new_atm,
                    self.strike_map.strike_step,
                    self.rebalance_hysteresis,
                ) =>
            {
                None
            }
            _ => {
                let diff = self.rebalance(new_atm);
                if diff.is_empty() {
                    None
                } else {
                    Some(diff)
                }
            }
        }
    }

    /// Swap the window to the one centered on `new_atm`
    ///
    /// Idempotent: a second call with the same target computes empty
    /// diffs. The strike/key/ATM fields swap together, after the diff is
    /// computed.
    pub fn rebalance(&mut self, new_atm: Decimal) -> SubscriptionDiff {
        let strikes = self.strike_map.strike_prices();
        let new_window = window(
            new_atm,
            &strikes,
            self.window_half_width,
            self.strike_map.strike_step,
        );

        let mut new_keys: BTreeSet<String> =
            BTreeSet::from([self.strike_map.spot_key.clone()]);
        for strike in &new_window {
            if let Some(pair) = self.strike_map.strikes.get(strike) {
                new_keys.insert(pair.ce.clone());
                new_keys.insert(pair.pe.clone());
            }
        }

        let diff = diff_keys(&self.active_keys, &new_keys);
        self.subscribed_strikes = new_window.into_iter().collect();
        self.active_keys = new_keys;
        self.current_atm = Some(new_atm);
        diff
    }

    /// Point-in-time summary for strategy callbacks
    pub fn context(&self) -> ChainContext {
        let (adjusted_call, adjusted_put) = self.adjusted_oi();
        ChainContext {
            symbol: self.key.symbol.clone(),
            expiry: self.key.expiry.clone(),
            spot: self.spot_price,
            atm_strike: self.current_atm,
            pcr: self.pcr(),
            adjusted_call_oi: adjusted_call,
            adjusted_put_oi: adjusted_put,
        }
    }

    /// Materialize the strike-sorted final chain
    ///
    /// Side-effect-free and safe to call repeatedly. A chain without a
    /// spot price cannot place its ATM window and reports Insufficient.
    pub fn build_final_chain(&self) -> ChainBuild {
        let Some(spot) = self.spot_price else {
            return ChainBuild::Insufficient("spot price not yet known".to_string());
        };

        let mut calls = Vec::with_capacity(self.live_chain.len());
        let mut puts = Vec::with_capacity(self.live_chain.len());
        for (strike, quote) in &self.live_chain {
            if let Some(ce) = &quote.ce {
                calls.push(strike_row(*strike, ce));
            }
            if let Some(pe) = &quote.pe {
                puts.push(strike_row(*strike, pe));
            }
        }

        ChainBuild::Ready(ChainPayload {
            symbol: self.key.symbol.clone(),
            expiry: self.key.expiry.clone(),
            spot,
            calls,
            puts,
            pcr: self.pcr(),
            timestamp: Utc::now(),
            oi_breakdown: self.oi_breakdown(),
        })
    }
}

fn strike_row(strike: Decimal, quote: &OptionQuote) -> StrikeRow {
    StrikeRow {
        strike,
        ltp: quote.ltp,
        oi: quote.open_interest,
        volume: quote.volume,
        bid: quote.bid,
        ask: quote.ask,
        iv: quote.greeks.map(|g| g.iv),
    }
}
