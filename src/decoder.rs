//! Decoder for broker binary feed frames
//!
//! Translates raw WebSocket frames into typed ticks. Decoding is pure and
//! stateless; a malformed frame is an error the caller counts and drops.

use bytes::Buf;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{FeedError, Result};

/// Frame kind markers on the wire
const KIND_OPTION_QUOTE: u8 = 1;
const KIND_INDEX_SPOT: u8 = 2;

/// Option greeks carried on full-mode quote frames
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub theta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub iv: f64,
}

/// Quote fields for a single option instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteData {
    pub ltp: Decimal,
    pub volume: u64,
    pub open_interest: u64,
    pub bid: Decimal,
    pub ask: Decimal,
    pub greeks: Option<Greeks>,
}

/// Decoded tick payload, by frame kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TickPayload {
    Quote(QuoteData),
    Spot { ltp: Decimal },
}

/// A decoded feed tick
///
/// Immutable once decoded; consumed exactly once by the apply step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedTick {
    pub instrument_key: String,
    /// Exchange timestamp in milliseconds
    pub timestamp_ms: i64,
    pub payload: TickPayload,
}

impl FeedTick {
    pub fn is_spot(&self) -> bool {
        matches!(self.payload, TickPayload::Spot { .. })
    }
}

/// Decode a single binary frame
///
/// Wire layout (big endian):
/// `u8` kind, `u8` key length, key bytes, `i64` exchange timestamp (ms),
/// then the kind-specific body. Option quotes carry
/// `f64 ltp, u64 volume, u64 oi, f64 bid, f64 ask, u8 greeks_flag`
/// with five trailing `f64` greeks when the flag is set; spot frames
/// carry a single `f64 ltp`.
pub fn decode(raw: &[u8]) -> Result<FeedTick> {
    let mut buf = raw;

    ensure(buf, 1, "kind")?;
    let kind = buf.get_u8();
    ensure(buf, 1, "key length")?;
    let key_len = buf.get_u8() as usize;
    if key_len == 0 {
        return Err(FeedError::Decode("empty instrument key".to_string()));
    }

    ensure(buf, key_len, "instrument key")?;
    let instrument_key = std::str::from_utf8(&buf[..key_len])
        .map_err(|e| FeedError::Decode(format!("instrument key not UTF-8: {}", e)))?
        .to_string();
    buf.advance(key_len);

    ensure(buf, 8, "timestamp")?;
    let timestamp_ms = buf.get_i64();

    let payload = match kind {
        KIND_OPTION_QUOTE => {
            let ltp = read_price(&mut buf, "ltp")?;
            ensure(buf, 16, "volume and open interest")?;
            let volume = buf.get_u64();
            let open_interest = buf.get_u64();
            let bid = read_price(&mut buf, "bid")?;
            let ask = read_price(&mut buf, "ask")?;
            ensure(buf, 1, "greeks flag")?;
            let greeks = match buf.get_u8() {
                0 => None,
                1 => {
                    ensure(buf, 40, "greeks block")?;
                    Some(Greeks {
                        delta: buf.get_f64(),
                        theta: buf.get_f64(),
                        gamma: buf.get_f64(),
                        vega: buf.get_f64(),
                        iv: buf.get_f64(),
                    })
                }
                flag => {
                    return Err(FeedError::Decode(format!("invalid greeks flag: {}", flag)));
                }
            };
            TickPayload::Quote(QuoteData {
                ltp,
                volume,
                open_interest,
                bid,
                ask,
                greeks,
            })
        }
        KIND_INDEX_SPOT => TickPayload::Spot {
            ltp: read_price(&mut buf, "spot ltp")?,
        },
        other => {
            return Err(FeedError::Decode(format!("unknown frame kind: {}", other)));
        }
    };

    if buf.has_remaining() {
        return Err(FeedError::Decode(format!(
            "{} trailing bytes after frame",
            buf.remaining()
        )));
    }

    Ok(FeedTick {
        instrument_key,
        timestamp_ms,
        payload,
    })
}

fn ensure(buf: &[u8], n: usize, field: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(FeedError::Decode(format!(
            "truncated frame reading {} (need {}, have {})",
            field,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn read_price(buf: &mut &[u8], field: &str) -> Result<Decimal> {
    ensure(buf, 8, field)?;
    let raw = buf.get_f64();
    Decimal::from_f64(raw)
        .ok_or_else(|| FeedError::Decode(format!("non-finite {}: {}", field, raw)))
}

/// Frame builders for fixtures and benchmarks
///
/// The service never encodes feed frames in production; these mirror the
/// broker's layout so tests can synthesize traffic.
pub mod frames {
    use bytes::BufMut;

    use super::{Greeks, KIND_INDEX_SPOT, KIND_OPTION_QUOTE};

    pub fn option_quote(
        instrument_key: &str,
        timestamp_ms: i64,
        ltp: f64,
        volume: u64,
        open_interest: u64,
        bid: f64,
        ask: f64,
        greeks: Option<Greeks>,
    ) -> Vec<u8> {
        let mut frame = Vec::with_capacity(64 + instrument_key.len());
        frame.put_u8(KIND_OPTION_QUOTE);
        frame.put_u8(instrument_key.len() as u8);
        frame.put_slice(instrument_key.as_bytes());
        frame.put_i64(timestamp_ms);
        frame.put_f64(ltp);
        frame.put_u64(volume);
        frame.put_u64(open_interest);
        frame.put_f64(bid);
        frame.put_f64(ask);
        match greeks {
            Some(g) => {
                frame.put_u8(1);
                frame.put_f64(g.delta);
                frame.put_f64(g.theta);
                frame.put_f64(g.gamma);
                frame.put_f64(g.vega);
                frame.put_f64(g.iv);
            }
            None => frame.put_u8(0),
        }
        frame
    }

    pub fn index_spot(instrument_key: &str, timestamp_ms: i64, ltp: f64) -> Vec<u8> {
        let mut frame = Vec::with_capacity(24 + instrument_key.len());
        frame.put_u8(KIND_INDEX_SPOT);
        frame.put_u8(instrument_key.len() as u8);
        frame.put_slice(instrument_key.as_bytes());
        frame.put_i64(timestamp_ms);
        frame.put_f64(ltp);
        frame
    }
}
