//! Broker REST client
//!
//! Implements OI refresh, instrument discovery and the spot fallback
//! over HTTP with a global rate limit shared across all symbols and
//! bounded backoff on 429.

use futures_util::future::BoxFuture;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{InstrumentRegistry, OiSnapshot, OiSource, SharedTokenGate, SpotSource};
use crate::chain::{InstrumentPair, StrikeMap};
use crate::error::{FeedError, Result};

/// Minimum-interval limiter shared by every REST call in the process
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Wait until the minimum inter-request delay has passed
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Broker REST API client
pub struct RestBroker {
    client: reqwest::Client,
    base_url: String,
    token: Arc<SharedTokenGate>,
    limiter: Arc<RateLimiter>,
    max_retries: u32,
}

impl RestBroker {
    pub fn new(
        base_url: impl Into<String>,
        token: Arc<SharedTokenGate>,
        limiter: Arc<RateLimiter>,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FeedError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token,
            limiter,
            max_retries,
        })
    }

    /// GET a JSON resource with rate limiting, auth and 429 backoff
    async fn get_json<T: DeserializeOwned>(&self, path: String) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);

        for attempt in 0..=self.max_retries {
            self.limiter.acquire().await;
            let token = self.token.valid_token().await?;

            let response = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .send()
                .await?;

            match response.status() {
                status if status.is_success() => {
                    return Ok(response.json::<T>().await?);
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(FeedError::AuthRequired(format!(
                        "broker rejected token for {}",
                        url
                    )));
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let delay = retry_delay(&response, attempt);
                    if attempt == self.max_retries {
                        return Err(FeedError::RateLimited {
                            retry_after_ms: delay.as_millis() as u64,
                        });
                    }
                    warn!(
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                status => {
                    return Err(FeedError::Rest(format!("{} returned {}", url, status)));
                }
            }
        }

        // Loop always returns within max_retries + 1 iterations
        Err(FeedError::Rest(format!("retries exhausted for {}", url)))
    }
}

/// Backoff for a 429: honor Retry-After when present, else exponential
fn retry_delay(response: &reqwest::Response, attempt: u32) -> Duration {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_millis(500 * 2u64.pow(attempt.min(6))))
}

#[derive(Debug, Deserialize)]
struct OiStrikeDto {
    strike: Decimal,
    call_oi: u64,
    put_oi: u64,
}

#[derive(Debug, Deserialize)]
struct OiChainDto {
    call_oi: u64,
    put_oi: u64,
    strikes: Vec<OiStrikeDto>,
}

#[derive(Debug, Deserialize)]
struct InstrumentDto {
    strike: Decimal,
    ce_key: String,
    pe_key: String,
}

#[derive(Debug, Deserialize)]
struct InstrumentChainDto {
    spot_key: String,
    strike_step: Decimal,
    instruments: Vec<InstrumentDto>,
}

#[derive(Debug, Deserialize)]
struct SpotQuoteDto {
    ltp: Decimal,
}

impl From<OiChainDto> for OiSnapshot {
    fn from(dto: OiChainDto) -> Self {
        let per_strike: BTreeMap<Decimal, (u64, u64)> = dto
            .strikes
            .into_iter()
            .map(|s| (s.strike, (s.call_oi, s.put_oi)))
            .collect();
        OiSnapshot {
            call_oi: dto.call_oi,
            put_oi: dto.put_oi,
            per_strike,
        }
    }
}

impl From<InstrumentChainDto> for StrikeMap {
    fn from(dto: InstrumentChainDto) -> Self {
        let strikes: BTreeMap<Decimal, InstrumentPair> = dto
            .instruments
            .into_iter()
            .map(|i| {
                (
                    i.strike,
                    InstrumentPair {
                        ce: i.ce_key,
                        pe: i.pe_key,
                    },
                )
            })
            .collect();
        StrikeMap {
            strikes,
            spot_key: dto.spot_key,
            strike_step: dto.strike_step,
        }
    }
}

impl OiSource for RestBroker {
    fn fetch_full_chain_oi(
        &self,
        symbol: &str,
        expiry: &str,
    ) -> BoxFuture<'static, Result<OiSnapshot>> {
        let this = self.clone_handles();
        let path = format!("/option-chain/oi?symbol={}&expiry={}", symbol, expiry);
        Box::pin(async move {
            debug!(path = %path, "Fetching full-chain OI");
            let dto: OiChainDto = this.get_json(path).await?;
            Ok(dto.into())
        })
    }
}

impl InstrumentRegistry for RestBroker {
    fn resolve_instruments(
        &self,
        symbol: &str,
        expiry: &str,
    ) -> BoxFuture<'static, Result<StrikeMap>> {
        let this = self.clone_handles();
        let chain = format!("{}:{}", symbol, expiry);
        let path = format!("/option-chain/instruments?symbol={}&expiry={}", symbol, expiry);
        Box::pin(async move {
            debug!(path = %path, "Resolving instrument registry");
            let dto: InstrumentChainDto = this.get_json(path).await?;
            let map: StrikeMap = dto.into();
            if map.strikes.is_empty() {
                return Err(FeedError::Registry(format!("no instruments for {}", chain)));
            }
            Ok(map)
        })
    }
}

impl SpotSource for RestBroker {
    fn fetch_spot(&self, symbol: &str) -> BoxFuture<'static, Result<Decimal>> {
        let this = self.clone_handles();
        let path = format!("/quote?symbol={}", symbol);
        Box::pin(async move {
            let dto: SpotQuoteDto = this.get_json(path).await?;
            Ok(dto.ltp)
        })
    }
}

impl RestBroker {
    /// Cheap clone: the reqwest client, gate and limiter are all shared
    fn clone_handles(&self) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            limiter: self.limiter.clone(),
            max_retries: self.max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_rate_limiter_spaces_requests() {
        let limiter = RateLimiter::new(Duration::from_millis(30));
        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_oi_chain_dto_into_snapshot() {
        let json = r#"{
            "call_oi": 100000,
            "put_oi": 80000,
            "strikes": [
                {"strike": "23450", "call_oi": 1000, "put_oi": 2000},
                {"strike": "23500", "call_oi": 3000, "put_oi": 4000}
            ]
        }"#;

        let dto: OiChainDto = serde_json::from_str(json).unwrap();
        let snapshot: OiSnapshot = dto.into();
        assert_eq!(snapshot.call_oi, 100_000);
        assert_eq!(snapshot.per_strike.get(&dec!(23500)), Some(&(3000, 4000)));
    }

    #[test]
    fn test_instrument_chain_dto_into_strike_map() {
        let json = r#"{
            "spot_key": "NSE_INDEX|Nifty 50",
            "strike_step": "50",
            "instruments": [
                {"strike": "23500", "ce_key": "NSE_FO|52301", "pe_key": "NSE_FO|52302"}
            ]
        }"#;

        let dto: InstrumentChainDto = serde_json::from_str(json).unwrap();
        let map: StrikeMap = dto.into();
        assert_eq!(map.spot_key, "NSE_INDEX|Nifty 50");
        assert_eq!(map.strike_step, dec!(50));
        assert_eq!(map.strikes[&dec!(23500)].ce, "NSE_FO|52301");
    }

    #[test]
    fn test_spot_quote_dto() {
        let dto: SpotQuoteDto = serde_json::from_str(r#"{"ltp": "23510.35"}"#).unwrap();
        assert_eq!(dto.ltp, dec!(23510.35));
    }
}
