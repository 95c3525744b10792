//! Broker collaborator interfaces
//!
//! The core consumes the broker through these traits; the OAuth flow,
//! HTTP plumbing and instrument discovery all live behind them.

mod rest;

pub use rest::{RateLimiter, RestBroker};

use futures_util::future::BoxFuture;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::chain::StrikeMap;
use crate::error::Result;

#[cfg(test)]
use mockall::automock;

/// Full-chain open-interest snapshot from the REST baseline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OiSnapshot {
    pub call_oi: u64,
    pub put_oi: u64,
    /// Strike -> (call OI, put OI)
    pub per_strike: BTreeMap<Decimal, (u64, u64)>,
}

/// Source of a valid broker access token
///
/// The token exchange/refresh flow is host-owned; the core only needs a
/// usable token on demand.
#[cfg_attr(test, automock)]
pub trait TokenProvider: Send + Sync {
    fn valid_token(&self) -> BoxFuture<'static, Result<String>>;
}

/// Periodic full-chain OI source
#[cfg_attr(test, automock)]
pub trait OiSource: Send + Sync {
    fn fetch_full_chain_oi(
        &self,
        symbol: &str,
        expiry: &str,
    ) -> BoxFuture<'static, Result<OiSnapshot>>;
}

/// Instrument inventory discovery
#[cfg_attr(test, automock)]
pub trait InstrumentRegistry: Send + Sync {
    fn resolve_instruments(
        &self,
        symbol: &str,
        expiry: &str,
    ) -> BoxFuture<'static, Result<StrikeMap>>;
}

/// REST fallback for the underlying spot quote
#[cfg_attr(test, automock)]
pub trait SpotSource: Send + Sync {
    fn fetch_spot(&self, symbol: &str) -> BoxFuture<'static, Result<Decimal>>;
}

/// Serializes token access across callers
///
/// Concurrent callers hitting an expired token would otherwise trigger a
/// refresh storm against the broker.
pub struct SharedTokenGate {
    inner: Arc<dyn TokenProvider>,
    gate: Mutex<()>,
}

impl SharedTokenGate {
    pub fn new(inner: Arc<dyn TokenProvider>) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }

    pub async fn valid_token(&self) -> Result<String> {
        let _guard = self.gate.lock().await;
        self.inner.valid_token().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProvider {
        calls: Arc<AtomicU32>,
        in_flight: Arc<AtomicU32>,
    }

    impl TokenProvider for CountingProvider {
        fn valid_token(&self) -> BoxFuture<'static, Result<String>> {
            let calls = self.calls.clone();
            let in_flight = self.in_flight.clone();
            Box::pin(async move {
                let concurrent = in_flight.fetch_add(1, Ordering::SeqCst);
                assert_eq!(concurrent, 0, "token refresh must be serialized");
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("token".to_string())
            })
        }
    }

    #[tokio::test]
    async fn test_token_gate_serializes_callers() {
        let calls = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(SharedTokenGate::new(Arc::new(CountingProvider {
            calls: calls.clone(),
            in_flight: Arc::new(AtomicU32::new(0)),
        })));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.valid_token().await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }
}
