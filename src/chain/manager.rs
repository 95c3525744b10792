//! Chain manager
//!
//! Owns one `ChainState` per (symbol, expiry) and routes decoded ticks to
//! the chain that subscribes their instrument key. Each chain sits behind
//! its own lock so symbols never contend with each other.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ChainKey, ChainState, StrikeMap};
use crate::decoder::FeedTick;

/// Registry of live chains, one per (symbol, expiry)
#[derive(Debug, Default)]
pub struct ChainManager {
    chains: RwLock<HashMap<ChainKey, Arc<RwLock<ChainState>>>>,
    /// Instrument key -> owning chain, rebuilt on insert/remove
    routes: RwLock<HashMap<String, ChainKey>>,
}

impl ChainManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chain from its registry-loaded strike map
    ///
    /// All instrument keys the chain can ever subscribe to are routed at
    /// insert time since the strike map is immutable after load.
    pub async fn insert_chain(
        &self,
        key: ChainKey,
        strike_map: StrikeMap,
        window_half_width: u32,
        rebalance_hysteresis: u32,
    ) -> Arc<RwLock<ChainState>> {
        let mut routes = self.routes.write().await;
        routes.insert(strike_map.spot_key.clone(), key.clone());
        for pair in strike_map.strikes.values() {
            routes.insert(pair.ce.clone(), key.clone());
            routes.insert(pair.pe.clone(), key.clone());
        }
        drop(routes);

        let state = Arc::new(RwLock::new(ChainState::new(
            key.clone(),
            strike_map,
            window_half_width,
            rebalance_hysteresis,
        )));
        self.chains.write().await.insert(key, state.clone());
        state
    }

    /// Drop a chain and its instrument routes
    pub async fn remove_chain(&self, key: &ChainKey) {
        self.chains.write().await.remove(key);
        self.routes.write().await.retain(|_, k| k != key);
    }

    pub async fn get(&self, key: &ChainKey) -> Option<Arc<RwLock<ChainState>>> {
        self.chains.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<ChainKey> {
        self.chains.read().await.keys().cloned().collect()
    }

    /// Chain owning the given instrument key, if any
    pub async fn route(&self, instrument_key: &str) -> Option<Arc<RwLock<ChainState>>> {
        let key = self.routes.read().await.get(instrument_key).cloned()?;
        self.get(&key).await
    }

    /// Apply a tick to the owning chain
    ///
    /// Returns the chain it was applied to, or None if no chain routes
    /// the instrument or the tick was stale.
    pub async fn apply_tick(&self, tick: &FeedTick) -> Option<Arc<RwLock<ChainState>>> {
        let chain = self.route(&tick.instrument_key).await?;
        let applied = chain.write().await.apply_tick(tick);
        applied.then_some(chain)
    }

    /// Union of every chain's active instrument keys
    ///
    /// Used to re-subscribe after a reconnect.
    pub async fn all_active_keys(&self) -> Vec<String> {
        let chains = self.chains.read().await;
        let mut keys = Vec::new();
        for chain in chains.values() {
            keys.extend(chain.read().await.active_keys().iter().cloned());
        }
        keys.sort();
        keys.dedup();
        keys
    }
}
