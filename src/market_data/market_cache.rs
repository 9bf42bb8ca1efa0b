// =============================================================================
// Market Data Cache — latest traded price per symbol
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

/// Last trade per symbol: (price, tick time in epoch ms). Written by the
/// tick pipeline, read by anything needing an O(1) LTP lookup.
pub struct MarketDataCache {
    last: RwLock<HashMap<String, (f64, i64)>>,
}

impl MarketDataCache {
    pub fn new() -> Self {
        Self {
            last: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, symbol: &str, price: f64, ts_ms: i64) {
        self.last.write().insert(symbol.to_string(), (price, ts_ms));
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last.read().get(symbol).map(|(p, _)| *p)
    }

    pub fn last_tick_at(&self, symbol: &str) -> Option<i64> {
        self.last.read().get(symbol).map(|(_, ts)| *ts)
    }
}

impl Default for MarketDataCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MarketDataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataCache")
            .field("symbols", &self.last.read().len())
            .finish()
    }
}
