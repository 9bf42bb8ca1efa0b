// =============================================================================
// Active Trade Index — O(1) symbol → open trades lookup for exit monitoring
// =============================================================================
//
// Forward map {symbol → set(tradeId)} plus a reverse map {tradeId → symbol},
// kept consistent under one lock discipline (forward before reverse).
// Derived state: rebuilt from the durable store on startup, mutated only by
// the trade state machine afterwards.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::trade::Trade;

pub struct ActiveTradeIndex {
    by_symbol: RwLock<HashMap<String, HashSet<String>>>,
    by_trade: RwLock<HashMap<String, String>>,
}

impl ActiveTradeIndex {
    pub fn new() -> Self {
        Self {
            by_symbol: RwLock::new(HashMap::new()),
            by_trade: RwLock::new(HashMap::new()),
        }
    }

    /// Clear and reload from a set of open trades.
    pub fn rebuild(&self, open_trades: &[Trade]) {
        let mut by_symbol = self.by_symbol.write();
        let mut by_trade = self.by_trade.write();
        by_symbol.clear();
        by_trade.clear();

        for trade in open_trades {
            by_symbol
                .entry(trade.symbol.clone())
                .or_default()
                .insert(trade.trade_id.clone());
            by_trade.insert(trade.trade_id.clone(), trade.symbol.clone());
        }
    }

    pub fn add_trade(&self, symbol: &str, trade_id: &str) {
        let mut by_symbol = self.by_symbol.write();
        let mut by_trade = self.by_trade.write();
        by_symbol
            .entry(symbol.to_string())
            .or_default()
            .insert(trade_id.to_string());
        by_trade.insert(trade_id.to_string(), symbol.to_string());
    }

    /// Remove a trade; an empty symbol bucket is dropped entirely.
    pub fn remove_trade(&self, trade_id: &str) {
        let mut by_symbol = self.by_symbol.write();
        let mut by_trade = self.by_trade.write();

        if let Some(symbol) = by_trade.remove(trade_id) {
            if let Some(bucket) = by_symbol.get_mut(&symbol) {
                bucket.remove(trade_id);
                if bucket.is_empty() {
                    by_symbol.remove(&symbol);
                }
            }
        }
    }

    /// Snapshot copy of the open trade ids for a symbol.
    pub fn get_open_trades(&self, symbol: &str) -> Vec<String> {
        self.by_symbol
            .read()
            .get(symbol)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn symbol_of(&self, trade_id: &str) -> Option<String> {
        self.by_trade.read().get(trade_id).cloned()
    }

    pub fn contains(&self, trade_id: &str) -> bool {
        self.by_trade.read().contains_key(trade_id)
    }

    pub fn len(&self) -> usize {
        self.by_trade.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_trade.read().is_empty()
    }
}

impl Default for ActiveTradeIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActiveTradeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTradeIndex")
            .field("trades", &self.by_trade.read().len())
            .field("symbols", &self.by_symbol.read().len())
            .finish()
    }
}
