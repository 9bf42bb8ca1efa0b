// =============================================================================
// CandleStore — bounded in-memory ring over the durable candle repository
// =============================================================================
//
// Write-through: every upsert lands in SQLite first, then in a per-
// (symbol, timeframe) deque holding the most recent CACHE_CAPACITY candles,
// newest first. Persistence is authoritative; the cache only short-circuits
// the hot read paths (latest candle, recent window, aggregation ranges).
//
// Cache coverage invariant: a ring is contiguous with the store from its
// oldest entry onward — `warmup` seeds it with the most recent rows and
// every later write goes through this store. A range query is answered from
// the ring only when the ring's oldest entry is at or before the range
// start; otherwise it falls through to the repository.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::store::CandleRepository;
use crate::types::{Candle, Timeframe};

/// Candles retained in memory per (symbol, timeframe).
const CACHE_CAPACITY: usize = 500;

type CacheKey = (String, Timeframe);

pub struct CandleStore {
    repo: Arc<CandleRepository>,
    cache: RwLock<HashMap<CacheKey, VecDeque<Candle>>>,
}

impl CandleStore {
    pub fn new(repo: Arc<CandleRepository>) -> Self {
        Self {
            repo,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite a candle at its {symbol, timeframe, ts} key.
    pub fn upsert(&self, candle: &Candle) -> Result<()> {
        if !candle.is_well_formed() {
            warn!(
                symbol = %candle.symbol,
                timeframe = %candle.timeframe,
                ts = candle.ts,
                "refusing malformed candle (low/high envelope violated)"
            );
            return Ok(());
        }
        self.repo.upsert(candle)?;
        self.cache_insert(candle);
        Ok(())
    }

    /// Upsert a batch in one transaction. Malformed candles are dropped.
    pub fn upsert_batch(&self, candles: &[Candle]) -> Result<usize> {
        let good: Vec<Candle> = candles
            .iter()
            .filter(|c| {
                let ok = c.is_well_formed();
                if !ok {
                    warn!(symbol = %c.symbol, ts = c.ts, "dropping malformed candle from batch");
                }
                ok
            })
            .cloned()
            .collect();

        let written = self.repo.upsert_batch(&good)?;
        for c in &good {
            self.cache_insert(c);
        }
        Ok(written)
    }

    /// Most recent candle for the series.
    pub fn get_latest(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Candle>> {
        {
            let cache = self.cache.read();
            if let Some(ring) = cache.get(&(symbol.to_string(), timeframe)) {
                if let Some(front) = ring.front() {
                    return Ok(Some(front.clone()));
                }
            }
        }
        self.repo.find_latest(symbol, timeframe)
    }

    /// Candles with `from ≤ ts < to`, ascending.
    pub fn get_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>> {
        {
            let cache = self.cache.read();
            if let Some(ring) = cache.get(&(symbol.to_string(), timeframe)) {
                if ring.back().map(|oldest| oldest.ts <= from).unwrap_or(false) {
                    let mut hits: Vec<Candle> = ring
                        .iter()
                        .filter(|c| c.ts >= from && c.ts < to)
                        .cloned()
                        .collect();
                    hits.sort_by_key(|c| c.ts);
                    return Ok(hits);
                }
            }
        }
        self.repo.find_range(symbol, timeframe, from, to)
    }

    /// Most recent `limit` candles, descending.
    pub fn find_all(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        {
            let cache = self.cache.read();
            if let Some(ring) = cache.get(&(symbol.to_string(), timeframe)) {
                if ring.len() >= limit {
                    return Ok(ring.iter().take(limit).cloned().collect());
                }
            }
        }
        self.repo.find_all(symbol, timeframe, limit)
    }

    pub fn exists(&self, symbol: &str, timeframe: Timeframe) -> Result<bool> {
        {
            let cache = self.cache.read();
            if let Some(ring) = cache.get(&(symbol.to_string(), timeframe)) {
                if !ring.is_empty() {
                    return Ok(true);
                }
            }
        }
        self.repo.exists(symbol, timeframe)
    }

    /// Seed the ring with the most recent ≤ CACHE_CAPACITY stored candles.
    pub fn warmup(&self, symbol: &str, timeframe: Timeframe) -> Result<usize> {
        let recent = self.repo.find_all(symbol, timeframe, CACHE_CAPACITY)?;
        let count = recent.len();

        let mut cache = self.cache.write();
        // find_all is newest-first, which is exactly the ring order.
        cache.insert((symbol.to_string(), timeframe), recent.into());

        debug!(symbol, timeframe = %timeframe, count, "candle cache warmed up");
        Ok(count)
    }

    /// Retention cleanup across every series.
    pub fn delete_older_than(&self, cutoff: i64) -> Result<usize> {
        let deleted = self.repo.delete_older_than(cutoff)?;
        if deleted > 0 {
            let mut cache = self.cache.write();
            for ring in cache.values_mut() {
                ring.retain(|c| c.ts >= cutoff);
            }
        }
        Ok(deleted)
    }

    /// Ring insert: drop any entry at the same timestamp, prepend, trim.
    fn cache_insert(&self, candle: &Candle) {
        let mut cache = self.cache.write();
        let ring = cache
            .entry((candle.symbol.clone(), candle.timeframe))
            .or_insert_with(|| VecDeque::with_capacity(CACHE_CAPACITY + 1));

        if let Some(pos) = ring.iter().position(|c| c.ts == candle.ts) {
            ring.remove(pos);
        }

        // Candles almost always arrive in time order; prepend keeps the ring
        // newest-first. An out-of-order backfill candle is placed by scan.
        if ring.front().map(|newest| candle.ts >= newest.ts).unwrap_or(true) {
            ring.push_front(candle.clone());
        } else {
            let pos = ring
                .iter()
                .position(|c| c.ts < candle.ts)
                .unwrap_or(ring.len());
            ring.insert(pos, candle.clone());
        }

        while ring.len() > CACHE_CAPACITY {
            ring.pop_back();
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_len(&self, symbol: &str, timeframe: Timeframe) -> usize {
        self.cache
            .read()
            .get(&(symbol.to_string(), timeframe))
            .map_or(0, VecDeque::len)
    }
}

impl std::fmt::Debug for CandleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleStore")
            .field("cached_series", &self.cache.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    fn store() -> CandleStore {
        let db = Arc::new(Database::open_in_memory().unwrap());
        CandleStore::new(Arc::new(CandleRepository::new(db)))
    }

    fn candle(ts: i64, close: f64) -> Candle {
        Candle {
            symbol: "ACME".into(),
            timeframe: Timeframe::Ltf,
            ts,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100,
        }
    }

    #[test]
    fn latest_is_served_from_cache() {
        let store = store();
        store.upsert(&candle(60_000, 100.0)).unwrap();
        store.upsert(&candle(120_000, 101.0)).unwrap();

        let latest = store.get_latest("ACME", Timeframe::Ltf).unwrap().unwrap();
        assert_eq!(latest.ts, 120_000);
    }

    #[test]
    fn same_timestamp_upsert_replaces_in_ring() {
        let store = store();
        store.upsert(&candle(60_000, 100.0)).unwrap();
        store.upsert(&candle(60_000, 105.0)).unwrap();

        assert_eq!(store.cached_len("ACME", Timeframe::Ltf), 1);
        let latest = store.get_latest("ACME", Timeframe::Ltf).unwrap().unwrap();
        assert!((latest.close - 105.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ring_is_bounded_store_is_not() {
        let store = store();
        for i in 0..(CACHE_CAPACITY as i64 + 20) {
            store.upsert(&candle(i * 60_000, 100.0)).unwrap();
        }

        assert_eq!(store.cached_len("ACME", Timeframe::Ltf), CACHE_CAPACITY);
        // The dropped-oldest rows are still in the repository.
        let range = store.get_range("ACME", Timeframe::Ltf, 0, 5 * 60_000).unwrap();
        assert_eq!(range.len(), 5);
    }

    #[test]
    fn range_prefers_cache_when_covered() {
        let store = store();
        for i in 0..10 {
            store.upsert(&candle(i * 60_000, 100.0 + i as f64)).unwrap();
        }

        let range = store
            .get_range("ACME", Timeframe::Ltf, 2 * 60_000, 6 * 60_000)
            .unwrap();
        let ts: Vec<i64> = range.iter().map(|c| c.ts).collect();
        assert_eq!(ts, vec![120_000, 180_000, 240_000, 300_000]);
    }

    #[test]
    fn warmup_loads_most_recent_rows() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let repo = Arc::new(CandleRepository::new(db));
        for i in 0..10 {
            repo.upsert(&candle(i * 60_000, 100.0)).unwrap();
        }

        let store = CandleStore::new(repo);
        assert_eq!(store.cached_len("ACME", Timeframe::Ltf), 0);
        assert_eq!(store.warmup("ACME", Timeframe::Ltf).unwrap(), 10);
        assert_eq!(store.cached_len("ACME", Timeframe::Ltf), 10);

        let latest = store.get_latest("ACME", Timeframe::Ltf).unwrap().unwrap();
        assert_eq!(latest.ts, 9 * 60_000);
    }

    #[test]
    fn out_of_order_backfill_keeps_ring_sorted() {
        let store = store();
        store.upsert(&candle(300_000, 105.0)).unwrap();
        store.upsert(&candle(60_000, 101.0)).unwrap();
        store.upsert(&candle(180_000, 103.0)).unwrap();

        let range = store.get_range("ACME", Timeframe::Ltf, 60_000, 360_000).unwrap();
        let ts: Vec<i64> = range.iter().map(|c| c.ts).collect();
        assert_eq!(ts, vec![60_000, 180_000, 300_000]);
    }

    #[test]
    fn malformed_candle_is_refused() {
        let store = store();
        let mut bad = candle(60_000, 100.0);
        bad.high = 90.0;
        store.upsert(&bad).unwrap();
        assert!(!store.exists("ACME", Timeframe::Ltf).unwrap());
    }

    #[test]
    fn retention_prunes_cache_and_store() {
        let store = store();
        for i in 0..5 {
            store.upsert(&candle(i * 60_000, 100.0)).unwrap();
        }
        assert_eq!(store.delete_older_than(120_000).unwrap(), 2);
        assert_eq!(store.cached_len("ACME", Timeframe::Ltf), 3);
        let range = store.get_range("ACME", Timeframe::Ltf, 0, 600_000).unwrap();
        assert_eq!(range.len(), 3);
    }
}
