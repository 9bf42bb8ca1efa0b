// =============================================================================
// Candle Aggregator — ITF/HTF buckets recomputed from stored 1-minute candles
// =============================================================================
//
// On every closed 1-minute candle the containing 25- and 125-minute buckets
// are rebuilt from scratch out of the stored LTF rows and upserted. Because
// the reduction always re-reads the full bucket, arrival order of the
// underlying candles does not matter: once the LTF rows are present, the
// aggregate converges regardless of gaps, backfills or replays.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, warn};

use crate::events::{EventBus, EventType, SOURCE_MARKET_DATA};
use crate::market_data::CandleStore;
use crate::session;
use crate::types::{Candle, Timeframe};

/// The timeframes derived from LTF, in ascending width.
const DERIVED: [Timeframe; 2] = [Timeframe::Itf, Timeframe::Htf];

pub struct CandleAggregator {
    store: Arc<CandleStore>,
    bus: Arc<EventBus>,
}

impl CandleAggregator {
    pub fn new(store: Arc<CandleStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Recompute the ITF and HTF buckets containing the just-closed 1-minute
    /// candle and emit a candle-closed event per recomputed timeframe.
    pub fn on_minute_close(&self, m1: &Candle) -> Result<()> {
        for tf in DERIVED {
            let bucket = session::bucket_start_ms(m1.ts, tf.minutes());
            match self.aggregate_bucket(&m1.symbol, tf, bucket)? {
                Some(candle) => {
                    self.store.upsert(&candle)?;
                    self.emit(&candle);
                }
                None => {
                    // No LTF rows in the bucket — nothing to do.
                    debug!(symbol = %m1.symbol, timeframe = %tf, bucket, "empty bucket skipped");
                }
            }
        }
        Ok(())
    }

    /// Rebuild every `timeframe` bucket intersecting `[from, to]`.
    /// Returns the number of buckets written.
    pub fn backfill_aggregated(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<usize> {
        if !DERIVED.contains(&timeframe) {
            warn!(timeframe = %timeframe, "aggregated backfill only applies to ITF/HTF");
            return Ok(0);
        }

        let width_ms = timeframe.minutes() * 60_000;
        let first = session::bucket_start_ms(from_ms, timeframe.minutes());
        let last = session::bucket_start_ms(to_ms, timeframe.minutes());

        let mut written = 0;
        let mut bucket = first;
        while bucket <= last {
            if let Some(candle) = self.aggregate_bucket(symbol, timeframe, bucket)? {
                self.store.upsert(&candle)?;
                self.emit(&candle);
                written += 1;
            }
            bucket += width_ms;
        }

        debug!(symbol, timeframe = %timeframe, written, "aggregated backfill complete");
        Ok(written)
    }

    /// Reduce the LTF candles of one bucket: first open, last close, max
    /// high, min low, summed volume. `None` when the bucket holds no rows.
    fn aggregate_bucket(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bucket_ms: i64,
    ) -> Result<Option<Candle>> {
        let end = bucket_ms + timeframe.minutes() * 60_000;
        let base = self.store.get_range(symbol, Timeframe::Ltf, bucket_ms, end)?;

        let (first, last) = match (base.first(), base.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return Ok(None),
        };

        let mut high = f64::MIN;
        let mut low = f64::MAX;
        let mut volume: u64 = 0;
        for c in &base {
            high = high.max(c.high);
            low = low.min(c.low);
            volume += c.volume;
        }

        Ok(Some(Candle {
            symbol: symbol.to_string(),
            timeframe,
            ts: bucket_ms,
            open: first.open,
            high,
            low,
            close: last.close,
            volume,
        }))
    }

    fn emit(&self, candle: &Candle) {
        self.bus.emit_global(
            EventType::Candle,
            json!({
                "symbol": candle.symbol,
                "timeframe": candle.timeframe.as_str(),
                "timestamp": candle.ts,
                "open": candle.open,
                "high": candle.high,
                "low": candle.low,
                "close": candle.close,
                "volume": candle.volume,
            }),
            SOURCE_MARKET_DATA,
        );
    }
}

impl std::fmt::Debug for CandleAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleAggregator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CandleRepository, Database};
    use chrono::{FixedOffset, TimeZone, Utc};

    fn fixture() -> (Arc<CandleStore>, CandleAggregator) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(CandleStore::new(Arc::new(CandleRepository::new(db))));
        let aggregator = CandleAggregator::new(store.clone(), Arc::new(EventBus::new()));
        (store, aggregator)
    }

    /// Epoch ms for 2024-03-05 at the given IST wall-clock minute.
    fn ist_ms(h: u32, m: u32) -> i64 {
        FixedOffset::east_opt(5 * 3600 + 1800)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 5, h, m, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
            .timestamp_millis()
    }

    fn m1(ts: i64, open: f64, high: f64, low: f64, close: f64, volume: u64) -> Candle {
        Candle {
            symbol: "ACME".into(),
            timeframe: Timeframe::Ltf,
            ts,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn itf_bucket_reduces_ltf_rows() {
        let (store, aggregator) = fixture();

        // The 10:05 ITF bucket covers 10:05..10:30. Fill 10:05..10:09.
        let candles = [
            m1(ist_ms(10, 5), 100.0, 101.0, 99.0, 100.5, 10),
            m1(ist_ms(10, 6), 100.5, 103.0, 100.0, 102.0, 20),
            m1(ist_ms(10, 7), 102.0, 102.5, 98.5, 99.0, 5),
            m1(ist_ms(10, 8), 99.0, 100.0, 98.8, 99.5, 7),
            m1(ist_ms(10, 9), 99.5, 101.5, 99.2, 101.0, 8),
        ];
        for c in &candles {
            store.upsert(c).unwrap();
        }

        aggregator.on_minute_close(&candles[4]).unwrap();

        let itf = store.get_latest("ACME", Timeframe::Itf).unwrap().unwrap();
        assert_eq!(itf.ts, ist_ms(10, 5));
        assert!((itf.open - 100.0).abs() < f64::EPSILON);
        assert!((itf.close - 101.0).abs() < f64::EPSILON);
        assert!((itf.high - 103.0).abs() < f64::EPSILON);
        assert!((itf.low - 98.5).abs() < f64::EPSILON);
        assert_eq!(itf.volume, 50);

        // The HTF bucket containing 10:09 starts at session open.
        let htf = store.get_latest("ACME", Timeframe::Htf).unwrap().unwrap();
        assert_eq!(htf.ts, ist_ms(9, 15));
        assert_eq!(htf.volume, 50);
    }

    #[test]
    fn reaggregation_is_idempotent() {
        let (store, aggregator) = fixture();
        let c = m1(ist_ms(9, 40), 100.0, 101.0, 99.0, 100.5, 10);
        store.upsert(&c).unwrap();

        aggregator.on_minute_close(&c).unwrap();
        let first = store.get_latest("ACME", Timeframe::Itf).unwrap().unwrap();

        aggregator.on_minute_close(&c).unwrap();
        let second = store.get_latest("ACME", Timeframe::Itf).unwrap().unwrap();

        assert_eq!(first, second);
        // Still exactly one ITF row.
        assert_eq!(store.find_all("ACME", Timeframe::Itf, 10).unwrap().len(), 1);
    }

    #[test]
    fn late_ltf_candle_converges_the_bucket() {
        let (store, aggregator) = fixture();

        let late = m1(ist_ms(9, 40), 100.0, 108.0, 99.5, 107.0, 12);
        let on_time = m1(ist_ms(9, 41), 107.0, 107.5, 104.0, 105.0, 6);

        // The 9:41 candle closes first; the 9:40 arrives later via backfill.
        store.upsert(&on_time).unwrap();
        aggregator.on_minute_close(&on_time).unwrap();
        let partial_view = store.get_latest("ACME", Timeframe::Itf).unwrap().unwrap();
        assert!((partial_view.open - 107.0).abs() < f64::EPSILON);

        store.upsert(&late).unwrap();
        aggregator.on_minute_close(&late).unwrap();

        let converged = store.get_latest("ACME", Timeframe::Itf).unwrap().unwrap();
        assert_eq!(converged.ts, ist_ms(9, 40));
        assert!((converged.open - 100.0).abs() < f64::EPSILON);
        assert!((converged.close - 105.0).abs() < f64::EPSILON);
        assert!((converged.high - 108.0).abs() < f64::EPSILON);
        assert_eq!(converged.volume, 18);
    }

    #[test]
    fn backfill_walks_every_bucket_in_range() {
        let (store, aggregator) = fixture();

        // One LTF candle in each of the first three ITF buckets.
        for (h, m) in [(9u32, 20u32), (9, 45), (10, 10)] {
            store
                .upsert(&m1(ist_ms(h, m), 100.0, 101.0, 99.0, 100.0, 1))
                .unwrap();
        }

        let written = aggregator
            .backfill_aggregated("ACME", Timeframe::Itf, ist_ms(9, 15), ist_ms(10, 10))
            .unwrap();
        assert_eq!(written, 3);

        let rows = store.find_all("ACME", Timeframe::Itf, 10).unwrap();
        let ts: Vec<i64> = rows.iter().map(|c| c.ts).collect();
        assert_eq!(ts, vec![ist_ms(10, 5), ist_ms(9, 40), ist_ms(9, 15)]);
    }

    #[test]
    fn empty_bucket_writes_nothing() {
        let (store, aggregator) = fixture();
        let written = aggregator
            .backfill_aggregated("ACME", Timeframe::Itf, ist_ms(9, 15), ist_ms(10, 0))
            .unwrap();
        assert_eq!(written, 0);
        assert!(!store.exists("ACME", Timeframe::Itf).unwrap());
    }
}
