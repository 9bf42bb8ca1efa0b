// =============================================================================
// History Backfiller — fill candle gaps from the data broker's historical API
// =============================================================================
//
// Failures never propagate: a backfill that cannot run (no data broker, a
// broker error, an empty response) logs and reports zero rows so the caller
// can carry on with live data. The next gap check or recovery pass retries.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::broker::BrokerRegistry;
use crate::market_data::CandleStore;
use crate::session;
use crate::types::Timeframe;

pub struct HistoryBackfiller {
    store: Arc<CandleStore>,
    registry: Arc<BrokerRegistry>,
}

impl HistoryBackfiller {
    pub fn new(store: Arc<CandleStore>, registry: Arc<BrokerRegistry>) -> Self {
        Self { store, registry }
    }

    /// Fill the gap between the latest stored candle and `up_to`, if any.
    /// Returns the number of candles written; 0 on no-gap or failure.
    ///
    /// Callers that backfill LTF are expected to regenerate ITF/HTF over the
    /// same range afterwards.
    pub async fn backfill_if_needed(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        up_to: DateTime<Utc>,
    ) -> usize {
        let latest_ts = match self.store.get_latest(symbol, timeframe) {
            Ok(latest) => latest.map(|c| c.ts),
            Err(e) => {
                warn!(symbol, timeframe = %timeframe, error = %e, "backfill skipped — store read failed");
                return 0;
            }
        };

        let from_ms = resolve_from(latest_ts, timeframe, up_to.timestamp_millis());
        if from_ms >= up_to.timestamp_millis() {
            return 0;
        }

        let from = Utc
            .timestamp_millis_opt(from_ms)
            .single()
            .expect("epoch milliseconds in range");
        self.backfill_range(symbol, timeframe, from, up_to).await
    }

    /// Fetch `[from, to]` from the data broker and upsert. Returns rows
    /// written; 0 on failure.
    pub async fn backfill_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> usize {
        let broker = match self.registry.data_broker() {
            Some(b) => b,
            None => {
                warn!(symbol, "backfill skipped — no data broker registered");
                return 0;
            }
        };

        debug!(
            symbol,
            timeframe = %timeframe,
            from = %from,
            to = %to,
            "requesting historical candles"
        );

        let candles = match broker.get_historical_candles(symbol, timeframe, from, to).await {
            Ok(candles) => candles,
            Err(e) => {
                warn!(symbol, timeframe = %timeframe, error = %e, "historical fetch failed");
                return 0;
            }
        };

        if candles.is_empty() {
            debug!(symbol, timeframe = %timeframe, "broker returned no candles for range");
            return 0;
        }

        match self.store.upsert_batch(&candles) {
            Ok(written) => {
                info!(symbol, timeframe = %timeframe, written, "backfill complete");
                written
            }
            Err(e) => {
                warn!(symbol, timeframe = %timeframe, error = %e, "backfill upsert failed");
                0
            }
        }
    }
}

/// Where a backfill should start: one bucket after the latest stored candle,
/// or today's session open when the series is empty.
fn resolve_from(latest_ts: Option<i64>, timeframe: Timeframe, up_to_ms: i64) -> i64 {
    match latest_ts {
        Some(ts) => ts + timeframe.minutes() * 60_000,
        None => session::session_start_ms(up_to_ms),
    }
}

impl std::fmt::Debug for HistoryBackfiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryBackfiller").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CandleRepository, Database};
    use crate::types::Candle;
    use chrono::FixedOffset;

    fn ist_ms(h: u32, m: u32) -> i64 {
        FixedOffset::east_opt(5 * 3600 + 1800)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 5, h, m, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
            .timestamp_millis()
    }

    #[test]
    fn resume_point_is_one_bucket_after_latest() {
        let latest = ist_ms(10, 0);
        assert_eq!(
            resolve_from(Some(latest), Timeframe::Ltf, ist_ms(10, 5)),
            ist_ms(10, 1)
        );
        assert_eq!(
            resolve_from(Some(latest), Timeframe::Itf, ist_ms(12, 0)),
            latest + 25 * 60_000
        );
    }

    #[test]
    fn empty_series_starts_at_session_open() {
        assert_eq!(
            resolve_from(None, Timeframe::Ltf, ist_ms(10, 5)),
            ist_ms(9, 15)
        );
    }

    #[tokio::test]
    async fn no_data_broker_means_zero_without_error() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(CandleStore::new(Arc::new(CandleRepository::new(db))));
        let backfiller = HistoryBackfiller::new(store.clone(), Arc::new(BrokerRegistry::new()));

        let up_to = Utc
            .timestamp_millis_opt(ist_ms(10, 5))
            .single()
            .unwrap();
        assert_eq!(
            backfiller
                .backfill_if_needed("ACME", Timeframe::Ltf, up_to)
                .await,
            0
        );
    }

    #[tokio::test]
    async fn up_to_date_series_needs_nothing() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(CandleStore::new(Arc::new(CandleRepository::new(db))));
        store
            .upsert(&Candle {
                symbol: "ACME".into(),
                timeframe: Timeframe::Ltf,
                ts: ist_ms(10, 4),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 10,
            })
            .unwrap();

        let backfiller = HistoryBackfiller::new(store, Arc::new(BrokerRegistry::new()));
        let up_to = Utc
            .timestamp_millis_opt(ist_ms(10, 5))
            .single()
            .unwrap();
        // from = 10:05, up_to = 10:05 — nothing missing, no broker needed.
        assert_eq!(
            backfiller
                .backfill_if_needed("ACME", Timeframe::Ltf, up_to)
                .await,
            0
        );
    }
}
