// =============================================================================
// Recovery Manager — startup and reconnect catch-up for candles and trades
// =============================================================================
//
// Startup decides, per symbol, between cache warmup, a full-session
// backfill, a from-open backfill, and a gap fill from the latest stored
// candle. Whenever LTF rows are pulled in, the derived frames are
// regenerated over the same range. Trade-side recovery rebuilds the active
// index from the durable OPEN rows.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{info, warn};

use crate::market_data::{CandleAggregator, CandleStore, HistoryBackfiller};
use crate::session;
use crate::trade::manager::TradeManagementService;
use crate::types::Timeframe;

/// What startup decided to do for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Pre-session, or the store is already current: warm the caches only.
    WarmupOnly,
    /// Post-session with nothing stored for today: pull the whole session.
    FullSessionBackfill,
    /// In-session with nothing stored for today: pull from the open.
    BackfillFromOpen,
    /// In-session with a hole behind the latest stored candle.
    GapFill { from_ms: i64 },
}

/// Pure decision table. `latest_ltf_ts` is the newest stored LTF bucket.
pub fn decide(now_ms: i64, latest_ltf_ts: Option<i64>) -> RecoveryAction {
    let start = session::session_start_ms(now_ms);
    let end = session::session_end_ms(now_ms);
    let has_today = latest_ltf_ts.map(|ts| ts >= start).unwrap_or(false);

    if now_ms < start {
        return RecoveryAction::WarmupOnly;
    }

    if now_ms > end {
        return if has_today {
            RecoveryAction::WarmupOnly
        } else {
            RecoveryAction::FullSessionBackfill
        };
    }

    // In session.
    if !has_today {
        return RecoveryAction::BackfillFromOpen;
    }
    let next_expected = latest_ltf_ts.expect("has_today implies a latest candle") + 60_000;
    if next_expected < now_ms {
        RecoveryAction::GapFill {
            from_ms: next_expected,
        }
    } else {
        RecoveryAction::WarmupOnly
    }
}

pub struct RecoveryManager {
    store: Arc<CandleStore>,
    backfiller: Arc<HistoryBackfiller>,
    aggregator: Arc<CandleAggregator>,
    tms: Arc<TradeManagementService>,
}

impl RecoveryManager {
    pub fn new(
        store: Arc<CandleStore>,
        backfiller: Arc<HistoryBackfiller>,
        aggregator: Arc<CandleAggregator>,
        tms: Arc<TradeManagementService>,
    ) -> Self {
        Self {
            store,
            backfiller,
            aggregator,
            tms,
        }
    }

    /// Full startup pass: candle catch-up per symbol, then the trade index.
    pub async fn run_startup(&self, symbols: &[String], now: DateTime<Utc>) {
        for symbol in symbols {
            self.recover_symbol(symbol, now).await;
        }

        match self.tms.rebuild_active_index() {
            Ok(count) => info!(open_trades = count, "trade recovery complete"),
            Err(e) => warn!(error = %e, "active index rebuild failed"),
        }
    }

    async fn recover_symbol(&self, symbol: &str, now: DateTime<Utc>) {
        for tf in [Timeframe::Ltf, Timeframe::Itf, Timeframe::Htf] {
            if let Err(e) = self.store.warmup(symbol, tf) {
                warn!(symbol, timeframe = %tf, error = %e, "cache warmup failed");
            }
        }

        let now_ms = now.timestamp_millis();
        let latest = self
            .store
            .get_latest(symbol, Timeframe::Ltf)
            .ok()
            .flatten()
            .map(|c| c.ts);
        let action = decide(now_ms, latest);
        info!(symbol, ?action, "startup recovery decision");

        let (from_ms, to_ms) = match action {
            RecoveryAction::WarmupOnly => return,
            RecoveryAction::FullSessionBackfill => (
                session::session_start_ms(now_ms),
                session::session_end_ms(now_ms),
            ),
            RecoveryAction::BackfillFromOpen => (session::session_start_ms(now_ms), now_ms),
            RecoveryAction::GapFill { from_ms } => (from_ms, now_ms),
        };

        self.backfill_and_regenerate(symbol, from_ms, to_ms).await;
    }

    /// Reconnect catch-up: fill anything older than a minute behind `now`.
    pub async fn on_reconnect(&self, symbol: &str, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        let latest = self
            .store
            .get_latest(symbol, Timeframe::Ltf)
            .ok()
            .flatten()
            .map(|c| c.ts);

        let from_ms = match latest {
            Some(ts) if now_ms - ts > 60_000 => ts + 60_000,
            Some(_) => return,
            None => session::session_start_ms(now_ms),
        };

        info!(symbol, from_ms, "reconnect gap fill");
        self.backfill_and_regenerate(symbol, from_ms, now_ms).await;
    }

    async fn backfill_and_regenerate(&self, symbol: &str, from_ms: i64, to_ms: i64) {
        let to = Utc
            .timestamp_millis_opt(to_ms)
            .single()
            .expect("epoch milliseconds in range");

        let written = self
            .backfiller
            .backfill_if_needed(symbol, Timeframe::Ltf, to)
            .await;
        if written == 0 {
            return;
        }

        for tf in [Timeframe::Itf, Timeframe::Htf] {
            if let Err(e) = self
                .aggregator
                .backfill_aggregated(symbol, tf, from_ms, to_ms)
            {
                warn!(symbol, timeframe = %tf, error = %e, "recovery re-aggregation failed");
            }
        }
    }
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager").finish_non_exhaustive()
    }
}
