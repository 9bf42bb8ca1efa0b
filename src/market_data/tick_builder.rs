// =============================================================================
// Tick Candle Builder — broker ticks → deduped, session-filtered 1m candles
// =============================================================================
//
// Per tick: rotate-check the dedup windows, drop duplicates and out-of-
// session ticks, roll the symbol's partial candle, and forward the price to
// the market cache. Rolling into a new minute closes the previous partial
// (persist, emit, aggregate) and schedules a backfill when minutes were
// skipped in between.
//
// Dedup is two rotating sets swapped every 60 s under a try-lock, so cleanup
// is O(1) and a tick is remembered for at least one full window and at most
// two. A periodic finalizer force-closes any partial whose minute has
// elapsed, which guarantees the candle boundary fires even when the next
// tick is late or never comes.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::events::{EventBus, EventType, SOURCE_MARKET_DATA};
use crate::market_data::{CandleAggregator, CandleStore, HistoryBackfiller, MarketDataCache};
use crate::session;
use crate::types::{Candle, Tick, Timeframe};

// ---------------------------------------------------------------------------
// Partial candle
// ---------------------------------------------------------------------------

/// The currently-forming 1-minute candle of one symbol.
#[derive(Debug, Clone)]
pub struct PartialCandle {
    pub symbol: String,
    pub start_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl PartialCandle {
    fn begin(symbol: &str, start_ms: i64, price: f64, volume: u64) -> Self {
        Self {
            symbol: symbol.to_string(),
            start_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    fn apply(&mut self, price: f64, volume: u64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }

    fn into_candle(self) -> Candle {
        Candle {
            symbol: self.symbol,
            timeframe: Timeframe::Ltf,
            ts: self.start_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

// ---------------------------------------------------------------------------
// Two-window deduplication
// ---------------------------------------------------------------------------

struct TickDeduper {
    current: Mutex<HashSet<String>>,
    previous: Mutex<HashSet<String>>,
    /// Held only by the winner of a rotation race; everyone else skips.
    rotate_guard: Mutex<Instant>,
    rotate_every: Duration,
}

impl TickDeduper {
    fn new(rotate_every: Duration) -> Self {
        Self {
            current: Mutex::new(HashSet::new()),
            previous: Mutex::new(HashSet::new()),
            rotate_guard: Mutex::new(Instant::now()),
            rotate_every,
        }
    }

    /// Returns `true` when the key is fresh (and remembers it).
    fn check_and_insert(&self, key: String) -> bool {
        if self.previous.lock().contains(&key) {
            return false;
        }
        // HashSet::insert is the membership check for the current window.
        self.current.lock().insert(key)
    }

    /// Swap windows when due. Non-blocking: a contended guard means another
    /// tick thread is already rotating.
    fn maybe_rotate(&self) {
        let Some(mut last_rotate) = self.rotate_guard.try_lock() else {
            return;
        };
        if last_rotate.elapsed() < self.rotate_every {
            return;
        }
        *last_rotate = Instant::now();

        let mut previous = self.previous.lock();
        let mut current = self.current.lock();
        *previous = std::mem::take(&mut *current);
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TickCounters {
    received: AtomicU64,
    accepted: AtomicU64,
    duplicates: AtomicU64,
    out_of_session: AtomicU64,
    candles_closed: AtomicU64,
    gaps_detected: AtomicU64,
}

/// Serialisable snapshot of the tick pipeline counters.
#[derive(Debug, Clone, Serialize)]
pub struct TickBuilderSnapshot {
    pub received: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub out_of_session: u64,
    pub candles_closed: u64,
    pub gaps_detected: u64,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct TickCandleBuilder {
    store: Arc<CandleStore>,
    aggregator: Arc<CandleAggregator>,
    backfiller: Arc<HistoryBackfiller>,
    bus: Arc<EventBus>,
    market_cache: Arc<MarketDataCache>,
    partials: Mutex<HashMap<String, PartialCandle>>,
    dedup: TickDeduper,
    counters: TickCounters,
}

impl TickCandleBuilder {
    pub fn new(
        store: Arc<CandleStore>,
        aggregator: Arc<CandleAggregator>,
        backfiller: Arc<HistoryBackfiller>,
        bus: Arc<EventBus>,
        market_cache: Arc<MarketDataCache>,
        dedup_rotate: Duration,
    ) -> Self {
        Self {
            store,
            aggregator,
            backfiller,
            bus,
            market_cache,
            partials: Mutex::new(HashMap::new()),
            dedup: TickDeduper::new(dedup_rotate),
            counters: TickCounters::default(),
        }
    }

    /// Consume one tick from a broker feed.
    pub fn on_tick(&self, tick: &Tick) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.dedup.maybe_rotate();

        if !self.dedup.check_and_insert(dedup_key(tick)) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %tick.symbol, "duplicate tick dropped");
            return;
        }

        let ts_ms = tick_event_ms(tick);
        if !session::is_within_session_ms(ts_ms) {
            self.counters.out_of_session.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let candle_start = session::floor_to_minute_ms(ts_ms);

        // Roll the partial; a minute change hands back the closed candle and
        // the skipped-minute gap, processed after the map lock is released.
        let closed: Option<(PartialCandle, Option<(i64, i64)>)> = {
            let mut partials = self.partials.lock();
            match partials.remove(&tick.symbol) {
                Some(mut partial) if partial.start_ms == candle_start => {
                    partial.apply(tick.last_price, tick.volume);
                    partials.insert(tick.symbol.clone(), partial);
                    None
                }
                Some(partial) => {
                    let gap_from = partial.start_ms + 60_000;
                    let gap = (gap_from < candle_start).then_some((gap_from, candle_start));
                    partials.insert(
                        tick.symbol.clone(),
                        PartialCandle::begin(&tick.symbol, candle_start, tick.last_price, tick.volume),
                    );
                    Some((partial, gap))
                }
                None => {
                    partials.insert(
                        tick.symbol.clone(),
                        PartialCandle::begin(&tick.symbol, candle_start, tick.last_price, tick.volume),
                    );
                    None
                }
            }
        };

        if let Some((partial, gap)) = closed {
            self.finalize_candle(partial);
            if let Some((gap_from, gap_to)) = gap {
                self.counters.gaps_detected.fetch_add(1, Ordering::Relaxed);
                self.schedule_gap_fill(&tick.symbol, gap_from, gap_to);
            }
        }

        self.market_cache.update(&tick.symbol, tick.last_price, ts_ms);
        self.bus.emit_global(
            EventType::Tick,
            json!({
                "symbol": tick.symbol,
                "lastPrice": tick.last_price,
                "volume": tick.volume,
                "timestamp": ts_ms,
            }),
            SOURCE_MARKET_DATA,
        );
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Periodic finalizer: force-close every partial whose minute has fully
    /// elapsed. Spawn once at startup.
    pub async fn run_finalizer(self: Arc<Self>, period: Duration) {
        info!(period_secs = period.as_secs(), "partial-candle finalizer started");
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            self.force_close_stale(Utc::now().timestamp_millis());
        }
    }

    /// Close every partial with `start < floor_to_minute(now)`. Exposed
    /// separately from the loop so the boundary logic is testable.
    pub fn force_close_stale(&self, now_ms: i64) {
        let boundary = session::floor_to_minute_ms(now_ms);

        let stale: Vec<PartialCandle> = {
            let mut partials = self.partials.lock();
            let symbols: Vec<String> = partials
                .iter()
                .filter(|(_, p)| p.start_ms < boundary)
                .map(|(s, _)| s.clone())
                .collect();
            symbols
                .into_iter()
                .filter_map(|s| partials.remove(&s))
                .collect()
        };

        for partial in stale {
            debug!(symbol = %partial.symbol, start = partial.start_ms, "finalizer closing stale partial");
            self.finalize_candle(partial);
        }
    }

    pub fn snapshot(&self) -> TickBuilderSnapshot {
        TickBuilderSnapshot {
            received: self.counters.received.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            out_of_session: self.counters.out_of_session.load(Ordering::Relaxed),
            candles_closed: self.counters.candles_closed.load(Ordering::Relaxed),
            gaps_detected: self.counters.gaps_detected.load(Ordering::Relaxed),
        }
    }

    /// Persist + emit + aggregate one closed candle. Errors are logged; the
    /// pipeline keeps flowing.
    fn finalize_candle(&self, partial: PartialCandle) {
        let candle = partial.into_candle();

        if let Err(e) = self.store.upsert(&candle) {
            warn!(symbol = %candle.symbol, ts = candle.ts, error = %e, "candle persist failed");
        }

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

        if let Err(e) = self.aggregator.on_minute_close(&candle) {
            warn!(symbol = %candle.symbol, ts = candle.ts, error = %e, "aggregation failed");
        }

        self.counters.candles_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Backfill skipped LTF minutes, then regenerate the derived frames over
    /// the same range. Runs detached so the tick path never waits on the
    /// broker.
    fn schedule_gap_fill(&self, symbol: &str, gap_from_ms: i64, gap_to_ms: i64) {
        info!(
            symbol,
            gap_from = gap_from_ms,
            gap_to = gap_to_ms,
            "minute gap detected — scheduling backfill"
        );

        let backfiller = self.backfiller.clone();
        let aggregator = self.aggregator.clone();
        let symbol = symbol.to_string();
        tokio::spawn(async move {
            let up_to = Utc
                .timestamp_millis_opt(gap_to_ms)
                .single()
                .expect("epoch milliseconds in range");

            let written = backfiller
                .backfill_if_needed(&symbol, Timeframe::Ltf, up_to)
                .await;

            if written > 0 {
                for tf in [Timeframe::Itf, Timeframe::Htf] {
                    if let Err(e) =
                        aggregator.backfill_aggregated(&symbol, tf, gap_from_ms, gap_to_ms)
                    {
                        warn!(symbol = %symbol, timeframe = %tf, error = %e, "gap re-aggregation failed");
                    }
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn current_partial(&self, symbol: &str) -> Option<PartialCandle> {
        self.partials.lock().get(symbol).cloned()
    }
}

fn dedup_key(tick: &Tick) -> String {
    if tick.exchange_ts > 0 {
        format!(
            "{}|{}|{}|{}",
            tick.symbol, tick.exchange_ts, tick.last_price, tick.volume
        )
    } else {
        format!(
            "{}|SYS:{}|{}|{}",
            tick.symbol,
            tick.received_at / 1000,
            tick.last_price,
            tick.volume
        )
    }
}

/// Event time of a tick: exchange stamp when present, receive time otherwise.
fn tick_event_ms(tick: &Tick) -> i64 {
    if tick.exchange_ts > 0 {
        tick.exchange_ts * 1000
    } else {
        tick.received_at
    }
}

impl std::fmt::Debug for TickCandleBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickCandleBuilder")
            .field("partials", &self.partials.lock().len())
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
