// =============================================================================
// Session Clock — exchange-session time arithmetic
// =============================================================================
//
// The exchange trades 09:15–15:30 IST. Intraday buckets (25m, 125m) are
// aligned from session open, not from the Unix epoch, so 10:05 IST is a
// 25-minute boundary (09:15 + 2×25m) even though it is not a multiple of 25
// minutes past the hour.
//
// Every function here is pure and total; callers pass UTC instants and get
// UTC instants back.
// =============================================================================

use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Timelike, Utc};

/// Session open, exchange-local.
const OPEN_HOUR: u32 = 9;
const OPEN_MINUTE: u32 = 15;
/// Session close, exchange-local. 15:30:00 itself is in-session.
const CLOSE_HOUR: u32 = 15;
const CLOSE_MINUTE: u32 = 30;

/// Exchange-local offset: IST, UTC+05:30. No DST.
pub fn exchange_offset() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 1800).expect("IST offset is valid")
}

/// Floor an instant to the start of its minute.
pub fn floor_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .expect("zeroing sub-minute fields cannot fail")
}

/// Session open (09:15 exchange-local) for the exchange-local date of `t`.
pub fn session_start(t: DateTime<Utc>) -> DateTime<Utc> {
    local_instant(t, OPEN_HOUR, OPEN_MINUTE)
}

/// Session close (15:30 exchange-local) for the exchange-local date of `t`.
pub fn session_end(t: DateTime<Utc>) -> DateTime<Utc> {
    local_instant(t, CLOSE_HOUR, CLOSE_MINUTE)
}

/// Whether `t` falls inside the trading session of its own exchange-local
/// day. Start and end are both inclusive.
pub fn is_within_session(t: DateTime<Utc>) -> bool {
    t >= session_start(t) && t <= session_end(t)
}

/// Floor `t` onto the `n_minutes` grid anchored at session open.
///
/// Instants before session open map to the open itself (bucket index is
/// clamped at zero); this keeps the function total for pre-open ticks that
/// slip past upstream filters.
pub fn floor_to_interval_from_session_start(t: DateTime<Utc>, n_minutes: i64) -> DateTime<Utc> {
    let start = session_start(t);
    let elapsed = (floor_to_minute(t) - start).num_minutes();
    let bucket = elapsed.div_euclid(n_minutes).max(0);
    start + Duration::minutes(bucket * n_minutes)
}

// ---------------------------------------------------------------------------
// Epoch-millisecond conveniences (the candle pipeline works in ms)
// ---------------------------------------------------------------------------

pub fn floor_to_minute_ms(ms: i64) -> i64 {
    floor_to_minute(dt(ms)).timestamp_millis()
}

pub fn session_start_ms(ms: i64) -> i64 {
    session_start(dt(ms)).timestamp_millis()
}

pub fn session_end_ms(ms: i64) -> i64 {
    session_end(dt(ms)).timestamp_millis()
}

pub fn is_within_session_ms(ms: i64) -> bool {
    is_within_session(dt(ms))
}

pub fn bucket_start_ms(ms: i64, n_minutes: i64) -> i64 {
    floor_to_interval_from_session_start(dt(ms), n_minutes).timestamp_millis()
}

fn dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .expect("epoch milliseconds in range")
}

fn local_instant(t: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    let local = t.with_timezone(&exchange_offset());
    exchange_offset()
        .with_ymd_and_hms(
            local.date_naive().year(),
            local.date_naive().month(),
            local.date_naive().day(),
            hour,
            minute,
            0,
        )
        .single()
        .expect("fixed-offset local time is unambiguous")
        .with_timezone(&Utc)
}
