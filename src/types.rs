// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Trade direction. Wire format matches the broker API ("BUY" / "SELL").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// The opposite side, used when building exit orders.
    pub fn reverse(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candle timeframe. Intraday frames are aligned from session open, not the
/// Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    /// 1-minute (low timeframe).
    Ltf,
    /// 25-minute (intermediate timeframe).
    Itf,
    /// 125-minute (high timeframe).
    Htf,
    Daily,
}

impl Timeframe {
    /// Bucket width in minutes. Daily spans the full 375-minute session.
    pub fn minutes(&self) -> i64 {
        match self {
            Self::Ltf => 1,
            Self::Itf => 25,
            Self::Htf => 125,
            Self::Daily => 375,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ltf => "1m",
            Self::Itf => "25m",
            Self::Htf => "125m",
            Self::Daily => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::Ltf),
            "25m" => Some(Self::Itf),
            "125m" => Some(Self::Htf),
            "1d" => Some(Self::Daily),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type. Wire strings follow the broker order API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    /// Stop-loss limit order.
    #[serde(rename = "SL")]
    StopLoss,
    /// Stop-loss market order.
    #[serde(rename = "SL-M")]
    StopLossMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::StopLoss => "SL",
            Self::StopLossMarket => "SL-M",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(Self::Market),
            "LIMIT" => Some(Self::Limit),
            "SL" => Some(Self::StopLoss),
            "SL-M" => Some(Self::StopLossMarket),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Margin product for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductType {
    /// Cash & carry (delivery).
    #[serde(rename = "CNC")]
    Cnc,
    /// Margin intraday squareoff.
    #[serde(rename = "MIS")]
    Mis,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cnc => "CNC",
            Self::Mis => "MIS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CNC" => Some(Self::Cnc),
            "MIS" => Some(Self::Mis),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProductType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade life-cycle state.
///
/// Terminal states are absorbing: once a trade reaches one of them no
/// further transition is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Created,
    Pending,
    Open,
    Exiting,
    Closed,
    Rejected,
    Cancelled,
    Error,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Rejected | Self::Cancelled | Self::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Pending => "PENDING",
            Self::Open => "OPEN",
            Self::Exiting => "EXITING",
            Self::Closed => "CLOSED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(Self::Created),
            "PENDING" => Some(Self::Pending),
            "OPEN" => Some(Self::Open),
            "EXITING" => Some(Self::Exiting),
            "CLOSED" => Some(Self::Closed),
            "REJECTED" => Some(Self::Rejected),
            "CANCELLED" => Some(Self::Cancelled),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit-intent life-cycle state. APPROVED → PLACED → {FILLED|FAILED|CANCELLED}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitIntentStatus {
    Approved,
    Placed,
    Filled,
    Failed,
    Cancelled,
}

impl ExitIntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::Placed => "PLACED",
            Self::Filled => "FILLED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPROVED" => Some(Self::Approved),
            "PLACED" => Some(Self::Placed),
            "FILLED" => Some(Self::Filled),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitIntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an exit was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TargetHit,
    StopLoss,
    TimeBased,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TargetHit => "TARGET_HIT",
            Self::StopLoss => "STOP_LOSS",
            Self::TimeBased => "TIME_BASED",
            Self::Manual => "MANUAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TARGET_HIT" => Some(Self::TargetHit),
            "STOP_LOSS" => Some(Self::StopLoss),
            "TIME_BASED" => Some(Self::TimeBased),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a raw broker order-status string.
///
/// The broker sends free-form strings; everything the engine acts on is one
/// of these classes. Unrecognised strings classify as `Unknown` and the row
/// is left untouched for the next reconciler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStateClass {
    /// COMPLETE / FILLED — the order has fully executed.
    Filled,
    /// REJECTED — terminal failure.
    Rejected,
    /// CANCELLED — terminal, user- or broker-initiated.
    Cancelled,
    /// OPEN / PENDING / TRIGGER PENDING — still working at the exchange.
    Working,
    Unknown,
}

impl OrderStateClass {
    pub fn classify(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "COMPLETE" | "FILLED" => Self::Filled,
            "REJECTED" => Self::Rejected,
            "CANCELLED" | "CANCELED" => Self::Cancelled,
            "OPEN" | "PENDING" | "TRIGGER PENDING" => Self::Working,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Rejected | Self::Cancelled)
    }
}

/// A single OHLCV candle. `ts` is the bucket start in epoch milliseconds
/// (UTC), aligned to the timeframe's grid from session open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Candle {
    /// low ≤ min(open, close) and max(open, close) ≤ high, all non-negative.
    pub fn is_well_formed(&self) -> bool {
        self.low >= 0.0
            && self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high
    }
}

/// A normalised market tick from a broker feed.
///
/// `volume` is the last-traded quantity of this tick (not the cumulative day
/// volume). `exchange_ts` is the exchange timestamp in epoch seconds, or 0
/// when the feed mode does not carry one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub instrument_token: u32,
    pub last_price: f64,
    pub volume: u64,
    pub exchange_ts: i64,
    /// Engine receive time, epoch milliseconds.
    pub received_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_state_classification() {
        assert_eq!(OrderStateClass::classify("COMPLETE"), OrderStateClass::Filled);
        assert_eq!(OrderStateClass::classify("FILLED"), OrderStateClass::Filled);
        assert_eq!(OrderStateClass::classify("REJECTED"), OrderStateClass::Rejected);
        assert_eq!(OrderStateClass::classify("CANCELLED"), OrderStateClass::Cancelled);
        assert_eq!(
            OrderStateClass::classify("TRIGGER PENDING"),
            OrderStateClass::Working
        );
        assert_eq!(OrderStateClass::classify("open"), OrderStateClass::Working);
        assert_eq!(
            OrderStateClass::classify("VALIDATION PENDING"),
            OrderStateClass::Unknown
        );
    }

    #[test]
    fn terminal_statuses_are_marked() {
        assert!(TradeStatus::Closed.is_terminal());
        assert!(TradeStatus::Rejected.is_terminal());
        assert!(TradeStatus::Cancelled.is_terminal());
        assert!(TradeStatus::Error.is_terminal());
        assert!(!TradeStatus::Open.is_terminal());
        assert!(!TradeStatus::Exiting.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        for s in [
            TradeStatus::Created,
            TradeStatus::Pending,
            TradeStatus::Open,
            TradeStatus::Exiting,
            TradeStatus::Closed,
            TradeStatus::Rejected,
            TradeStatus::Cancelled,
            TradeStatus::Error,
        ] {
            assert_eq!(TradeStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn candle_well_formedness() {
        let c = Candle {
            symbol: "ACME".into(),
            timeframe: Timeframe::Ltf,
            ts: 0,
            open: 100.0,
            high: 101.0,
            low: 99.5,
            close: 100.5,
            volume: 10,
        };
        assert!(c.is_well_formed());

        let bad = Candle { high: 99.0, ..c };
        assert!(!bad.is_well_formed());
    }

    #[test]
    fn direction_reverse() {
        assert_eq!(Direction::Buy.reverse(), Direction::Sell);
        assert_eq!(Direction::Sell.reverse(), Direction::Buy);
    }
}
