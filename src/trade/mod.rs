// =============================================================================
// Trade domain model — trades, intents, exit intents, signals
// =============================================================================
//
// `Trade` is the tracked position; only `TradeManagementService` writes it.
// `TradeIntent` and `Signal` are read-only inputs produced by the strategy
// layer. `ExitIntent` drives a reverse-side broker order for an open trade.
// =============================================================================

pub mod active_index;
pub mod entry;
pub mod exit;
pub mod manager;
pub mod reconciler;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Direction, ExitIntentStatus, ExitReason, OrderType, ProductType, TradeStatus};

/// NEWBUY is the first live trade for (user, symbol); REBUY means other
/// non-terminal trades already exist for the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeClassification {
    NewBuy,
    ReBuy,
}

impl TradeClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewBuy => "NEWBUY",
            Self::ReBuy => "REBUY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEWBUY" => Some(Self::NewBuy),
            "REBUY" => Some(Self::ReBuy),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multi-timeframe zone context captured from the signal at entry time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MtfSnapshot {
    pub htf_low: Option<f64>,
    pub htf_high: Option<f64>,
    pub itf_low: Option<f64>,
    pub itf_high: Option<f64>,
    pub ltf_low: Option<f64>,
    pub ltf_high: Option<f64>,
}

/// Strategy output consumed read-only by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub htf_low: f64,
    pub htf_high: f64,
    pub itf_low: f64,
    pub itf_high: f64,
    pub ltf_low: f64,
    pub ltf_high: f64,
    /// Protective floor below which the trade is abandoned.
    pub effective_floor: f64,
    /// Primary profit target.
    pub effective_ceiling: f64,
    pub confluence_score: f64,
    pub confluence_type: String,
}

/// A proposed trade, already validated and sized by the strategy layer.
/// Immutable to the core; `intent_id` doubles as the broker idempotency tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub intent_id: String,
    pub user_id: String,
    pub broker_id: String,
    pub user_broker_id: String,
    pub signal_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub calculated_qty: u32,
    pub limit_price: Option<f64>,
    pub validation_passed: bool,
}

/// The tracked position. Written exclusively by `TradeManagementService`;
/// `version` increments on every successful write and is the optimistic
/// token for any externally-initiated CAS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    /// Equals the originating intent id; UNIQUE in the store, which is what
    /// makes trade creation idempotent per intent.
    pub client_order_id: String,
    pub user_id: String,
    pub broker_id: String,
    pub user_broker_id: String,
    pub signal_id: Option<String>,
    pub symbol: String,
    pub direction: Direction,
    pub status: TradeStatus,
    pub classification: TradeClassification,
    pub order_type: OrderType,
    pub product_type: ProductType,

    /// Pre-filled with the intent limit price at creation, overwritten with
    /// the broker average price on entry fill.
    pub entry_price: Option<f64>,
    pub entry_qty: u32,
    pub entry_value: Option<f64>,
    pub entry_ts: Option<i64>,

    pub mtf: MtfSnapshot,
    /// Primary profit target evaluated by the exit monitor.
    pub exit_primary_price: Option<f64>,
    /// Protective stop evaluated by the exit monitor.
    pub effective_floor: Option<f64>,

    pub trailing_active: bool,
    pub trailing_highest_price: Option<f64>,
    pub trailing_stop_price: Option<f64>,

    pub exit_price: Option<f64>,
    pub exit_ts: Option<i64>,
    pub exit_trigger: Option<ExitReason>,
    pub exit_order_id: Option<String>,

    pub realized_pnl: Option<f64>,
    pub realized_log_return: Option<f64>,
    pub holding_days: Option<f64>,

    pub broker_order_id: Option<String>,
    pub last_broker_update_at: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub version: i64,
}

impl Trade {
    /// Build a CREATED row for an approved intent. Persisting it is the
    /// caller's job.
    pub fn for_intent(
        intent: &TradeIntent,
        signal: &Signal,
        classification: TradeClassification,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            trade_id: Uuid::new_v4().to_string(),
            client_order_id: intent.intent_id.clone(),
            user_id: intent.user_id.clone(),
            broker_id: intent.broker_id.clone(),
            user_broker_id: intent.user_broker_id.clone(),
            signal_id: Some(signal.signal_id.clone()),
            symbol: intent.symbol.clone(),
            direction: intent.direction,
            status: TradeStatus::Created,
            classification,
            order_type: intent.order_type,
            product_type: intent.product_type,
            entry_price: intent.limit_price,
            entry_qty: intent.calculated_qty,
            entry_value: intent
                .limit_price
                .map(|p| p * intent.calculated_qty as f64),
            entry_ts: None,
            mtf: MtfSnapshot {
                htf_low: Some(signal.htf_low),
                htf_high: Some(signal.htf_high),
                itf_low: Some(signal.itf_low),
                itf_high: Some(signal.itf_high),
                ltf_low: Some(signal.ltf_low),
                ltf_high: Some(signal.ltf_high),
            },
            exit_primary_price: Some(signal.effective_ceiling),
            effective_floor: Some(signal.effective_floor),
            trailing_active: false,
            trailing_highest_price: None,
            trailing_stop_price: None,
            exit_price: None,
            exit_ts: None,
            exit_trigger: None,
            exit_order_id: None,
            realized_pnl: None,
            realized_log_return: None,
            holding_days: None,
            broker_order_id: None,
            last_broker_update_at: None,
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 1,
        }
    }
}

/// Placeholder broker order id written during the APPROVED→PLACED CAS,
/// overwritten once the broker returns the real id.
pub fn exit_order_placeholder(now_ms: i64) -> String {
    format!("PENDING_{now_ms}")
}

/// Whether a broker order id is still the pre-placement placeholder.
pub fn is_placeholder_order_id(order_id: &str) -> bool {
    order_id.starts_with("PENDING_")
}

/// A proposed exit for an open trade. APPROVED → PLACED → {FILLED | FAILED |
/// CANCELLED}; the APPROVED→PLACED transition is a repository-level CAS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitIntent {
    pub exit_intent_id: String,
    pub trade_id: String,
    pub user_broker_id: String,
    pub exit_reason: ExitReason,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub calculated_qty: u32,
    pub limit_price: Option<f64>,
    pub status: ExitIntentStatus,
    pub broker_order_id: Option<String>,
    pub placed_at: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: i64,
}

impl ExitIntent {
    /// Build an APPROVED exit intent for the full remaining quantity of a
    /// trade. Market order unless the caller overrides.
    pub fn approved_for(trade: &Trade, reason: ExitReason) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            exit_intent_id: Uuid::new_v4().to_string(),
            trade_id: trade.trade_id.clone(),
            user_broker_id: trade.user_broker_id.clone(),
            exit_reason: reason,
            order_type: OrderType::Market,
            product_type: trade.product_type,
            calculated_qty: trade.entry_qty,
            limit_price: None,
            status: ExitIntentStatus::Approved,
            broker_order_id: None,
            placed_at: None,
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn sample_signal(symbol: &str) -> Signal {
        Signal {
            signal_id: "S1".into(),
            symbol: symbol.into(),
            direction: Direction::Buy,
            htf_low: 90.0,
            htf_high: 125.0,
            itf_low: 94.0,
            itf_high: 122.0,
            ltf_low: 96.0,
            ltf_high: 121.0,
            effective_floor: 95.0,
            effective_ceiling: 120.0,
            confluence_score: 0.8,
            confluence_type: "ZONE_STACK".into(),
        }
    }

    pub fn sample_intent(intent_id: &str, symbol: &str) -> TradeIntent {
        TradeIntent {
            intent_id: intent_id.into(),
            user_id: "U1".into(),
            broker_id: "B1".into(),
            user_broker_id: "UB1".into(),
            signal_id: "S1".into(),
            symbol: symbol.into(),
            direction: Direction::Buy,
            order_type: OrderType::Limit,
            product_type: ProductType::Cnc,
            calculated_qty: 10,
            limit_price: Some(100.0),
            validation_passed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn trade_for_intent_prefills_entry_from_limit() {
        let intent = sample_intent("I1", "ACME");
        let signal = sample_signal("ACME");
        let trade = Trade::for_intent(&intent, &signal, TradeClassification::NewBuy);

        assert_eq!(trade.status, TradeStatus::Created);
        assert_eq!(trade.client_order_id, "I1");
        assert_eq!(trade.entry_price, Some(100.0));
        assert_eq!(trade.entry_value, Some(1000.0));
        assert_eq!(trade.entry_qty, 10);
        assert_eq!(trade.exit_primary_price, Some(120.0));
        assert_eq!(trade.effective_floor, Some(95.0));
        assert_eq!(trade.mtf.htf_high, Some(125.0));
        assert!(trade.entry_ts.is_none());
        assert_eq!(trade.version, 1);
    }

    #[test]
    fn exit_intent_defaults_to_market_full_quantity() {
        let intent = sample_intent("I1", "ACME");
        let signal = sample_signal("ACME");
        let trade = Trade::for_intent(&intent, &signal, TradeClassification::NewBuy);
        let exit = ExitIntent::approved_for(&trade, ExitReason::TargetHit);

        assert_eq!(exit.status, ExitIntentStatus::Approved);
        assert_eq!(exit.order_type, OrderType::Market);
        assert_eq!(exit.calculated_qty, 10);
        assert_eq!(exit.trade_id, trade.trade_id);
        assert!(exit.broker_order_id.is_none());
    }

    #[test]
    fn placeholder_detection() {
        let id = exit_order_placeholder(1_700_000_000_000);
        assert!(is_placeholder_order_id(&id));
        assert!(!is_placeholder_order_id("250131000012345"));
    }
}
