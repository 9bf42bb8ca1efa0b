// =============================================================================
// Event Bus — in-process fan-out of trade and market-data lifecycle events
// =============================================================================
//
// Built on tokio's broadcast channel: emitters never block, and a slow
// subscriber only loses its own backlog (Lagged), never anybody else's.
// Emitting with zero subscribers is a no-op, so the core can emit
// unconditionally.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

/// Source tag attached to every event emitted by the trade state machine.
pub const SOURCE_TRADE_MANAGEMENT: &str = "TRADE_MANAGEMENT_SERVICE";
pub const SOURCE_ENTRY_EXECUTION: &str = "ENTRY_ORDER_EXECUTION";
pub const SOURCE_EXIT_EXECUTION: &str = "EXIT_ORDER_EXECUTION";
pub const SOURCE_RECONCILER: &str = "ORDER_RECONCILER";
pub const SOURCE_MARKET_DATA: &str = "MARKET_DATA";

/// Lifecycle event kinds. Wire names are SCREAMING_SNAKE, stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    #[serde(rename = "ORDER_CREATED")]
    OrderCreated,
    #[serde(rename = "ORDER_REJECTED")]
    OrderRejected,
    #[serde(rename = "TRADE_UPDATED")]
    TradeUpdated,
    #[serde(rename = "TRADE_CLOSED")]
    TradeClosed,
    #[serde(rename = "EXIT_ORDER_PLACED")]
    ExitOrderPlaced,
    #[serde(rename = "EXIT_INTENT_FILLED")]
    ExitIntentFilled,
    #[serde(rename = "EXIT_INTENT_FAILED")]
    ExitIntentFailed,
    #[serde(rename = "CANDLE")]
    Candle,
    #[serde(rename = "TICK")]
    Tick,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderCreated => "ORDER_CREATED",
            Self::OrderRejected => "ORDER_REJECTED",
            Self::TradeUpdated => "TRADE_UPDATED",
            Self::TradeClosed => "TRADE_CLOSED",
            Self::ExitOrderPlaced => "EXIT_ORDER_PLACED",
            Self::ExitIntentFilled => "EXIT_INTENT_FILLED",
            Self::ExitIntentFailed => "EXIT_INTENT_FAILED",
            Self::Candle => "CANDLE",
            Self::Tick => "TICK",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation tags scoping an event to a user/broker/trade. All optional;
/// global events carry none of them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventScope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_broker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_order_id: Option<String>,
}

/// A single emitted event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: EventType,
    pub payload: serde_json::Value,
    #[serde(flatten)]
    pub scope: EventScope,
    pub source: &'static str,
    /// Emission time, epoch milliseconds.
    pub at: i64,
}

/// Fan-out bus shared by every subsystem via `Arc<EventBus>`.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    emitted: AtomicU64,
}

/// Buffered events per subscriber before Lagged kicks in.
const BUS_CAPACITY: usize = 1024;

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            emitted: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit a user/broker-scoped lifecycle event.
    pub fn emit_user_broker(
        &self,
        event_type: EventType,
        scope: EventScope,
        payload: serde_json::Value,
        source: &'static str,
    ) {
        self.send(Event {
            event_type,
            payload,
            scope,
            source,
            at: Utc::now().timestamp_millis(),
        });
    }

    /// Emit an unscoped event (candles, ticks, engine-wide notices).
    pub fn emit_global(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
        source: &'static str,
    ) {
        self.send(Event {
            event_type,
            payload,
            scope: EventScope::default(),
            source,
            at: Utc::now().timestamp_millis(),
        });
    }

    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    fn send(&self, event: Event) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        // Err just means no live subscribers.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .field("emitted", &self.emitted.load(Ordering::Relaxed))
            .finish()
    }
}
