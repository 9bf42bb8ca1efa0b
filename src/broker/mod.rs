// =============================================================================
// Broker abstraction — uniform contract over concrete broker backends
// =============================================================================
//
// The broker layer returns result structs, never errors, for order-path
// operations: a reject, a gate, and a network failure all land in the same
// `OrderResult` shape with an error code the state machine can dispatch on.
// `anyhow::Result` is reserved for query paths where the caller retries
// (reconcilers, backfill).
// =============================================================================

pub mod kite;
pub mod relay;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{Candle, Direction, OrderType, ProductType, Timeframe};

// ---------------------------------------------------------------------------
// Error codes shared across backends
// ---------------------------------------------------------------------------

pub const ERR_READ_ONLY: &str = "READ_ONLY";
pub const ERR_NOT_CONNECTED: &str = "NOT_CONNECTED";
pub const ERR_AUTH_FAILED: &str = "AUTH_FAILED";
pub const ERR_BROKER_REJECTED: &str = "BROKER_REJECTED";
pub const ERR_TRANSIENT: &str = "TRANSIENT_BROKER";
pub const ERR_TRADING_DISABLED: &str = "TRADING_DISABLED";
pub const ERR_VALIDATION_FAILED: &str = "VALIDATION_FAILED";
pub const ERR_NOT_FOUND: &str = "NOT_FOUND";
pub const ERR_TIMEOUT: &str = "TIMEOUT";

// ---------------------------------------------------------------------------
// Contract types
// ---------------------------------------------------------------------------

/// What a registered backend is allowed to do. A DATA broker feeds ticks and
/// historical candles; EXEC brokers own the order lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerRole {
    Data,
    Exec,
}

/// Credentials for `connect`. The access token is what brokers rotate daily;
/// `reload_token` swaps it without a full reconstruction.
#[derive(Clone)]
pub struct BrokerCredentials {
    pub api_key: String,
    pub access_token: String,
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("api_key", &"<redacted>")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Outcome of `connect`.
#[derive(Debug, Clone)]
pub struct ConnectionResult {
    pub success: bool,
    pub session_token: Option<String>,
    pub error_code: Option<String>,
    pub message: String,
}

impl ConnectionResult {
    pub fn ok(session_token: impl Into<String>) -> Self {
        Self {
            success: true,
            session_token: Some(session_token.into()),
            error_code: None,
            message: "connected".into(),
        }
    }

    pub fn failed(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            session_token: None,
            error_code: Some(code.to_string()),
            message: message.into(),
        }
    }
}

/// A new order to be placed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub quantity: u32,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    /// Idempotency tag attached to the broker order (equals the intent id).
    pub client_tag: Option<String>,
}

/// Fields of an existing order that may be modified in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderModify {
    pub quantity: Option<u32>,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub order_type: Option<OrderType>,
}

/// Outcome of place/modify/cancel.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub error_code: Option<String>,
    pub message: String,
}

impl OrderResult {
    pub fn ok(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            error_code: None,
            message: "accepted".into(),
        }
    }

    pub fn failed(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            error_code: Some(code.to_string()),
            message: message.into(),
        }
    }
}

/// Authoritative order state as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderStatus {
    pub order_id: String,
    /// Raw status string; classify with `OrderStateClass::classify`.
    pub status: String,
    pub average_price: f64,
    pub filled_quantity: u32,
    pub status_message: Option<String>,
    pub exchange_order_id: Option<String>,
}

/// An order update pushed (or polled) into the trade state machine.
#[derive(Debug, Clone)]
pub struct BrokerOrderUpdate {
    pub order_id: String,
    /// The idempotency tag, when the broker echoes it back.
    pub client_order_id: Option<String>,
    pub status: String,
    pub average_price: f64,
    pub filled_quantity: u32,
    pub status_message: Option<String>,
    /// Update time, epoch milliseconds.
    pub ts: i64,
}

impl BrokerOrderUpdate {
    pub fn from_status(status: &BrokerOrderStatus, ts: i64) -> Self {
        Self {
            order_id: status.order_id.clone(),
            client_order_id: None,
            status: status.status.clone(),
            average_price: status.average_price,
            filled_quantity: status.filled_quantity,
            status_message: status.status_message.clone(),
            ts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: i64,
    pub average_price: f64,
    pub pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerHolding {
    pub symbol: String,
    pub quantity: u32,
    pub average_price: f64,
    pub last_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerFunds {
    pub available_cash: f64,
    pub used_margin: f64,
}

/// One row of the instrument master: the token↔symbol mapping needed to
/// subscribe to the binary tick channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub instrument_token: u32,
    pub tradingsymbol: String,
    pub exchange: String,
    pub instrument_type: String,
    pub tick_size: f64,
    pub lot_size: u32,
}

// ---------------------------------------------------------------------------
// The adapter contract
// ---------------------------------------------------------------------------

/// Uniform broker contract. Implementations own their connection lifecycle;
/// ticks are delivered out-of-band through the channel handed to the
/// constructor.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn broker_name(&self) -> &str;
    fn role(&self) -> BrokerRole;

    /// Validate credentials against the broker and mark the adapter
    /// connected. May synchronously load the instrument master when the tick
    /// channel needs token mapping.
    async fn connect(&self, credentials: &BrokerCredentials) -> ConnectionResult;

    /// Idempotent; closes the WebSocket with a normal close and clears
    /// subscriptions.
    async fn disconnect(&self);

    /// Connected AND the feed is not stale.
    fn is_connected(&self) -> bool;

    /// Gate for live order placement: connected, feed fresh, socket up.
    fn can_place_orders(&self) -> bool;

    async fn place_order(&self, req: &OrderRequest) -> OrderResult;
    async fn modify_order(&self, order_id: &str, changes: &OrderModify) -> OrderResult;
    async fn cancel_order(&self, order_id: &str) -> OrderResult;

    async fn get_order_status(&self, order_id: &str) -> anyhow::Result<BrokerOrderStatus>;
    async fn get_open_orders(&self) -> anyhow::Result<Vec<BrokerOrderStatus>>;
    async fn get_positions(&self) -> anyhow::Result<Vec<BrokerPosition>>;
    async fn get_holdings(&self) -> anyhow::Result<Vec<BrokerHolding>>;
    async fn get_funds(&self) -> anyhow::Result<BrokerFunds>;
    async fn get_ltp(&self, symbol: &str) -> anyhow::Result<f64>;

    /// Ascending candles for `[from, to]`. Backends without native support
    /// for a timeframe aggregate the nearest supported base and discard a
    /// trailing partial bucket.
    async fn get_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Candle>>;

    async fn subscribe_ticks(&self, symbols: &[String]) -> anyhow::Result<()>;
    async fn unsubscribe_ticks(&self, symbols: &[String]) -> anyhow::Result<()>;

    async fn get_instruments(&self) -> anyhow::Result<Vec<Instrument>>;

    /// Swap the access token, drop the current socket, reset failure
    /// counters and reconnect with every registered symbol re-subscribed.
    async fn reload_token(&self, new_token: &str, session_id: &str) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Resolves {user_broker_id → adapter} and designates the DATA broker that
/// feeds ticks and historical candles.
pub struct BrokerRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn BrokerAdapter>>>,
    data_broker: RwLock<Option<Arc<dyn BrokerAdapter>>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            data_broker: RwLock::new(None),
        }
    }

    pub fn register(&self, user_broker_id: impl Into<String>, adapter: Arc<dyn BrokerAdapter>) {
        self.adapters.write().insert(user_broker_id.into(), adapter);
    }

    pub fn resolve(&self, user_broker_id: &str) -> Option<Arc<dyn BrokerAdapter>> {
        self.adapters.read().get(user_broker_id).cloned()
    }

    pub fn set_data_broker(&self, adapter: Arc<dyn BrokerAdapter>) {
        *self.data_broker.write() = Some(adapter);
    }

    pub fn data_broker(&self) -> Option<Arc<dyn BrokerAdapter>> {
        self.data_broker.read().clone()
    }
}

impl Default for BrokerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BrokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerRegistry")
            .field("adapters", &self.adapters.read().len())
            .field("has_data_broker", &self.data_broker.read().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Scriptable in-memory broker used across the trade and reconciler
    /// tests. Order placements pop from a queue of scripted results; status
    /// queries read a per-order map and count calls.
    pub struct MockBroker {
        pub name: String,
        role: BrokerRole,
        connected: AtomicBool,
        can_place: AtomicBool,
        next_order_results: Mutex<VecDeque<OrderResult>>,
        pub placed: Mutex<Vec<OrderRequest>>,
        pub cancelled: Mutex<Vec<String>>,
        statuses: Mutex<HashMap<String, BrokerOrderStatus>>,
        pub status_calls: AtomicU64,
        order_seq: AtomicU64,
    }

    impl MockBroker {
        pub fn new() -> Self {
            Self {
                name: "mock".into(),
                role: BrokerRole::Exec,
                connected: AtomicBool::new(true),
                can_place: AtomicBool::new(true),
                next_order_results: Mutex::new(VecDeque::new()),
                placed: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                statuses: Mutex::new(HashMap::new()),
                status_calls: AtomicU64::new(0),
                order_seq: AtomicU64::new(0),
            }
        }

        pub fn set_can_place(&self, can: bool) {
            self.can_place.store(can, Ordering::SeqCst);
        }

        /// Queue the result of the next `place_order` call.
        pub fn script_order_result(&self, result: OrderResult) {
            self.next_order_results.lock().push_back(result);
        }

        pub fn script_status(&self, status: BrokerOrderStatus) {
            self.statuses.lock().insert(status.order_id.clone(), status);
        }

        pub fn placed_count(&self) -> usize {
            self.placed.lock().len()
        }
    }

    #[async_trait]
    impl BrokerAdapter for MockBroker {
        fn broker_name(&self) -> &str {
            &self.name
        }

        fn role(&self) -> BrokerRole {
            self.role
        }

        async fn connect(&self, _credentials: &BrokerCredentials) -> ConnectionResult {
            self.connected.store(true, Ordering::SeqCst);
            ConnectionResult::ok("mock-session")
        }

        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn can_place_orders(&self) -> bool {
            self.connected.load(Ordering::SeqCst) && self.can_place.load(Ordering::SeqCst)
        }

        async fn place_order(&self, req: &OrderRequest) -> OrderResult {
            if !self.can_place_orders() {
                return OrderResult::failed(ERR_READ_ONLY, "mock broker is read-only");
            }
            self.placed.lock().push(req.clone());
            self.next_order_results.lock().pop_front().unwrap_or_else(|| {
                let n = self.order_seq.fetch_add(1, Ordering::SeqCst);
                OrderResult::ok(format!("MOCK-{n}"))
            })
        }

        async fn modify_order(&self, _order_id: &str, _changes: &OrderModify) -> OrderResult {
            OrderResult::failed(ERR_BROKER_REJECTED, "modify not scripted")
        }

        async fn cancel_order(&self, order_id: &str) -> OrderResult {
            self.cancelled.lock().push(order_id.to_string());
            OrderResult::ok(order_id)
        }

        async fn get_order_status(&self, order_id: &str) -> anyhow::Result<BrokerOrderStatus> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            self.statuses
                .lock()
                .get(order_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("mock: unknown order {order_id}"))
        }

        async fn get_open_orders(&self) -> anyhow::Result<Vec<BrokerOrderStatus>> {
            Ok(self.statuses.lock().values().cloned().collect())
        }

        async fn get_positions(&self) -> anyhow::Result<Vec<BrokerPosition>> {
            Ok(Vec::new())
        }

        async fn get_holdings(&self) -> anyhow::Result<Vec<BrokerHolding>> {
            Ok(Vec::new())
        }

        async fn get_funds(&self) -> anyhow::Result<BrokerFunds> {
            Ok(BrokerFunds {
                available_cash: 100_000.0,
                used_margin: 0.0,
            })
        }

        async fn get_ltp(&self, _symbol: &str) -> anyhow::Result<f64> {
            Ok(0.0)
        }

        async fn get_historical_candles(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Candle>> {
            Ok(Vec::new())
        }

        async fn subscribe_ticks(&self, _symbols: &[String]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn unsubscribe_ticks(&self, _symbols: &[String]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn get_instruments(&self) -> anyhow::Result<Vec<Instrument>> {
            Ok(Vec::new())
        }

        async fn reload_token(&self, _new_token: &str, _session_id: &str) -> anyhow::Result<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::MockBroker;
    use super::*;

    #[tokio::test]
    async fn registry_resolves_registered_adapters() {
        let registry = BrokerRegistry::new();
        let broker: Arc<dyn BrokerAdapter> = Arc::new(MockBroker::new());
        registry.register("UB1", broker.clone());
        registry.set_data_broker(broker);

        assert!(registry.resolve("UB1").is_some());
        assert!(registry.resolve("UB2").is_none());
        assert!(registry.data_broker().is_some());
    }

    #[tokio::test]
    async fn mock_refuses_orders_when_read_only() {
        let broker = MockBroker::new();
        broker.set_can_place(false);
        let result = broker
            .place_order(&OrderRequest {
                symbol: "ACME".into(),
                direction: Direction::Buy,
                order_type: OrderType::Limit,
                product_type: ProductType::Cnc,
                quantity: 1,
                price: Some(100.0),
                trigger_price: None,
                client_tag: None,
            })
            .await;
        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some(ERR_READ_ONLY));
        assert_eq!(broker.placed_count(), 0);
    }
}
