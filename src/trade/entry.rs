// =============================================================================
// Entry Order Execution — approved TradeIntent → broker entry order
// =============================================================================
//
// Gate order matters: the policy gates (validation flag, TRADING_ENABLED,
// the adapter's READ-ONLY state) are checked before any row is written, so
// a refused intent leaves no Trade behind. Only once the gates pass does
// the trade row get created and the placement job submitted.
// =============================================================================

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::broker::{
    BrokerRegistry, OrderResult, ERR_NOT_FOUND, ERR_READ_ONLY, ERR_TRADING_DISABLED,
    ERR_VALIDATION_FAILED,
};
use crate::coordinator::Coordinator;
use crate::events::{EventBus, EventScope, EventType, SOURCE_ENTRY_EXECUTION};
use crate::trade::manager::TradeManagementService;
use crate::trade::{Signal, TradeIntent};

pub struct EntryOrderExecution {
    tms: Arc<TradeManagementService>,
    registry: Arc<BrokerRegistry>,
    bus: Arc<EventBus>,
    entry_coordinator: Arc<Coordinator>,
    trading_enabled: bool,
}

impl EntryOrderExecution {
    pub fn new(
        tms: Arc<TradeManagementService>,
        registry: Arc<BrokerRegistry>,
        bus: Arc<EventBus>,
        entry_coordinator: Arc<Coordinator>,
        trading_enabled: bool,
    ) -> Self {
        Self {
            tms,
            registry,
            bus,
            entry_coordinator,
            trading_enabled,
        }
    }

    /// Submit an approved intent. Work runs on the entry coordinator keyed
    /// by symbol; the receiver resolves with the placement outcome.
    pub fn submit(
        self: &Arc<Self>,
        intent: TradeIntent,
        signal: Signal,
    ) -> oneshot::Receiver<OrderResult> {
        let exec = self.clone();
        let symbol = intent.symbol.clone();
        self.entry_coordinator
            .execute_with_result(&symbol, async move { exec.execute(intent, signal).await })
    }

    async fn execute(&self, intent: TradeIntent, signal: Signal) -> OrderResult {
        if !intent.validation_passed {
            warn!(intent_id = %intent.intent_id, "intent failed upstream validation");
            return self.refuse(&intent, ERR_VALIDATION_FAILED, "intent validation not passed");
        }

        if !self.trading_enabled {
            warn!(intent_id = %intent.intent_id, "trading is disabled — entry refused");
            return self.refuse(&intent, ERR_TRADING_DISABLED, "trading is disabled");
        }

        let Some(adapter) = self.registry.resolve(&intent.user_broker_id) else {
            warn!(
                intent_id = %intent.intent_id,
                user_broker_id = %intent.user_broker_id,
                "no broker adapter registered"
            );
            return self.refuse(&intent, ERR_NOT_FOUND, "no broker adapter for user");
        };

        // READ-ONLY gate: a stale feed or a down socket refuses placement
        // before any state exists.
        if !adapter.can_place_orders() {
            warn!(
                intent_id = %intent.intent_id,
                broker = adapter.broker_name(),
                "broker cannot place orders (stale feed or disconnected)"
            );
            return self.refuse(&intent, ERR_READ_ONLY, "broker feed is stale or disconnected");
        }

        let trade = match self.tms.create_trade_for_intent(&intent, &signal) {
            Ok(trade) => trade,
            Err(e) => {
                warn!(intent_id = %intent.intent_id, error = %e, "trade creation failed");
                return self.refuse(&intent, ERR_NOT_FOUND, format!("trade creation failed: {e}"));
            }
        };

        info!(
            intent_id = %intent.intent_id,
            trade_id = %trade.trade_id,
            symbol = %intent.symbol,
            qty = intent.calculated_qty,
            "placing entry order"
        );

        match self.tms.place_entry_order(&trade.trade_id, intent).await {
            Ok(result) => result,
            Err(_) => OrderResult::failed(ERR_NOT_FOUND, "placement job dropped"),
        }
    }

    /// Refusals never create a trade row; they surface as a failed result
    /// plus an ORDER_REJECTED event for the operator trail.
    fn refuse(&self, intent: &TradeIntent, code: &str, message: impl Into<String>) -> OrderResult {
        let message = message.into();
        self.bus.emit_user_broker(
            EventType::OrderRejected,
            EventScope {
                user_id: Some(intent.user_id.clone()),
                broker_id: Some(intent.broker_id.clone()),
                user_broker_id: Some(intent.user_broker_id.clone()),
                signal_id: Some(intent.signal_id.clone()),
                intent_id: Some(intent.intent_id.clone()),
                ..Default::default()
            },
            serde_json::json!({
                "symbol": intent.symbol,
                "errorCode": code,
                "errorMessage": message.clone(),
            }),
            SOURCE_ENTRY_EXECUTION,
        );
        OrderResult::failed(code, message)
    }
}

impl std::fmt::Debug for EntryOrderExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryOrderExecution")
            .field("trading_enabled", &self.trading_enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testutil::MockBroker;
    use crate::broker::BrokerAdapter;
    use crate::store::{Database, ExitIntentRepository, TradeRepository};
    use crate::trade::active_index::ActiveTradeIndex;
    use crate::trade::testutil::{sample_intent, sample_signal};
    use crate::types::TradeStatus;

    struct Fixture {
        exec: Arc<EntryOrderExecution>,
        trades: Arc<TradeRepository>,
        broker: Arc<MockBroker>,
    }

    fn fixture(trading_enabled: bool) -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let trades = Arc::new(TradeRepository::new(db.clone()));
        let exit_intents = Arc::new(ExitIntentRepository::new(db));
        let registry = Arc::new(BrokerRegistry::new());
        let broker = Arc::new(MockBroker::new());
        registry.register("UB1", broker.clone() as Arc<dyn BrokerAdapter>);

        let bus = Arc::new(EventBus::new());
        let tms = Arc::new(TradeManagementService::new(
            trades.clone(),
            exit_intents,
            registry.clone(),
            Arc::new(ActiveTradeIndex::new()),
            bus.clone(),
            Arc::new(Coordinator::with_partitions("trades", 2)),
            Arc::new(Coordinator::with_partitions("exits", 2)),
            30,
        ));

        let exec = Arc::new(EntryOrderExecution::new(
            tms,
            registry,
            bus,
            Arc::new(Coordinator::with_partitions("entries", 2)),
            trading_enabled,
        ));

        Fixture {
            exec,
            trades,
            broker,
        }
    }

    #[tokio::test]
    async fn approved_intent_flows_to_pending() {
        let f = fixture(true);
        f.broker.script_order_result(OrderResult::ok("O1"));

        let result = f
            .exec
            .submit(sample_intent("I1", "ACME"), sample_signal("ACME"))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.order_id.as_deref(), Some("O1"));

        let trade = f.trades.find_by_intent_id("I1").unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(f.broker.placed_count(), 1);
        // The idempotency tag rides on the broker order.
        assert_eq!(
            f.broker.placed.lock()[0].client_tag.as_deref(),
            Some("I1")
        );
    }

    #[tokio::test]
    async fn trading_disabled_refuses_without_a_row() {
        let f = fixture(false);
        let result = f
            .exec
            .submit(sample_intent("I1", "ACME"), sample_signal("ACME"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some(ERR_TRADING_DISABLED));
        assert!(f.trades.find_by_intent_id("I1").unwrap().is_none());
        assert_eq!(f.broker.placed_count(), 0);
    }

    #[tokio::test]
    async fn stale_feed_refuses_without_a_row() {
        let f = fixture(true);
        f.broker.set_can_place(false);

        let result = f
            .exec
            .submit(sample_intent("I1", "ACME"), sample_signal("ACME"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some(ERR_READ_ONLY));
        assert!(f.trades.find_by_intent_id("I1").unwrap().is_none());
    }

    #[tokio::test]
    async fn unvalidated_intent_is_refused() {
        let f = fixture(true);
        let mut intent = sample_intent("I1", "ACME");
        intent.validation_passed = false;

        let result = f.exec.submit(intent, sample_signal("ACME")).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some(ERR_VALIDATION_FAILED));
        assert!(f.trades.find_by_intent_id("I1").unwrap().is_none());
    }

    #[tokio::test]
    async fn broker_reject_marks_trade_rejected() {
        let f = fixture(true);
        f.broker
            .script_order_result(OrderResult::failed("BROKER_REJECTED", "margin shortfall"));

        let result = f
            .exec
            .submit(sample_intent("I1", "ACME"), sample_signal("ACME"))
            .await
            .unwrap();
        assert!(!result.success);

        let trade = f.trades.find_by_intent_id("I1").unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Rejected);
        assert_eq!(trade.error_message.as_deref(), Some("margin shortfall"));
    }
}
