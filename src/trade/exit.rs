// =============================================================================
// Exit Order Execution — APPROVED ExitIntent → reverse-side broker order
// =============================================================================
//
// The double-placement guard is the repository CAS: APPROVED→PLACED writes
// the `PENDING_<ms>` placeholder and succeeds for exactly one caller. The
// broker order goes out only after winning that CAS; the placeholder is
// overwritten with the broker's order id, and the trade moves to EXITING
// once the broker has acknowledged.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::broker::{BrokerRegistry, OrderRequest, ERR_NOT_FOUND, ERR_READ_ONLY};
use crate::events::{EventBus, EventScope, EventType, SOURCE_EXIT_EXECUTION};
use crate::store::{ExitIntentRepository, TradeRepository};
use crate::trade::manager::TradeManagementService;
use crate::trade::{exit_order_placeholder, ExitIntent, Trade};
use crate::types::{ExitIntentStatus, TradeStatus};

pub struct ExitOrderExecution {
    exit_intents: Arc<ExitIntentRepository>,
    trades: Arc<TradeRepository>,
    registry: Arc<BrokerRegistry>,
    bus: Arc<EventBus>,
    tms: Arc<TradeManagementService>,
}

impl ExitOrderExecution {
    pub fn new(
        exit_intents: Arc<ExitIntentRepository>,
        trades: Arc<TradeRepository>,
        registry: Arc<BrokerRegistry>,
        bus: Arc<EventBus>,
        tms: Arc<TradeManagementService>,
    ) -> Self {
        Self {
            exit_intents,
            trades,
            registry,
            bus,
            tms,
        }
    }

    /// Execute an APPROVED exit intent against the broker.
    pub async fn execute(&self, intent: &ExitIntent) {
        if intent.status != ExitIntentStatus::Approved {
            warn!(
                exit_intent_id = %intent.exit_intent_id,
                status = %intent.status,
                "exit execution skipped — intent is not APPROVED"
            );
            return;
        }

        let trade = match self.trades.find_by_id(&intent.trade_id) {
            Ok(Some(trade)) => trade,
            Ok(None) => {
                warn!(trade_id = %intent.trade_id, "exit intent references a missing trade");
                return;
            }
            Err(e) => {
                warn!(trade_id = %intent.trade_id, error = %e, "trade lookup failed");
                return;
            }
        };

        if trade.status != TradeStatus::Open {
            warn!(
                trade_id = %trade.trade_id,
                status = %trade.status,
                "exit execution skipped — trade is not OPEN"
            );
            return;
        }

        let Some(adapter) = self.registry.resolve(&intent.user_broker_id) else {
            self.fail(intent, &trade, ERR_NOT_FOUND, "no broker adapter for user");
            return;
        };
        if !adapter.can_place_orders() {
            self.fail(intent, &trade, ERR_READ_ONLY, "broker feed is stale or disconnected");
            return;
        }

        // The CAS: one winner writes the placeholder and proceeds.
        let now = Utc::now().timestamp_millis();
        let placeholder = exit_order_placeholder(now);
        match self
            .exit_intents
            .place_exit_order(&intent.exit_intent_id, &placeholder, now)
        {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    exit_intent_id = %intent.exit_intent_id,
                    "exit placement CAS lost — another caller owns this intent"
                );
                return;
            }
            Err(e) => {
                warn!(exit_intent_id = %intent.exit_intent_id, error = %e, "exit CAS failed");
                return;
            }
        }

        let request = OrderRequest {
            symbol: trade.symbol.clone(),
            direction: trade.direction.reverse(),
            order_type: intent.order_type,
            product_type: intent.product_type,
            quantity: intent.calculated_qty,
            price: intent.limit_price,
            trigger_price: None,
            client_tag: Some(intent.exit_intent_id.clone()),
        };

        info!(
            exit_intent_id = %intent.exit_intent_id,
            trade_id = %trade.trade_id,
            symbol = %trade.symbol,
            side = %request.direction,
            qty = request.quantity,
            reason = %intent.exit_reason,
            "placing exit order"
        );

        let result = adapter.place_order(&request).await;
        if !result.success {
            let code = result.error_code.as_deref().unwrap_or("UNKNOWN");
            self.fail(intent, &trade, code, &result.message);
            return;
        }

        let broker_order_id = result.order_id.unwrap_or_default();
        if let Err(e) = self
            .exit_intents
            .update_broker_order_id(&intent.exit_intent_id, &broker_order_id)
        {
            warn!(
                exit_intent_id = %intent.exit_intent_id,
                error = %e,
                "placeholder overwrite failed — reconciler will not see this order"
            );
        }

        let _ = self
            .tms
            .update_trade_exit_order_placed(
                &trade.trade_id,
                &broker_order_id,
                intent.exit_reason,
                now,
            )
            .await;

        self.bus.emit_user_broker(
            EventType::ExitOrderPlaced,
            self.scope(intent, &trade, Some(broker_order_id.clone())),
            json!({
                "symbol": trade.symbol,
                "exitIntentId": intent.exit_intent_id,
                "brokerOrderId": broker_order_id,
                "exitReason": intent.exit_reason.as_str(),
            }),
            SOURCE_EXIT_EXECUTION,
        );
    }

    fn fail(&self, intent: &ExitIntent, trade: &Trade, code: &str, message: &str) {
        warn!(
            exit_intent_id = %intent.exit_intent_id,
            trade_id = %trade.trade_id,
            code,
            message,
            "exit intent FAILED"
        );
        if let Err(e) = self
            .exit_intents
            .mark_failed(&intent.exit_intent_id, code, message)
        {
            warn!(exit_intent_id = %intent.exit_intent_id, error = %e, "exit intent failure persist failed");
        }
        self.bus.emit_user_broker(
            EventType::ExitIntentFailed,
            self.scope(intent, trade, None),
            json!({
                "symbol": trade.symbol,
                "exitIntentId": intent.exit_intent_id,
                "exitReason": intent.exit_reason.as_str(),
                "errorCode": code,
                "errorMessage": message,
            }),
            SOURCE_EXIT_EXECUTION,
        );
    }

    fn scope(&self, intent: &ExitIntent, trade: &Trade, broker_order_id: Option<String>) -> EventScope {
        EventScope {
            user_id: Some(trade.user_id.clone()),
            broker_id: Some(trade.broker_id.clone()),
            user_broker_id: Some(intent.user_broker_id.clone()),
            signal_id: trade.signal_id.clone(),
            intent_id: Some(trade.client_order_id.clone()),
            trade_id: Some(trade.trade_id.clone()),
            broker_order_id,
        }
    }
}

impl std::fmt::Debug for ExitOrderExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitOrderExecution").finish_non_exhaustive()
    }
}
