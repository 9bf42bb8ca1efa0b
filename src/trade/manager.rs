// =============================================================================
// Trade Management Service — sole writer of Trade rows
// =============================================================================
//
// Every mutation runs as a TradeCoordinator job keyed by tradeId, so for a
// fixed trade the writes form a total order equal to submission order. The
// entry broker call runs inside the same keyed job that applies PENDING, so
// the PENDING transition happens-before any fill processing for that trade.
//
// Handlers never let an error escape into the coordinator: a failed
// mutation is logged, the trade stays where it was, and the next broker
// update or reconciler pass heals it.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::broker::{
    BrokerOrderUpdate, BrokerRegistry, OrderRequest, OrderResult, ERR_NOT_FOUND,
};
use crate::coordinator::Coordinator;
use crate::events::{EventBus, EventScope, EventType, SOURCE_TRADE_MANAGEMENT};
use crate::store::{ExitIntentRepository, TradeRepository};
use crate::trade::exit::ExitOrderExecution;
use crate::trade::{active_index::ActiveTradeIndex, ExitIntent, Signal, Trade, TradeClassification, TradeIntent};
use crate::types::{Direction, ExitReason, OrderStateClass, TradeStatus};

pub struct TradeManagementService {
    trades: Arc<TradeRepository>,
    exit_intents: Arc<ExitIntentRepository>,
    registry: Arc<BrokerRegistry>,
    index: Arc<ActiveTradeIndex>,
    bus: Arc<EventBus>,
    trade_coordinator: Arc<Coordinator>,
    exit_coordinator: Arc<Coordinator>,
    /// Wired after construction; the exit execution service needs this
    /// service in turn.
    exit_execution: RwLock<Option<Arc<ExitOrderExecution>>>,
    max_holding_days: i64,
}

impl TradeManagementService {
    pub fn new(
        trades: Arc<TradeRepository>,
        exit_intents: Arc<ExitIntentRepository>,
        registry: Arc<BrokerRegistry>,
        index: Arc<ActiveTradeIndex>,
        bus: Arc<EventBus>,
        trade_coordinator: Arc<Coordinator>,
        exit_coordinator: Arc<Coordinator>,
        max_holding_days: i64,
    ) -> Self {
        Self {
            trades,
            exit_intents,
            registry,
            index,
            bus,
            trade_coordinator,
            exit_coordinator,
            exit_execution: RwLock::new(None),
            max_holding_days,
        }
    }

    pub fn set_exit_execution(&self, exit_execution: Arc<ExitOrderExecution>) {
        *self.exit_execution.write() = Some(exit_execution);
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    /// Classify and persist a CREATED row for an approved intent. Idempotent
    /// per intent: a duplicate intent id returns the already-existing row.
    pub fn create_trade_for_intent(
        &self,
        intent: &TradeIntent,
        signal: &Signal,
    ) -> anyhow::Result<Trade> {
        let live = self
            .trades
            .count_non_terminal(&intent.user_id, &intent.symbol)?;
        let classification = if live == 0 {
            TradeClassification::NewBuy
        } else {
            TradeClassification::ReBuy
        };

        let trade = Trade::for_intent(intent, signal, classification);
        if self.trades.insert(&trade)? {
            info!(
                trade_id = %trade.trade_id,
                intent_id = %intent.intent_id,
                symbol = %intent.symbol,
                classification = %classification,
                "trade row created"
            );
            return Ok(trade);
        }

        // UNIQUE(client_order_id) fired: hand back the earlier row.
        let existing = self
            .trades
            .find_by_intent_id(&intent.intent_id)?
            .ok_or_else(|| anyhow::anyhow!("duplicate intent {} but row missing", intent.intent_id))?;
        warn!(
            intent_id = %intent.intent_id,
            trade_id = %existing.trade_id,
            "duplicate intent — reusing existing trade row"
        );
        Ok(existing)
    }

    // -------------------------------------------------------------------------
    // Entry placement
    // -------------------------------------------------------------------------

    /// Place the entry order for a CREATED trade and apply the resulting
    /// transition (PENDING with the broker id, or REJECTED), all inside one
    /// keyed job so later fill updates serialize behind it.
    pub fn place_entry_order(
        self: &Arc<Self>,
        trade_id: &str,
        intent: TradeIntent,
    ) -> oneshot::Receiver<OrderResult> {
        let service = self.clone();
        let trade_id_owned = trade_id.to_string();

        self.trade_coordinator.execute_with_result(trade_id, async move {
            let Some(mut trade) = service.load(&trade_id_owned) else {
                return OrderResult::failed(ERR_NOT_FOUND, "trade row not found");
            };
            if trade.status != TradeStatus::Created {
                warn!(trade_id = %trade.trade_id, status = %trade.status, "entry placement skipped — unexpected status");
                return OrderResult::failed(ERR_NOT_FOUND, "trade is not in CREATED");
            }

            let Some(adapter) = service.registry.resolve(&trade.user_broker_id) else {
                service.apply_reject(&mut trade, ERR_NOT_FOUND, "no broker adapter for user");
                return OrderResult::failed(ERR_NOT_FOUND, "no broker adapter for user");
            };

            let request = OrderRequest {
                symbol: trade.symbol.clone(),
                direction: trade.direction,
                order_type: trade.order_type,
                product_type: trade.product_type,
                quantity: trade.entry_qty,
                price: intent.limit_price,
                trigger_price: None,
                client_tag: Some(trade.client_order_id.clone()),
            };

            let result = adapter.place_order(&request).await;
            let now = Utc::now().timestamp_millis();

            if result.success {
                let order_id = result.order_id.clone().unwrap_or_default();
                trade.status = TradeStatus::Pending;
                trade.broker_order_id = Some(order_id.clone());
                trade.last_broker_update_at = Some(now);
                if service.persist(&mut trade) {
                    service.emit(
                        EventType::OrderCreated,
                        &trade,
                        json!({
                            "symbol": trade.symbol,
                            "intentId": trade.client_order_id,
                            "brokerOrderId": order_id,
                        }),
                    );
                    service.emit(
                        EventType::TradeUpdated,
                        &trade,
                        json!({ "symbol": trade.symbol, "status": trade.status.as_str() }),
                    );
                }
            } else {
                let code = result.error_code.clone().unwrap_or_else(|| "UNKNOWN".into());
                service.apply_reject(&mut trade, &code, &result.message);
            }

            result
        })
    }

    // -------------------------------------------------------------------------
    // Broker order updates
    // -------------------------------------------------------------------------

    /// Apply an authoritative broker order state. Resolution is by broker
    /// order id first, intent id second. Returns whether the row changed
    /// beyond the `last_broker_update_at` bump.
    pub fn on_broker_order_update(
        self: &Arc<Self>,
        update: BrokerOrderUpdate,
    ) -> oneshot::Receiver<bool> {
        let resolved = self
            .trades
            .find_by_broker_order_id(&update.order_id)
            .ok()
            .flatten()
            .or_else(|| {
                update
                    .client_order_id
                    .as_deref()
                    .and_then(|cid| self.trades.find_by_intent_id(cid).ok().flatten())
            });

        let Some(trade) = resolved else {
            debug!(order_id = %update.order_id, "broker update for unknown order");
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(false);
            return rx;
        };

        let key = trade.trade_id.clone();
        let service = self.clone();
        self.trade_coordinator.execute_with_result(&key, async move {
            service.apply_broker_update(&trade.trade_id, &update)
        })
    }

    fn apply_broker_update(&self, trade_id: &str, update: &BrokerOrderUpdate) -> bool {
        let Some(mut trade) = self.load(trade_id) else {
            return false;
        };
        if trade.status.is_terminal() {
            debug!(trade_id, status = %trade.status, "broker update ignored — terminal state");
            return false;
        }

        match OrderStateClass::classify(&update.status) {
            OrderStateClass::Filled if trade.status == TradeStatus::Pending => {
                self.apply_entry_fill(&mut trade, update)
            }
            OrderStateClass::Filled if trade.status == TradeStatus::Exiting => {
                let reason = trade.exit_trigger.unwrap_or(ExitReason::Manual);
                self.apply_exit_fill(
                    &mut trade,
                    update.average_price,
                    update.filled_quantity,
                    reason,
                    update.ts,
                )
            }
            OrderStateClass::Filled => {
                warn!(
                    trade_id,
                    status = %trade.status,
                    "fill update in unexpected trade state — leaving row for reconciler"
                );
                false
            }
            OrderStateClass::Rejected | OrderStateClass::Cancelled => {
                let message = update
                    .status_message
                    .clone()
                    .unwrap_or_else(|| "order rejected by broker".into());
                self.apply_reject(&mut trade, "BROKER_REJECTED", &message);
                true
            }
            OrderStateClass::Working => {
                trade.last_broker_update_at = Some(update.ts);
                self.persist(&mut trade);
                false
            }
            OrderStateClass::Unknown => {
                warn!(
                    trade_id,
                    status = %update.status,
                    "unknown broker status — row left untouched"
                );
                false
            }
        }
    }

    fn apply_entry_fill(&self, trade: &mut Trade, update: &BrokerOrderUpdate) -> bool {
        trade.status = TradeStatus::Open;
        trade.entry_price = Some(update.average_price);
        if update.filled_quantity > 0 {
            trade.entry_qty = update.filled_quantity;
        }
        trade.entry_value = Some(update.average_price * trade.entry_qty as f64);
        trade.entry_ts = Some(update.ts);
        trade.last_broker_update_at = Some(update.ts);

        if !self.persist(trade) {
            return false;
        }

        self.index.add_trade(&trade.symbol, &trade.trade_id);
        info!(
            trade_id = %trade.trade_id,
            symbol = %trade.symbol,
            entry_price = update.average_price,
            qty = trade.entry_qty,
            "entry filled — trade OPEN"
        );
        self.emit(
            EventType::TradeUpdated,
            trade,
            json!({
                "symbol": trade.symbol,
                "status": trade.status.as_str(),
                "avgPrice": update.average_price,
                "filledQty": update.filled_quantity,
            }),
        );
        true
    }

    fn apply_exit_fill(
        &self,
        trade: &mut Trade,
        exit_price: f64,
        exit_qty: u32,
        reason: ExitReason,
        exit_ts: i64,
    ) -> bool {
        if trade.status == TradeStatus::Closed {
            debug!(trade_id = %trade.trade_id, "exit fill replay — already closed");
            return false;
        }

        let entry_price = trade.entry_price.unwrap_or(0.0);
        let qty = if exit_qty > 0 { exit_qty } else { trade.entry_qty };
        let (pnl, log_return) = compute_close(trade.direction, entry_price, exit_price, qty);

        trade.status = TradeStatus::Closed;
        trade.exit_price = Some(exit_price);
        trade.exit_ts = Some(exit_ts);
        trade.exit_trigger = Some(reason);
        trade.realized_pnl = Some(pnl);
        trade.realized_log_return = log_return;
        trade.holding_days = trade
            .entry_ts
            .map(|entry| (exit_ts - entry) as f64 / 86_400_000.0);
        trade.last_broker_update_at = Some(exit_ts);

        if !self.persist(trade) {
            return false;
        }

        self.index.remove_trade(&trade.trade_id);
        info!(
            trade_id = %trade.trade_id,
            symbol = %trade.symbol,
            exit_price,
            realized_pnl = pnl,
            reason = %reason,
            "exit filled — trade CLOSED"
        );
        self.emit(
            EventType::TradeClosed,
            trade,
            json!({
                "symbol": trade.symbol,
                "avgPrice": exit_price,
                "filledQty": qty,
                "exitReason": reason.as_str(),
                "realizedPnl": pnl,
                "holdingDays": trade.holding_days,
            }),
        );
        true
    }

    fn apply_reject(&self, trade: &mut Trade, code: &str, message: &str) {
        trade.status = TradeStatus::Rejected;
        trade.error_code = Some(code.to_string());
        trade.error_message = Some(message.to_string());
        trade.last_broker_update_at = Some(Utc::now().timestamp_millis());

        if self.persist(trade) {
            self.index.remove_trade(&trade.trade_id);
            warn!(
                trade_id = %trade.trade_id,
                code,
                message,
                "trade REJECTED"
            );
            self.emit(
                EventType::OrderRejected,
                trade,
                json!({
                    "symbol": trade.symbol,
                    "errorCode": code,
                    "errorMessage": message,
                }),
            );
        }
    }

    // -------------------------------------------------------------------------
    // Price-driven exit evaluation
    // -------------------------------------------------------------------------

    /// Fan out one exit-evaluation job per open trade on the symbol. Each
    /// job is keyed by its tradeId on the exit coordinator.
    pub fn on_price_update(self: &Arc<Self>, symbol: &str, ltp: f64, ts_ms: i64) {
        for trade_id in self.index.get_open_trades(symbol) {
            let service = self.clone();
            let id = trade_id.clone();
            self.exit_coordinator.execute(&trade_id, async move {
                service.evaluate_exit_for(&id, ltp, ts_ms).await;
            });
        }
    }

    async fn evaluate_exit_for(&self, trade_id: &str, ltp: f64, ts_ms: i64) {
        let Some(trade) = self.load(trade_id) else {
            return;
        };
        if trade.status != TradeStatus::Open {
            return;
        }

        let Some(reason) = evaluate_exit(&trade, ltp, ts_ms, self.max_holding_days) else {
            return;
        };

        info!(
            trade_id,
            symbol = %trade.symbol,
            ltp,
            reason = %reason,
            "exit condition hit — creating exit intent"
        );

        let intent = ExitIntent::approved_for(&trade, reason);
        if let Err(e) = self.exit_intents.insert(&intent) {
            error!(trade_id, error = %e, "exit intent persist failed");
            return;
        }

        let exit_execution = self.exit_execution.read().clone();
        match exit_execution {
            Some(exec) => exec.execute(&intent).await,
            None => warn!(trade_id, "no exit execution service wired — intent left APPROVED"),
        }
    }

    // -------------------------------------------------------------------------
    // Targeted mutations
    // -------------------------------------------------------------------------

    /// Raise the trailing high-water mark. Applies iff activating or the new
    /// high exceeds the current one.
    pub fn update_trailing_stop(
        self: &Arc<Self>,
        trade_id: &str,
        highest_price: f64,
        stop_price: f64,
        activate: bool,
    ) -> oneshot::Receiver<bool> {
        let service = self.clone();
        let id = trade_id.to_string();
        self.trade_coordinator.execute_with_result(trade_id, async move {
            let Some(mut trade) = service.load(&id) else {
                return false;
            };
            if trade.status.is_terminal() {
                return false;
            }

            let current = trade.trailing_highest_price.unwrap_or(f64::MIN);
            if !activate && highest_price <= current {
                return false;
            }

            trade.trailing_active = trade.trailing_active || activate;
            trade.trailing_highest_price = Some(highest_price);
            trade.trailing_stop_price = Some(stop_price);
            service.persist(&mut trade)
        })
    }

    /// Transition into EXITING once the broker has acknowledged the exit
    /// order. Removing the trade from the index here stops further exit
    /// evaluation for it.
    pub fn update_trade_exit_order_placed(
        self: &Arc<Self>,
        trade_id: &str,
        exit_order_id: &str,
        exit_reason: ExitReason,
        placed_at: i64,
    ) -> oneshot::Receiver<bool> {
        let service = self.clone();
        let id = trade_id.to_string();
        let order_id = exit_order_id.to_string();
        self.trade_coordinator.execute_with_result(trade_id, async move {
            let Some(mut trade) = service.load(&id) else {
                return false;
            };
            if trade.status != TradeStatus::Open {
                warn!(trade_id = %id, status = %trade.status, "exit placement for non-OPEN trade");
                return false;
            }

            trade.status = TradeStatus::Exiting;
            trade.exit_order_id = Some(order_id.clone());
            trade.exit_trigger = Some(exit_reason);
            trade.last_broker_update_at = Some(placed_at);
            if !service.persist(&mut trade) {
                return false;
            }

            service.index.remove_trade(&trade.trade_id);
            service.emit(
                EventType::TradeUpdated,
                &trade,
                json!({
                    "symbol": trade.symbol,
                    "status": trade.status.as_str(),
                    "exitReason": exit_reason.as_str(),
                }),
            );
            true
        })
    }

    /// Idempotent close from an exit fill (reconciler or postback path).
    pub fn close_trade_on_exit_fill(
        self: &Arc<Self>,
        trade_id: &str,
        exit_price: f64,
        exit_qty: u32,
        exit_reason: ExitReason,
        exit_ts: i64,
    ) -> oneshot::Receiver<bool> {
        let service = self.clone();
        let id = trade_id.to_string();
        self.trade_coordinator.execute_with_result(trade_id, async move {
            let Some(mut trade) = service.load(&id) else {
                return false;
            };
            if trade.status == TradeStatus::Closed {
                return false;
            }
            if trade.status.is_terminal() {
                debug!(trade_id = %id, status = %trade.status, "exit fill on terminal trade ignored");
                return false;
            }
            service.apply_exit_fill(&mut trade, exit_price, exit_qty, exit_reason, exit_ts)
        })
    }

    pub fn mark_trade_rejected(
        self: &Arc<Self>,
        trade_id: &str,
        code: &str,
        message: &str,
    ) -> oneshot::Receiver<bool> {
        let service = self.clone();
        let id = trade_id.to_string();
        let code = code.to_string();
        let message = message.to_string();
        self.trade_coordinator.execute_with_result(trade_id, async move {
            let Some(mut trade) = service.load(&id) else {
                return false;
            };
            if trade.status.is_terminal() {
                return false;
            }
            service.apply_reject(&mut trade, &code, &message);
            true
        })
    }

    pub fn mark_trade_rejected_by_intent_id(
        self: &Arc<Self>,
        intent_id: &str,
        code: &str,
        message: &str,
    ) -> oneshot::Receiver<bool> {
        match self.trades.find_by_intent_id(intent_id) {
            Ok(Some(trade)) => self.mark_trade_rejected(&trade.trade_id, code, message),
            other => {
                if let Err(e) = other {
                    error!(intent_id, error = %e, "intent lookup failed");
                } else {
                    warn!(intent_id, "no trade for intent — nothing to reject");
                }
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(false);
                rx
            }
        }
    }

    /// Startup: repopulate the index from all OPEN rows.
    pub fn rebuild_active_index(&self) -> anyhow::Result<usize> {
        let open = self.trades.find_by_status(TradeStatus::Open)?;
        let count = open.len();
        self.index.rebuild(&open);
        info!(open_trades = count, "active trade index rebuilt");
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn load(&self, trade_id: &str) -> Option<Trade> {
        match self.trades.find_by_id(trade_id) {
            Ok(Some(trade)) => Some(trade),
            Ok(None) => {
                warn!(trade_id, "trade row not found");
                None
            }
            Err(e) => {
                error!(trade_id, error = %e, "trade load failed");
                None
            }
        }
    }

    /// CAS-persist; a version conflict is logged loudly because this service
    /// is supposed to be the only writer.
    fn persist(&self, trade: &mut Trade) -> bool {
        match self.trades.update(trade) {
            Ok(true) => true,
            Ok(false) => {
                error!(
                    trade_id = %trade.trade_id,
                    version = trade.version,
                    "version CAS lost — another writer touched the row"
                );
                false
            }
            Err(e) => {
                error!(trade_id = %trade.trade_id, error = %e, "trade persist failed");
                false
            }
        }
    }

    fn emit(&self, event_type: EventType, trade: &Trade, payload: serde_json::Value) {
        self.bus.emit_user_broker(
            event_type,
            EventScope {
                user_id: Some(trade.user_id.clone()),
                broker_id: Some(trade.broker_id.clone()),
                user_broker_id: Some(trade.user_broker_id.clone()),
                signal_id: trade.signal_id.clone(),
                intent_id: Some(trade.client_order_id.clone()),
                trade_id: Some(trade.trade_id.clone()),
                broker_order_id: trade.broker_order_id.clone(),
            },
            payload,
            SOURCE_TRADE_MANAGEMENT,
        );
    }

    #[cfg(test)]
    pub(crate) async fn flush(&self, trade_id: &str) {
        let _ = self
            .trade_coordinator
            .execute_with_result(trade_id, async {})
            .await;
        let _ = self
            .exit_coordinator
            .execute_with_result(trade_id, async {})
            .await;
    }
}

impl std::fmt::Debug for TradeManagementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeManagementService")
            .field("active_trades", &self.index.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Exit evaluation & PnL
// ---------------------------------------------------------------------------

/// Ordered exit checks for an OPEN trade: primary target, protective floor,
/// then maximum holding time. Shorts mirror the comparisons. The first
/// matching reason wins.
pub fn evaluate_exit(
    trade: &Trade,
    ltp: f64,
    now_ms: i64,
    max_holding_days: i64,
) -> Option<ExitReason> {
    let long = trade.direction == Direction::Buy;

    if let Some(target) = trade.exit_primary_price {
        let hit = if long { ltp >= target } else { ltp <= target };
        if hit {
            return Some(ExitReason::TargetHit);
        }
    }

    if let Some(floor) = trade.effective_floor {
        let hit = if long { ltp <= floor } else { ltp >= floor };
        if hit {
            return Some(ExitReason::StopLoss);
        }
    }

    if let Some(entry_ts) = trade.entry_ts {
        let held_hours = (now_ms - entry_ts) as f64 / 3_600_000.0;
        if held_hours >= (max_holding_days * 24) as f64 {
            return Some(ExitReason::TimeBased);
        }
    }

    None
}

/// Realized PnL and log return for a close. Short trades mirror the sign.
fn compute_close(direction: Direction, entry: f64, exit: f64, qty: u32) -> (f64, Option<f64>) {
    let qty = qty as f64;
    let pnl = match direction {
        Direction::Buy => (exit - entry) * qty,
        Direction::Sell => (entry - exit) * qty,
    };
    let log_return = if entry > 0.0 && exit > 0.0 {
        Some(match direction {
            Direction::Buy => (exit / entry).ln(),
            Direction::Sell => (entry / exit).ln(),
        })
    } else {
        None
    };
    (pnl, log_return)
}
