// =============================================================================
// Order Reconcilers — resynchronize non-terminal rows with broker truth
// =============================================================================
//
// Two timer loops with the same skeleton. Each cycle loads its working set,
// then per row: the wall-clock timeout check runs first and never touches
// the broker; otherwise a semaphore permit bounds the concurrent
// broker-status calls, and the authoritative state is applied through the
// trade state machine. A row that blows up is logged and skipped — one bad
// order never aborts a cycle.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::broker::{BrokerOrderUpdate, BrokerRegistry, ERR_BROKER_REJECTED, ERR_TIMEOUT};
use crate::events::{EventBus, EventScope, EventType, SOURCE_RECONCILER};
use crate::store::{ExitIntentRepository, TradeRepository};
use crate::trade::manager::TradeManagementService;
use crate::trade::ExitIntent;
use crate::types::{OrderStateClass, TradeStatus};

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Atomic counters shared by a reconciler and its observers.
#[derive(Debug, Default)]
pub struct ReconcilerMetrics {
    last_checked_at: AtomicI64,
    last_run_ms: AtomicI64,
    total_checked: AtomicU64,
    total_updated: AtomicU64,
    total_timeouts: AtomicU64,
    total_rate_limited: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcilerSnapshot {
    pub last_checked_at: i64,
    pub last_run_ms: i64,
    pub total_checked: u64,
    pub total_updated: u64,
    pub total_timeouts: u64,
    pub total_rate_limited: u64,
    pub available_permits: usize,
}

impl ReconcilerMetrics {
    fn snapshot(&self, available_permits: usize) -> ReconcilerSnapshot {
        ReconcilerSnapshot {
            last_checked_at: self.last_checked_at.load(Ordering::Relaxed),
            last_run_ms: self.last_run_ms.load(Ordering::Relaxed),
            total_checked: self.total_checked.load(Ordering::Relaxed),
            total_updated: self.total_updated.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            total_rate_limited: self.total_rate_limited.load(Ordering::Relaxed),
            available_permits,
        }
    }

    fn finish_cycle(&self, started: Instant) {
        self.last_checked_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.last_run_ms
            .store(started.elapsed().as_millis() as i64, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Pending entry orders
// ---------------------------------------------------------------------------

pub struct PendingOrderReconciler {
    trades: Arc<TradeRepository>,
    registry: Arc<BrokerRegistry>,
    tms: Arc<TradeManagementService>,
    semaphore: Arc<Semaphore>,
    metrics: ReconcilerMetrics,
    period: Duration,
    initial_delay: Duration,
    pending_timeout: Duration,
}

impl PendingOrderReconciler {
    pub fn new(
        trades: Arc<TradeRepository>,
        registry: Arc<BrokerRegistry>,
        tms: Arc<TradeManagementService>,
        max_concurrent_broker_calls: usize,
        period: Duration,
        initial_delay: Duration,
        pending_timeout: Duration,
    ) -> Self {
        Self {
            trades,
            registry,
            tms,
            semaphore: Arc::new(Semaphore::new(max_concurrent_broker_calls)),
            metrics: ReconcilerMetrics::default(),
            period,
            initial_delay,
            pending_timeout,
        }
    }

    pub fn snapshot(&self) -> ReconcilerSnapshot {
        self.metrics.snapshot(self.semaphore.available_permits())
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            period_secs = self.period.as_secs(),
            timeout_secs = self.pending_timeout.as_secs(),
            "pending-order reconciler started"
        );
        tokio::time::sleep(self.initial_delay).await;
        let mut ticker = tokio::time::interval(self.period);
        loop {
            ticker.tick().await;
            self.run_cycle().await;
        }
    }

    /// One reconciliation pass over every PENDING trade.
    pub async fn run_cycle(&self) {
        let started = Instant::now();

        let rows = match self.trades.find_by_status(TradeStatus::Pending) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "pending reconcile: store read failed");
                self.metrics.finish_cycle(started);
                return;
            }
        };

        debug!(count = rows.len(), "pending reconcile cycle");
        for trade in rows {
            let trade_id = trade.trade_id.clone();
            if let Err(e) = self.reconcile_row(trade).await {
                warn!(trade_id = %trade_id, error = %e, "pending reconcile row failed");
            }
        }

        self.metrics.finish_cycle(started);
    }

    async fn reconcile_row(&self, trade: crate::trade::Trade) -> Result<()> {
        self.metrics.total_checked.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis();

        // Timeout first — an expired row is rejected without a broker call.
        let age_base = trade.last_broker_update_at.unwrap_or(trade.created_at).max(trade.created_at);
        if now - age_base > self.pending_timeout.as_millis() as i64 {
            warn!(
                trade_id = %trade.trade_id,
                age_ms = now - age_base,
                "PENDING trade timed out — rejecting"
            );
            self.metrics.total_timeouts.fetch_add(1, Ordering::Relaxed);
            let _ = self
                .tms
                .mark_trade_rejected(&trade.trade_id, ERR_TIMEOUT, "no broker update within pending timeout")
                .await;
            return Ok(());
        }

        let order_id = trade
            .broker_order_id
            .clone()
            .context("PENDING trade has no broker order id")?;
        let adapter = self
            .registry
            .resolve(&trade.user_broker_id)
            .with_context(|| format!("no adapter for {}", trade.user_broker_id))?;

        // Bound concurrent broker calls; skip (not block) when saturated.
        let Ok(_permit) = self.semaphore.try_acquire() else {
            self.metrics.total_rate_limited.fetch_add(1, Ordering::Relaxed);
            debug!(trade_id = %trade.trade_id, "pending reconcile rate-limited");
            return Ok(());
        };

        let status = adapter.get_order_status(&order_id).await?;
        let changed = self
            .tms
            .on_broker_order_update(BrokerOrderUpdate::from_status(&status, now))
            .await
            .unwrap_or(false);

        if changed {
            self.metrics.total_updated.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Placed exit orders
// ---------------------------------------------------------------------------

pub struct ExitOrderReconciler {
    exit_intents: Arc<ExitIntentRepository>,
    registry: Arc<BrokerRegistry>,
    tms: Arc<TradeManagementService>,
    bus: Arc<EventBus>,
    semaphore: Arc<Semaphore>,
    metrics: ReconcilerMetrics,
    period: Duration,
    initial_delay: Duration,
    placed_timeout: Duration,
}

impl ExitOrderReconciler {
    pub fn new(
        exit_intents: Arc<ExitIntentRepository>,
        registry: Arc<BrokerRegistry>,
        tms: Arc<TradeManagementService>,
        bus: Arc<EventBus>,
        max_concurrent_broker_calls: usize,
        period: Duration,
        initial_delay: Duration,
        placed_timeout: Duration,
    ) -> Self {
        Self {
            exit_intents,
            registry,
            tms,
            bus,
            semaphore: Arc::new(Semaphore::new(max_concurrent_broker_calls)),
            metrics: ReconcilerMetrics::default(),
            period,
            initial_delay,
            placed_timeout,
        }
    }

    pub fn snapshot(&self) -> ReconcilerSnapshot {
        self.metrics.snapshot(self.semaphore.available_permits())
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            period_secs = self.period.as_secs(),
            timeout_secs = self.placed_timeout.as_secs(),
            "exit-order reconciler started"
        );
        tokio::time::sleep(self.initial_delay).await;
        let mut ticker = tokio::time::interval(self.period);
        loop {
            ticker.tick().await;
            self.run_cycle().await;
        }
    }

    /// One pass over every PLACED exit intent with a real broker order id.
    pub async fn run_cycle(&self) {
        let started = Instant::now();

        let rows = match self.exit_intents.find_placed_with_broker_order() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "exit reconcile: store read failed");
                self.metrics.finish_cycle(started);
                return;
            }
        };

        debug!(count = rows.len(), "exit reconcile cycle");
        for intent in rows {
            let id = intent.exit_intent_id.clone();
            if let Err(e) = self.reconcile_row(intent).await {
                warn!(exit_intent_id = %id, error = %e, "exit reconcile row failed");
            }
        }

        self.metrics.finish_cycle(started);
    }

    async fn reconcile_row(&self, intent: ExitIntent) -> Result<()> {
        self.metrics.total_checked.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis();

        let placed_at = intent.placed_at.unwrap_or(intent.created_at);
        if now - placed_at > self.placed_timeout.as_millis() as i64 {
            warn!(
                exit_intent_id = %intent.exit_intent_id,
                age_ms = now - placed_at,
                "PLACED exit intent timed out — failing"
            );
            self.metrics.total_timeouts.fetch_add(1, Ordering::Relaxed);
            self.exit_intents.mark_failed(
                &intent.exit_intent_id,
                ERR_TIMEOUT,
                "no broker update within placed timeout",
            )?;
            self.emit_failed(&intent, ERR_TIMEOUT, "no broker update within placed timeout");
            return Ok(());
        }

        let order_id = intent
            .broker_order_id
            .clone()
            .context("PLACED exit intent has no broker order id")?;
        let adapter = self
            .registry
            .resolve(&intent.user_broker_id)
            .with_context(|| format!("no adapter for {}", intent.user_broker_id))?;

        let Ok(_permit) = self.semaphore.try_acquire() else {
            self.metrics.total_rate_limited.fetch_add(1, Ordering::Relaxed);
            debug!(exit_intent_id = %intent.exit_intent_id, "exit reconcile rate-limited");
            return Ok(());
        };

        let status = adapter.get_order_status(&order_id).await?;

        match OrderStateClass::classify(&status.status) {
            OrderStateClass::Filled => {
                self.exit_intents.mark_filled(&intent.exit_intent_id)?;
                let _ = self
                    .tms
                    .close_trade_on_exit_fill(
                        &intent.trade_id,
                        status.average_price,
                        status.filled_quantity,
                        intent.exit_reason,
                        now,
                    )
                    .await;
                self.metrics.total_updated.fetch_add(1, Ordering::Relaxed);
                self.bus.emit_user_broker(
                    EventType::ExitIntentFilled,
                    self.scope(&intent),
                    json!({
                        "exitIntentId": intent.exit_intent_id,
                        "avgPrice": status.average_price,
                        "filledQty": status.filled_quantity,
                        "exitReason": intent.exit_reason.as_str(),
                    }),
                    SOURCE_RECONCILER,
                );
            }
            OrderStateClass::Rejected => {
                let message = status
                    .status_message
                    .unwrap_or_else(|| "exit order rejected by broker".into());
                self.exit_intents
                    .mark_failed(&intent.exit_intent_id, ERR_BROKER_REJECTED, &message)?;
                self.metrics.total_updated.fetch_add(1, Ordering::Relaxed);
                self.emit_failed(&intent, ERR_BROKER_REJECTED, &message);
            }
            OrderStateClass::Cancelled => {
                self.exit_intents.mark_cancelled(&intent.exit_intent_id)?;
                self.metrics.total_updated.fetch_add(1, Ordering::Relaxed);
                info!(exit_intent_id = %intent.exit_intent_id, "exit order cancelled at broker");
            }
            OrderStateClass::Working => {
                debug!(exit_intent_id = %intent.exit_intent_id, status = %status.status, "exit order still working");
            }
            OrderStateClass::Unknown => {
                warn!(
                    exit_intent_id = %intent.exit_intent_id,
                    status = %status.status,
                    "unknown exit order status — row left for next cycle"
                );
            }
        }

        Ok(())
    }

    fn emit_failed(&self, intent: &ExitIntent, code: &str, message: &str) {
        self.bus.emit_user_broker(
            EventType::ExitIntentFailed,
            self.scope(intent),
            json!({
                "exitIntentId": intent.exit_intent_id,
                "exitReason": intent.exit_reason.as_str(),
                "errorCode": code,
                "errorMessage": message,
            }),
            SOURCE_RECONCILER,
        );
    }

    fn scope(&self, intent: &ExitIntent) -> EventScope {
        EventScope {
            user_broker_id: Some(intent.user_broker_id.clone()),
            trade_id: Some(intent.trade_id.clone()),
            broker_order_id: intent.broker_order_id.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testutil::MockBroker;
    use crate::broker::{BrokerAdapter, BrokerOrderStatus, OrderResult};
    use crate::coordinator::Coordinator;
    use crate::events::EventBus;
    use crate::store::Database;
    use crate::trade::active_index::ActiveTradeIndex;
    use crate::trade::testutil::{sample_intent, sample_signal};
    use crate::trade::{exit_order_placeholder, Trade};
    use crate::types::{ExitIntentStatus, ExitReason};

    struct Fixture {
        trades: Arc<TradeRepository>,
        exit_intents: Arc<ExitIntentRepository>,
        registry: Arc<BrokerRegistry>,
        tms: Arc<TradeManagementService>,
        bus: Arc<EventBus>,
        broker: Arc<MockBroker>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let trades = Arc::new(TradeRepository::new(db.clone()));
        let exit_intents = Arc::new(ExitIntentRepository::new(db));
        let registry = Arc::new(BrokerRegistry::new());
        let broker = Arc::new(MockBroker::new());
        registry.register("UB1", broker.clone() as Arc<dyn BrokerAdapter>);

        let bus = Arc::new(EventBus::new());
        let tms = Arc::new(TradeManagementService::new(
            trades.clone(),
            exit_intents.clone(),
            registry.clone(),
            Arc::new(ActiveTradeIndex::new()),
            bus.clone(),
            Arc::new(Coordinator::with_partitions("trades", 2)),
            Arc::new(Coordinator::with_partitions("exits", 2)),
            30,
        ));

        Fixture {
            trades,
            exit_intents,
            registry,
            tms,
            bus,
            broker,
        }
    }

    fn pending_reconciler(f: &Fixture, permits: usize, timeout: Duration) -> PendingOrderReconciler {
        PendingOrderReconciler::new(
            f.trades.clone(),
            f.registry.clone(),
            f.tms.clone(),
            permits,
            Duration::from_secs(30),
            Duration::from_secs(0),
            timeout,
        )
    }

    fn exit_reconciler(f: &Fixture, timeout: Duration) -> ExitOrderReconciler {
        ExitOrderReconciler::new(
            f.exit_intents.clone(),
            f.registry.clone(),
            f.tms.clone(),
            f.bus.clone(),
            5,
            Duration::from_secs(30),
            Duration::from_secs(0),
            timeout,
        )
    }

    /// A PENDING trade whose last broker contact was `age` ago.
    fn insert_pending(f: &Fixture, intent_id: &str, age: Duration) -> Trade {
        let mut trade = Trade::for_intent(
            &sample_intent(intent_id, "ACME"),
            &sample_signal("ACME"),
            crate::trade::TradeClassification::NewBuy,
        );
        let now = Utc::now().timestamp_millis();
        let stamp = now - age.as_millis() as i64;
        trade.created_at = stamp;
        trade.updated_at = stamp;
        f.trades.insert(&trade).unwrap();

        trade.status = TradeStatus::Pending;
        trade.broker_order_id = Some(format!("O-{intent_id}"));
        trade.last_broker_update_at = Some(stamp);
        f.trades.update(&mut trade).unwrap();
        trade
    }

    #[tokio::test]
    async fn pending_timeout_rejects_without_broker_call() {
        let f = fixture();
        let trade = insert_pending(&f, "I1", Duration::from_secs(11 * 60));

        let reconciler = pending_reconciler(&f, 5, Duration::from_secs(600));
        reconciler.run_cycle().await;

        let row = f.trades.find_by_id(&trade.trade_id).unwrap().unwrap();
        assert_eq!(row.status, TradeStatus::Rejected);
        assert_eq!(row.error_code.as_deref(), Some(ERR_TIMEOUT));

        let snap = reconciler.snapshot();
        assert_eq!(snap.total_timeouts, 1);
        assert_eq!(snap.total_checked, 1);
        // The timeout check preceded (and replaced) the broker query.
        assert_eq!(f.broker.status_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pending_fill_transitions_to_open() {
        let f = fixture();
        let trade = insert_pending(&f, "I1", Duration::from_secs(60));
        f.broker.script_status(BrokerOrderStatus {
            order_id: "O-I1".into(),
            status: "COMPLETE".into(),
            average_price: 101.5,
            filled_quantity: 10,
            status_message: None,
            exchange_order_id: None,
        });

        let reconciler = pending_reconciler(&f, 5, Duration::from_secs(600));
        reconciler.run_cycle().await;

        let row = f.trades.find_by_id(&trade.trade_id).unwrap().unwrap();
        assert_eq!(row.status, TradeStatus::Open);
        assert_eq!(row.entry_price, Some(101.5));

        let snap = reconciler.snapshot();
        assert_eq!(snap.total_updated, 1);
        assert_eq!(snap.total_timeouts, 0);
        assert_eq!(snap.available_permits, 5);
    }

    #[tokio::test]
    async fn still_working_row_only_bumps_contact_time() {
        let f = fixture();
        let trade = insert_pending(&f, "I1", Duration::from_secs(60));
        let before = f
            .trades
            .find_by_id(&trade.trade_id)
            .unwrap()
            .unwrap()
            .last_broker_update_at
            .unwrap();
        f.broker.script_status(BrokerOrderStatus {
            order_id: "O-I1".into(),
            status: "OPEN".into(),
            average_price: 0.0,
            filled_quantity: 0,
            status_message: None,
            exchange_order_id: None,
        });

        let reconciler = pending_reconciler(&f, 5, Duration::from_secs(600));
        reconciler.run_cycle().await;

        let row = f.trades.find_by_id(&trade.trade_id).unwrap().unwrap();
        assert_eq!(row.status, TradeStatus::Pending);
        assert!(row.last_broker_update_at.unwrap() > before);
        assert_eq!(reconciler.snapshot().total_updated, 0);
    }

    #[tokio::test]
    async fn saturated_semaphore_skips_rows_as_rate_limited() {
        let f = fixture();
        insert_pending(&f, "I1", Duration::from_secs(60));
        insert_pending(&f, "I2", Duration::from_secs(60));

        let reconciler = pending_reconciler(&f, 0, Duration::from_secs(600));
        reconciler.run_cycle().await;

        let snap = reconciler.snapshot();
        assert_eq!(snap.total_rate_limited, 2);
        assert_eq!(f.broker.status_calls.load(Ordering::SeqCst), 0);
        // Rows remain PENDING for the next cycle.
        assert_eq!(
            f.trades.find_by_status(TradeStatus::Pending).unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn broker_error_on_one_row_does_not_abort_cycle() {
        let f = fixture();
        insert_pending(&f, "I1", Duration::from_secs(60)); // no scripted status → error
        let ok_trade = insert_pending(&f, "I2", Duration::from_secs(60));
        f.broker.script_status(BrokerOrderStatus {
            order_id: "O-I2".into(),
            status: "COMPLETE".into(),
            average_price: 100.0,
            filled_quantity: 10,
            status_message: None,
            exchange_order_id: None,
        });

        let reconciler = pending_reconciler(&f, 5, Duration::from_secs(600));
        reconciler.run_cycle().await;

        let row = f.trades.find_by_id(&ok_trade.trade_id).unwrap().unwrap();
        assert_eq!(row.status, TradeStatus::Open);
        assert_eq!(reconciler.snapshot().total_checked, 2);
    }

    /// A PLACED exit intent with a real broker order id for an EXITING trade.
    async fn placed_exit(f: &Fixture, order_id: &str) -> (Trade, ExitIntent) {
        f.broker.script_order_result(OrderResult::ok("O-entry"));
        let intent = sample_intent("I1", "ACME");
        let trade = f
            .tms
            .create_trade_for_intent(&intent, &sample_signal("ACME"))
            .unwrap();
        f.tms.place_entry_order(&trade.trade_id, intent).await.unwrap();
        f.tms
            .on_broker_order_update(BrokerOrderUpdate {
                order_id: "O-entry".into(),
                client_order_id: None,
                status: "COMPLETE".into(),
                average_price: 100.0,
                filled_quantity: 10,
                status_message: None,
                ts: 1,
            })
            .await
            .unwrap();

        let exit = ExitIntent::approved_for(
            &f.trades.find_by_id(&trade.trade_id).unwrap().unwrap(),
            ExitReason::TargetHit,
        );
        f.exit_intents.insert(&exit).unwrap();
        f.exit_intents
            .place_exit_order(&exit.exit_intent_id, &exit_order_placeholder(1), Utc::now().timestamp_millis())
            .unwrap();
        f.exit_intents
            .update_broker_order_id(&exit.exit_intent_id, order_id)
            .unwrap();
        f.tms
            .update_trade_exit_order_placed(&trade.trade_id, order_id, ExitReason::TargetHit, 2)
            .await
            .unwrap();

        let exit = f.exit_intents.find_by_id(&exit.exit_intent_id).unwrap().unwrap();
        (trade, exit)
    }

    #[tokio::test]
    async fn exit_fill_marks_filled_and_closes_trade() {
        let f = fixture();
        let (trade, exit) = placed_exit(&f, "O-exit").await;
        f.broker.script_status(BrokerOrderStatus {
            order_id: "O-exit".into(),
            status: "COMPLETE".into(),
            average_price: 120.5,
            filled_quantity: 10,
            status_message: None,
            exchange_order_id: None,
        });

        let reconciler = exit_reconciler(&f, Duration::from_secs(600));
        reconciler.run_cycle().await;

        let row = f.exit_intents.find_by_id(&exit.exit_intent_id).unwrap().unwrap();
        assert_eq!(row.status, ExitIntentStatus::Filled);

        let closed = f.trades.find_by_id(&trade.trade_id).unwrap().unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert!((closed.realized_pnl.unwrap() - 205.0).abs() < 1e-9);
        assert_eq!(reconciler.snapshot().total_updated, 1);
    }

    #[tokio::test]
    async fn exit_timeout_fails_the_intent() {
        let f = fixture();
        let (_trade, exit) = placed_exit(&f, "O-exit").await;

        // Zero timeout: the row is expired on the very next cycle.
        let reconciler = exit_reconciler(&f, Duration::from_secs(0));
        // A placed_at strictly in the past.
        tokio::time::sleep(Duration::from_millis(5)).await;
        reconciler.run_cycle().await;

        let row = f.exit_intents.find_by_id(&exit.exit_intent_id).unwrap().unwrap();
        assert_eq!(row.status, ExitIntentStatus::Failed);
        assert_eq!(row.error_code.as_deref(), Some(ERR_TIMEOUT));
        assert_eq!(reconciler.snapshot().total_timeouts, 1);
        assert_eq!(f.broker.status_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exit_cancel_marks_cancelled() {
        let f = fixture();
        let (_trade, exit) = placed_exit(&f, "O-exit").await;
        f.broker.script_status(BrokerOrderStatus {
            order_id: "O-exit".into(),
            status: "CANCELLED".into(),
            average_price: 0.0,
            filled_quantity: 0,
            status_message: None,
            exchange_order_id: None,
        });

        let reconciler = exit_reconciler(&f, Duration::from_secs(600));
        reconciler.run_cycle().await;

        let row = f.exit_intents.find_by_id(&exit.exit_intent_id).unwrap().unwrap();
        assert_eq!(row.status, ExitIntentStatus::Cancelled);
    }

    #[tokio::test]
    async fn placeholder_rows_are_not_reconciled() {
        let f = fixture();
        let (_trade, exit) = placed_exit(&f, "O-exit").await;
        // Regress the broker id to a placeholder (as if the overwrite never
        // landed) — the working-set query must skip it.
        f.exit_intents
            .update_broker_order_id(&exit.exit_intent_id, &exit_order_placeholder(99))
            .unwrap();

        let reconciler = exit_reconciler(&f, Duration::from_secs(600));
        reconciler.run_cycle().await;

        assert_eq!(reconciler.snapshot().total_checked, 0);
        assert_eq!(f.broker.status_calls.load(Ordering::SeqCst), 0);
    }
}
