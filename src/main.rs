// =============================================================================
// Meridian Equities Engine — Main Entry Point
// =============================================================================
//
// Entry-order placement starts DISABLED: TRADING_ENABLED=true must be set
// explicitly. The market-data pipeline, recovery and the reconcilers run
// regardless, so a read-only deployment still tracks broker truth.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod broker;
mod config;
mod coordinator;
mod events;
mod intake;
mod market_data;
mod recovery;
mod session;
mod store;
mod trade;
mod types;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::kite::{register_direct, KiteBroker};
use crate::broker::relay::RelayBroker;
use crate::broker::{BrokerAdapter, BrokerCredentials, BrokerRegistry, BrokerRole};
use crate::config::{DataFeedMode, EngineConfig};
use crate::coordinator::Coordinator;
use crate::events::EventBus;
use crate::intake::IntentIntake;
use crate::market_data::{
    CandleAggregator, CandleStore, HistoryBackfiller, MarketDataCache, TickCandleBuilder,
};
use crate::recovery::RecoveryManager;
use crate::store::{CandleRepository, Database, ExitIntentRepository, TradeRepository};
use crate::trade::active_index::ActiveTradeIndex;
use crate::trade::entry::EntryOrderExecution;
use crate::trade::exit::ExitOrderExecution;
use crate::trade::manager::TradeManagementService;
use crate::trade::reconciler::{ExitOrderReconciler, PendingOrderReconciler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian Equities Engine starting up");

    let mut config = EngineConfig::load("engine_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env_overrides();

    info!(
        symbols = ?config.symbols,
        feed_mode = %config.data_feed_mode,
        trading_enabled = config.trading_enabled,
        "Engine configuration resolved"
    );
    if !config.trading_enabled {
        warn!("TRADING_ENABLED is false — entry orders will be refused");
    }

    // ── 2. Durable store & repositories ──────────────────────────────────
    let db = Arc::new(Database::open(&config.db_path)?);
    let trade_repo = Arc::new(TradeRepository::new(db.clone()));
    let exit_intent_repo = Arc::new(ExitIntentRepository::new(db.clone()));
    let candle_repo = Arc::new(CandleRepository::new(db));

    // ── 3. Shared infrastructure ─────────────────────────────────────────
    let bus = Arc::new(EventBus::new());
    let market_cache = Arc::new(MarketDataCache::new());
    let index = Arc::new(ActiveTradeIndex::new());
    let registry = Arc::new(BrokerRegistry::new());

    let candle_store = Arc::new(CandleStore::new(candle_repo));
    let aggregator = Arc::new(CandleAggregator::new(candle_store.clone(), bus.clone()));
    let backfiller = Arc::new(HistoryBackfiller::new(
        candle_store.clone(),
        registry.clone(),
    ));

    // ── 4. Broker backends ───────────────────────────────────────────────
    let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
    let stale_after = Duration::from_secs(config.stale_feed_secs);

    let api_key = std::env::var("KITE_API_KEY").unwrap_or_default();
    let access_token = std::env::var("KITE_ACCESS_TOKEN").unwrap_or_default();
    let user_broker_id =
        std::env::var("MERIDIAN_USER_BROKER_ID").unwrap_or_else(|_| "primary".into());

    let kite = Arc::new(KiteBroker::new(
        api_key.clone(),
        access_token.clone(),
        BrokerRole::Exec,
        tick_tx.clone(),
        None,
        config.broker_ws_url.clone(),
        stale_after,
    ));

    match config.data_feed_mode {
        DataFeedMode::Direct => {
            register_direct(&registry, &user_broker_id, kite.clone());
        }
        DataFeedMode::Relay => {
            let relay_url = config
                .relay_url
                .clone()
                .unwrap_or_else(|| "ws://127.0.0.1:8765/feed".into());
            let relay = Arc::new(RelayBroker::new(relay_url, tick_tx.clone(), stale_after));
            relay.start();
            registry.register(&user_broker_id, kite.clone());
            registry.set_data_broker(relay.clone());

            if let Err(e) = relay.subscribe_ticks(&config.symbols).await {
                warn!(error = %e, "relay subscription failed");
            }
        }
    }

    let credentials = BrokerCredentials {
        api_key,
        access_token,
    };
    let connection = kite.connect(&credentials).await;
    if connection.success {
        info!("broker session validated");
        kite.start_ticker();
        if config.data_feed_mode == DataFeedMode::Direct {
            if let Err(e) = kite.subscribe_ticks(&config.symbols).await {
                warn!(error = %e, "tick subscription failed");
            }
        }
    } else {
        warn!(
            code = ?connection.error_code,
            message = %connection.message,
            "broker connect failed — continuing in recovery-only mode"
        );
    }

    // ── 5. Coordinators ──────────────────────────────────────────────────
    let trade_coordinator = Arc::new(Coordinator::new("trade"));
    let entry_coordinator = Arc::new(Coordinator::new("entry-signal"));
    let exit_coordinator = Arc::new(Coordinator::new("exit-signal"));
    info!(
        partitions = trade_coordinator.partitions(),
        "coordinators started"
    );

    // ── 6. Trade services ────────────────────────────────────────────────
    let tms = Arc::new(TradeManagementService::new(
        trade_repo.clone(),
        exit_intent_repo.clone(),
        registry.clone(),
        index,
        bus.clone(),
        trade_coordinator.clone(),
        exit_coordinator.clone(),
        config.max_holding_days,
    ));

    let exit_execution = Arc::new(ExitOrderExecution::new(
        exit_intent_repo.clone(),
        trade_repo.clone(),
        registry.clone(),
        bus.clone(),
        tms.clone(),
    ));
    tms.set_exit_execution(exit_execution);

    let entry_execution = Arc::new(EntryOrderExecution::new(
        tms.clone(),
        registry.clone(),
        bus.clone(),
        entry_coordinator.clone(),
        config.trading_enabled,
    ));

    // The strategy layer delivers approved intents over this local socket,
    // one JSON envelope per line.
    let intent_intake = Arc::new(IntentIntake::new(
        entry_execution,
        config.intake_bind_addr.clone(),
    ));
    tokio::spawn(async move {
        if let Err(e) = intent_intake.run().await {
            error!(error = %e, "intent intake failed");
        }
    });

    // ── 7. Tick pipeline ─────────────────────────────────────────────────
    let tick_builder = Arc::new(TickCandleBuilder::new(
        candle_store.clone(),
        aggregator.clone(),
        backfiller.clone(),
        bus.clone(),
        market_cache.clone(),
        Duration::from_secs(config.dedup_rotate_secs),
    ));

    tokio::spawn(
        tick_builder
            .clone()
            .run_finalizer(Duration::from_secs(config.finalizer_period_secs)),
    );

    {
        let builder = tick_builder.clone();
        let tms = tms.clone();
        tokio::spawn(async move {
            while let Some(tick) = tick_rx.recv().await {
                builder.on_tick(&tick);
                tms.on_price_update(&tick.symbol, tick.last_price, tick.received_at);
            }
            warn!("tick channel closed — price pipeline stopped");
        });
    }

    // ── 8. Startup recovery ──────────────────────────────────────────────
    let recovery = Arc::new(RecoveryManager::new(
        candle_store,
        backfiller,
        aggregator,
        tms.clone(),
    ));
    recovery.run_startup(&config.symbols, Utc::now()).await;

    // In-session gap watchdog: heals holes after silent reconnects.
    {
        let recovery = recovery.clone();
        let symbols = config.symbols.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(120));
            loop {
                interval.tick().await;
                let now = Utc::now();
                if !session::is_within_session(now) {
                    continue;
                }
                for symbol in &symbols {
                    recovery.on_reconnect(symbol, now).await;
                }
            }
        });
    }

    // ── 9. Reconcilers ───────────────────────────────────────────────────
    let pending_reconciler = Arc::new(PendingOrderReconciler::new(
        trade_repo,
        registry.clone(),
        tms.clone(),
        config.max_concurrent_broker_calls,
        Duration::from_secs(config.pending_reconcile_period_secs),
        Duration::from_secs(config.pending_reconcile_initial_delay_secs),
        Duration::from_secs(config.pending_timeout_secs),
    ));
    tokio::spawn(pending_reconciler.clone().run());

    let exit_reconciler = Arc::new(ExitOrderReconciler::new(
        exit_intent_repo,
        registry,
        tms,
        bus,
        config.max_concurrent_broker_calls,
        Duration::from_secs(config.exit_reconcile_period_secs),
        Duration::from_secs(config.exit_reconcile_initial_delay_secs),
        Duration::from_secs(config.placed_timeout_secs),
    ));
    tokio::spawn(exit_reconciler.clone().run());

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    trade_coordinator.shutdown().await;
    entry_coordinator.shutdown().await;
    exit_coordinator.shutdown().await;
    kite.disconnect().await;

    info!(ticks = ?tick_builder.snapshot(), "tick pipeline final counters");
    info!(
        pending = ?pending_reconciler.snapshot(),
        exits = ?exit_reconciler.snapshot(),
        "reconciler final counters"
    );

    info!("Meridian Equities Engine shut down complete.");
    Ok(())
}
