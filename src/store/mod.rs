// =============================================================================
// Durable store — SQLite database handle and schema bootstrap
// =============================================================================
//
// One connection behind a mutex, shared by the repositories via
// `Arc<Database>`. WAL mode keeps readers off the writer's back; all row
// timestamps are epoch milliseconds.
// =============================================================================

pub mod candle_repo;
pub mod exit_intent_repo;
pub mod trade_repo;

pub use candle_repo::CandleRepository;
pub use exit_intent_repo::ExitIntentRepository;
pub use trade_repo::TradeRepository;

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use tracing::info;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS candles (
    symbol      TEXT    NOT NULL,
    timeframe   TEXT    NOT NULL,
    ts          INTEGER NOT NULL,
    open        REAL    NOT NULL,
    high        REAL    NOT NULL,
    low         REAL    NOT NULL,
    close       REAL    NOT NULL,
    volume      INTEGER NOT NULL,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (symbol, timeframe, ts)
);

CREATE TABLE IF NOT EXISTS trades (
    trade_id               TEXT PRIMARY KEY,
    client_order_id        TEXT NOT NULL UNIQUE,
    user_id                TEXT NOT NULL,
    broker_id              TEXT NOT NULL,
    user_broker_id         TEXT NOT NULL,
    signal_id              TEXT,
    symbol                 TEXT NOT NULL,
    direction              TEXT NOT NULL,
    status                 TEXT NOT NULL,
    classification         TEXT NOT NULL,
    order_type             TEXT NOT NULL,
    product_type           TEXT NOT NULL,
    entry_price            REAL,
    entry_qty              INTEGER NOT NULL,
    entry_value            REAL,
    entry_ts               INTEGER,
    htf_low                REAL,
    htf_high               REAL,
    itf_low                REAL,
    itf_high               REAL,
    ltf_low                REAL,
    ltf_high               REAL,
    exit_primary_price     REAL,
    effective_floor        REAL,
    trailing_active        INTEGER NOT NULL DEFAULT 0,
    trailing_highest_price REAL,
    trailing_stop_price    REAL,
    exit_price             REAL,
    exit_ts                INTEGER,
    exit_trigger           TEXT,
    exit_order_id          TEXT,
    realized_pnl           REAL,
    realized_log_return    REAL,
    holding_days           REAL,
    broker_order_id        TEXT,
    last_broker_update_at  INTEGER,
    error_code             TEXT,
    error_message          TEXT,
    created_at             INTEGER NOT NULL,
    updated_at             INTEGER NOT NULL,
    deleted_at             INTEGER,
    version                INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
CREATE INDEX IF NOT EXISTS idx_trades_broker_order ON trades(broker_order_id);
CREATE INDEX IF NOT EXISTS idx_trades_user_symbol ON trades(user_id, symbol);

CREATE TABLE IF NOT EXISTS exit_intents (
    exit_intent_id  TEXT PRIMARY KEY,
    trade_id        TEXT NOT NULL,
    user_broker_id  TEXT NOT NULL,
    exit_reason     TEXT NOT NULL,
    order_type      TEXT NOT NULL,
    product_type    TEXT NOT NULL,
    calculated_qty  INTEGER NOT NULL,
    limit_price     REAL,
    status          TEXT NOT NULL,
    broker_order_id TEXT,
    placed_at       INTEGER,
    error_code      TEXT,
    error_message   TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    version         INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_exit_intents_status ON exit_intents(status);
CREATE INDEX IF NOT EXISTS idx_exit_intents_trade ON exit_intents(trade_id);
"#;

/// Shared SQLite handle. Repositories clone the `Arc<Database>` and take the
/// connection lock for the duration of a statement or transaction.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        conn.execute_batch(SCHEMA)
            .context("failed to apply database schema")?;

        info!(path = %path.display(), "database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA)
            .context("failed to apply database schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::testutil::{sample_intent, sample_signal};
    use crate::trade::{Trade, TradeClassification};
    use crate::types::{Candle, Timeframe, TradeStatus};
    use std::sync::Arc;

    fn candle(ts: i64, close: f64) -> Candle {
        Candle {
            symbol: "ACME".into(),
            timeframe: Timeframe::Ltf,
            ts,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100,
        }
    }

    #[test]
    fn on_disk_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        // A nested path also exercises the parent-directory bootstrap.
        let path = dir.path().join("data").join("meridian.db");

        {
            let db = Arc::new(Database::open(&path).unwrap());
            CandleRepository::new(db.clone())
                .upsert(&candle(60_000, 100.5))
                .unwrap();

            let mut trade = Trade::for_intent(
                &sample_intent("I1", "ACME"),
                &sample_signal("ACME"),
                TradeClassification::NewBuy,
            );
            let trades = TradeRepository::new(db);
            trades.insert(&trade).unwrap();
            trade.status = TradeStatus::Pending;
            trade.broker_order_id = Some("O1".into());
            trades.update(&mut trade).unwrap();
        }

        // A fresh process sees everything the first one wrote.
        let db = Arc::new(Database::open(&path).unwrap());
        let latest = CandleRepository::new(db.clone())
            .find_latest("ACME", Timeframe::Ltf)
            .unwrap()
            .unwrap();
        assert_eq!(latest.ts, 60_000);
        assert!((latest.close - 100.5).abs() < f64::EPSILON);

        let trade = TradeRepository::new(db)
            .find_by_intent_id("I1")
            .unwrap()
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.version, 2);
    }

    #[test]
    fn on_disk_database_runs_in_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("wal.db")).unwrap();

        let mode: String = db
            .lock()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_ascii_lowercase(), "wal");
    }

    #[test]
    fn reopen_is_idempotent_on_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twice.db");
        drop(Database::open(&path).unwrap());
        // CREATE IF NOT EXISTS makes the second bootstrap a no-op.
        assert!(Database::open(&path).is_ok());
    }
}
