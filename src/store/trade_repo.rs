// =============================================================================
// Trade repository — the durable home of Trade rows
// =============================================================================
//
// Writes come only from TradeManagementService. Every update is a CAS on
// `version`: the UPDATE carries `WHERE trade_id = ? AND version = ?` and
// bumps the version, so an external writer (there should be none) or a stale
// in-memory copy loses cleanly instead of clobbering.
//
// `client_order_id` (= intent id) is UNIQUE — inserting the same intent
// twice yields at most one row, which is the engine's entry idempotency.
// =============================================================================

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Row};

use super::Database;
use crate::trade::{MtfSnapshot, Trade, TradeClassification};
use crate::types::{Direction, ExitReason, OrderType, ProductType, TradeStatus};

const COLUMNS: &str = "trade_id, client_order_id, user_id, broker_id, user_broker_id, signal_id, \
     symbol, direction, status, classification, order_type, product_type, \
     entry_price, entry_qty, entry_value, entry_ts, \
     htf_low, htf_high, itf_low, itf_high, ltf_low, ltf_high, \
     exit_primary_price, effective_floor, \
     trailing_active, trailing_highest_price, trailing_stop_price, \
     exit_price, exit_ts, exit_trigger, exit_order_id, \
     realized_pnl, realized_log_return, holding_days, \
     broker_order_id, last_broker_update_at, error_code, error_message, \
     created_at, updated_at, deleted_at, version";

pub struct TradeRepository {
    db: Arc<Database>,
}

impl TradeRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new trade row. Returns `false` (no row written) when a trade
    /// with the same `client_order_id` already exists.
    pub fn insert(&self, trade: &Trade) -> Result<bool> {
        let conn = self.db.lock();
        let result = conn.execute(
            &format!(
                "INSERT INTO trades ({COLUMNS}) VALUES (\
                 ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
                 ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, \
                 ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34, ?35, ?36, ?37, ?38, \
                 ?39, ?40, ?41, ?42)"
            ),
            params![
                trade.trade_id,
                trade.client_order_id,
                trade.user_id,
                trade.broker_id,
                trade.user_broker_id,
                trade.signal_id,
                trade.symbol,
                trade.direction.as_str(),
                trade.status.as_str(),
                trade.classification.as_str(),
                trade.order_type.as_str(),
                trade.product_type.as_str(),
                trade.entry_price,
                trade.entry_qty as i64,
                trade.entry_value,
                trade.entry_ts,
                trade.mtf.htf_low,
                trade.mtf.htf_high,
                trade.mtf.itf_low,
                trade.mtf.itf_high,
                trade.mtf.ltf_low,
                trade.mtf.ltf_high,
                trade.exit_primary_price,
                trade.effective_floor,
                trade.trailing_active as i64,
                trade.trailing_highest_price,
                trade.trailing_stop_price,
                trade.exit_price,
                trade.exit_ts,
                trade.exit_trigger.map(|r| r.as_str()),
                trade.exit_order_id,
                trade.realized_pnl,
                trade.realized_log_return,
                trade.holding_days,
                trade.broker_order_id,
                trade.last_broker_update_at,
                trade.error_code,
                trade.error_message,
                trade.created_at,
                trade.updated_at,
                trade.deleted_at,
                trade.version,
            ],
        );

        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(e).context("trade insert failed"),
        }
    }

    /// CAS update on `version`. On success the in-memory copy's version and
    /// updated_at are advanced to match the row. Returns `false` when the
    /// row's version no longer matches (stale copy).
    pub fn update(&self, trade: &mut Trade) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let expected = trade.version;
        let conn = self.db.lock();
        let changed = conn
            .execute(
                "UPDATE trades SET \
                 status = ?1, entry_price = ?2, entry_qty = ?3, entry_value = ?4, entry_ts = ?5, \
                 exit_primary_price = ?6, effective_floor = ?7, \
                 trailing_active = ?8, trailing_highest_price = ?9, trailing_stop_price = ?10, \
                 exit_price = ?11, exit_ts = ?12, exit_trigger = ?13, exit_order_id = ?14, \
                 realized_pnl = ?15, realized_log_return = ?16, holding_days = ?17, \
                 broker_order_id = ?18, last_broker_update_at = ?19, \
                 error_code = ?20, error_message = ?21, \
                 updated_at = ?22, version = ?23 \
                 WHERE trade_id = ?24 AND version = ?25",
                params![
                    trade.status.as_str(),
                    trade.entry_price,
                    trade.entry_qty as i64,
                    trade.entry_value,
                    trade.entry_ts,
                    trade.exit_primary_price,
                    trade.effective_floor,
                    trade.trailing_active as i64,
                    trade.trailing_highest_price,
                    trade.trailing_stop_price,
                    trade.exit_price,
                    trade.exit_ts,
                    trade.exit_trigger.map(|r| r.as_str()),
                    trade.exit_order_id,
                    trade.realized_pnl,
                    trade.realized_log_return,
                    trade.holding_days,
                    trade.broker_order_id,
                    trade.last_broker_update_at,
                    trade.error_code,
                    trade.error_message,
                    now,
                    expected + 1,
                    trade.trade_id,
                    expected,
                ],
            )
            .context("trade update failed")?;

        if changed == 1 {
            trade.version = expected + 1;
            trade.updated_at = now;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn find_by_id(&self, trade_id: &str) -> Result<Option<Trade>> {
        self.find_one("trade_id = ?1", trade_id)
    }

    pub fn find_by_broker_order_id(&self, broker_order_id: &str) -> Result<Option<Trade>> {
        self.find_one("broker_order_id = ?1", broker_order_id)
    }

    pub fn find_by_intent_id(&self, intent_id: &str) -> Result<Option<Trade>> {
        self.find_one("client_order_id = ?1", intent_id)
    }

    pub fn find_by_status(&self, status: TradeStatus) -> Result<Vec<Trade>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM trades WHERE status = ?1 ORDER BY created_at ASC"
        ))?;
        let mut rows = stmt.query(params![status.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_trade(row)?);
        }
        Ok(out)
    }

    /// Count of live (non-terminal) trades for a (user, symbol) pair — the
    /// NEWBUY/REBUY classifier input.
    pub fn count_non_terminal(&self, user_id: &str, symbol: &str) -> Result<usize> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(*) FROM trades \
             WHERE user_id = ?1 AND symbol = ?2 \
             AND status NOT IN ('CLOSED', 'REJECTED', 'CANCELLED', 'ERROR')",
        )?;
        let count: i64 = stmt.query_row(params![user_id, symbol], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn find_one(&self, where_clause: &str, value: &str) -> Result<Option<Trade>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM trades WHERE {where_clause} LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![value])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_trade(row)?)),
            None => Ok(None),
        }
    }
}

fn row_to_trade(row: &Row<'_>) -> Result<Trade> {
    let direction: String = row.get(7)?;
    let status: String = row.get(8)?;
    let classification: String = row.get(9)?;
    let order_type: String = row.get(10)?;
    let product_type: String = row.get(11)?;
    let exit_trigger: Option<String> = row.get(29)?;

    Ok(Trade {
        trade_id: row.get(0)?,
        client_order_id: row.get(1)?,
        user_id: row.get(2)?,
        broker_id: row.get(3)?,
        user_broker_id: row.get(4)?,
        signal_id: row.get(5)?,
        symbol: row.get(6)?,
        direction: Direction::parse(&direction)
            .ok_or_else(|| anyhow!("unknown direction in store: {direction}"))?,
        status: TradeStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown trade status in store: {status}"))?,
        classification: TradeClassification::parse(&classification)
            .ok_or_else(|| anyhow!("unknown classification in store: {classification}"))?,
        order_type: OrderType::parse(&order_type)
            .ok_or_else(|| anyhow!("unknown order type in store: {order_type}"))?,
        product_type: ProductType::parse(&product_type)
            .ok_or_else(|| anyhow!("unknown product type in store: {product_type}"))?,
        entry_price: row.get(12)?,
        entry_qty: row.get::<_, i64>(13)? as u32,
        entry_value: row.get(14)?,
        entry_ts: row.get(15)?,
        mtf: MtfSnapshot {
            htf_low: row.get(16)?,
            htf_high: row.get(17)?,
            itf_low: row.get(18)?,
            itf_high: row.get(19)?,
            ltf_low: row.get(20)?,
            ltf_high: row.get(21)?,
        },
        exit_primary_price: row.get(22)?,
        effective_floor: row.get(23)?,
        trailing_active: row.get::<_, i64>(24)? != 0,
        trailing_highest_price: row.get(25)?,
        trailing_stop_price: row.get(26)?,
        exit_price: row.get(27)?,
        exit_ts: row.get(28)?,
        exit_trigger: match exit_trigger {
            Some(s) => Some(
                ExitReason::parse(&s).ok_or_else(|| anyhow!("unknown exit trigger in store: {s}"))?,
            ),
            None => None,
        },
        exit_order_id: row.get(30)?,
        realized_pnl: row.get(31)?,
        realized_log_return: row.get(32)?,
        holding_days: row.get(33)?,
        broker_order_id: row.get(34)?,
        last_broker_update_at: row.get(35)?,
        error_code: row.get(36)?,
        error_message: row.get(37)?,
        created_at: row.get(38)?,
        updated_at: row.get(39)?,
        deleted_at: row.get(40)?,
        version: row.get(41)?,
    })
}
