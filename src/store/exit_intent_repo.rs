// =============================================================================
// ExitIntent repository — APPROVED→PLACED is a WHERE-clause CAS
// =============================================================================
//
// Double-placement of an exit order is prevented here, not with a lock: the
// APPROVED→PLACED transition only succeeds when the row is still APPROVED,
// so of any number of concurrent callers exactly one wins and places the
// broker order.
// =============================================================================

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Row};

use super::Database;
use crate::trade::ExitIntent;
use crate::types::{ExitIntentStatus, ExitReason, OrderType, ProductType};

const COLUMNS: &str = "exit_intent_id, trade_id, user_broker_id, exit_reason, order_type, \
     product_type, calculated_qty, limit_price, status, broker_order_id, placed_at, \
     error_code, error_message, created_at, updated_at, version";

pub struct ExitIntentRepository {
    db: Arc<Database>,
}

impl ExitIntentRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn insert(&self, intent: &ExitIntent) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            &format!(
                "INSERT INTO exit_intents ({COLUMNS}) VALUES (\
                 ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                intent.exit_intent_id,
                intent.trade_id,
                intent.user_broker_id,
                intent.exit_reason.as_str(),
                intent.order_type.as_str(),
                intent.product_type.as_str(),
                intent.calculated_qty as i64,
                intent.limit_price,
                intent.status.as_str(),
                intent.broker_order_id,
                intent.placed_at,
                intent.error_code,
                intent.error_message,
                intent.created_at,
                intent.updated_at,
                intent.version,
            ],
        )
        .context("exit intent insert failed")?;
        Ok(())
    }

    /// The APPROVED→PLACED CAS. Writes the placeholder broker order id and
    /// `placed_at`; succeeds iff the row is still APPROVED. Exactly one of
    /// any set of concurrent callers gets `true`.
    pub fn place_exit_order(
        &self,
        exit_intent_id: &str,
        placeholder_order_id: &str,
        placed_at: i64,
    ) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let conn = self.db.lock();
        let changed = conn
            .execute(
                "UPDATE exit_intents SET \
                 status = 'PLACED', broker_order_id = ?1, placed_at = ?2, \
                 updated_at = ?3, version = version + 1 \
                 WHERE exit_intent_id = ?4 AND status = 'APPROVED'",
                params![placeholder_order_id, placed_at, now, exit_intent_id],
            )
            .context("exit intent place CAS failed")?;
        Ok(changed == 1)
    }

    /// Overwrite the placeholder with the broker-assigned order id.
    pub fn update_broker_order_id(&self, exit_intent_id: &str, broker_order_id: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.db.lock();
        conn.execute(
            "UPDATE exit_intents SET broker_order_id = ?1, updated_at = ?2, \
             version = version + 1 WHERE exit_intent_id = ?3",
            params![broker_order_id, now, exit_intent_id],
        )
        .context("exit intent broker id update failed")?;
        Ok(())
    }

    pub fn mark_filled(&self, exit_intent_id: &str) -> Result<()> {
        self.set_status(exit_intent_id, ExitIntentStatus::Filled, None, None)
    }

    pub fn mark_failed(&self, exit_intent_id: &str, code: &str, message: &str) -> Result<()> {
        self.set_status(
            exit_intent_id,
            ExitIntentStatus::Failed,
            Some(code),
            Some(message),
        )
    }

    pub fn mark_cancelled(&self, exit_intent_id: &str) -> Result<()> {
        self.set_status(exit_intent_id, ExitIntentStatus::Cancelled, None, None)
    }

    pub fn find_by_id(&self, exit_intent_id: &str) -> Result<Option<ExitIntent>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM exit_intents WHERE exit_intent_id = ?1 LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![exit_intent_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_intent(row)?)),
            None => Ok(None),
        }
    }

    pub fn find_by_status(&self, status: ExitIntentStatus) -> Result<Vec<ExitIntent>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM exit_intents WHERE status = ?1 ORDER BY created_at ASC"
        ))?;
        let mut rows = stmt.query(params![status.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_intent(row)?);
        }
        Ok(out)
    }

    /// PLACED rows whose broker order id is real (not the `PENDING_` pre-
    /// placement placeholder) — the exit reconciler's working set.
    pub fn find_placed_with_broker_order(&self) -> Result<Vec<ExitIntent>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM exit_intents \
             WHERE status = 'PLACED' AND broker_order_id IS NOT NULL \
             AND instr(broker_order_id, 'PENDING_') != 1 \
             ORDER BY placed_at ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_intent(row)?);
        }
        Ok(out)
    }

    fn set_status(
        &self,
        exit_intent_id: &str,
        status: ExitIntentStatus,
        code: Option<&str>,
        message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.db.lock();
        conn.execute(
            "UPDATE exit_intents SET status = ?1, error_code = ?2, error_message = ?3, \
             updated_at = ?4, version = version + 1 WHERE exit_intent_id = ?5",
            params![status.as_str(), code, message, now, exit_intent_id],
        )
        .with_context(|| format!("exit intent status update to {status} failed"))?;
        Ok(())
    }
}

fn row_to_intent(row: &Row<'_>) -> Result<ExitIntent> {
    let reason: String = row.get(3)?;
    let order_type: String = row.get(4)?;
    let product_type: String = row.get(5)?;
    let status: String = row.get(8)?;

    Ok(ExitIntent {
        exit_intent_id: row.get(0)?,
        trade_id: row.get(1)?,
        user_broker_id: row.get(2)?,
        exit_reason: ExitReason::parse(&reason)
            .ok_or_else(|| anyhow!("unknown exit reason in store: {reason}"))?,
        order_type: OrderType::parse(&order_type)
            .ok_or_else(|| anyhow!("unknown order type in store: {order_type}"))?,
        product_type: ProductType::parse(&product_type)
            .ok_or_else(|| anyhow!("unknown product type in store: {product_type}"))?,
        calculated_qty: row.get::<_, i64>(6)? as u32,
        limit_price: row.get(7)?,
        status: ExitIntentStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown exit intent status in store: {status}"))?,
        broker_order_id: row.get(9)?,
        placed_at: row.get(10)?,
        error_code: row.get(11)?,
        error_message: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        version: row.get(15)?,
    })
}
