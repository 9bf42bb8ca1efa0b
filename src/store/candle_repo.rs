// =============================================================================
// Candle repository — durable OHLCV rows keyed by {symbol, timeframe, ts}
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;

use super::Database;
use crate::types::{Candle, Timeframe};

pub struct CandleRepository {
    db: Arc<Database>,
}

impl CandleRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or overwrite the candle at its {symbol, timeframe, ts} key.
    pub fn upsert(&self, candle: &Candle) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO candles (symbol, timeframe, ts, open, high, low, close, volume, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(symbol, timeframe, ts) DO UPDATE SET
                 open = excluded.open,
                 high = excluded.high,
                 low = excluded.low,
                 close = excluded.close,
                 volume = excluded.volume,
                 updated_at = excluded.updated_at",
            params![
                candle.symbol,
                candle.timeframe.as_str(),
                candle.ts,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume as i64,
                now,
            ],
        )
        .context("candle upsert failed")?;
        Ok(())
    }

    /// Upsert a batch inside one transaction. Returns the row count written.
    pub fn upsert_batch(&self, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().timestamp_millis();
        let mut conn = self.db.lock();
        let tx = conn.transaction().context("candle batch tx begin failed")?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO candles (symbol, timeframe, ts, open, high, low, close, volume, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(symbol, timeframe, ts) DO UPDATE SET
                     open = excluded.open,
                     high = excluded.high,
                     low = excluded.low,
                     close = excluded.close,
                     volume = excluded.volume,
                     updated_at = excluded.updated_at",
            )?;
            for c in candles {
                stmt.execute(params![
                    c.symbol,
                    c.timeframe.as_str(),
                    c.ts,
                    c.open,
                    c.high,
                    c.low,
                    c.close,
                    c.volume as i64,
                    now,
                ])?;
            }
        }
        tx.commit().context("candle batch tx commit failed")?;
        Ok(candles.len())
    }

    /// Most recent candle for the series, if any.
    pub fn find_latest(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Candle>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, timeframe, ts, open, high, low, close, volume
             FROM candles WHERE symbol = ?1 AND timeframe = ?2
             ORDER BY ts DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![symbol, timeframe.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_candle(row)?)),
            None => Ok(None),
        }
    }

    /// Candles with `from ≤ ts < to`, ascending by timestamp.
    pub fn find_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, timeframe, ts, open, high, low, close, volume
             FROM candles WHERE symbol = ?1 AND timeframe = ?2 AND ts >= ?3 AND ts < ?4
             ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![symbol, timeframe.as_str(), from, to], |row| {
            row_to_candle(row)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.context("candle row decode failed")?);
        }
        Ok(out)
    }

    /// Most recent `limit` candles, descending by timestamp.
    pub fn find_all(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, timeframe, ts, open, high, low, close, volume
             FROM candles WHERE symbol = ?1 AND timeframe = ?2
             ORDER BY ts DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![symbol, timeframe.as_str(), limit as i64],
            |row| row_to_candle(row),
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.context("candle row decode failed")?);
        }
        Ok(out)
    }

    pub fn exists(&self, symbol: &str, timeframe: Timeframe) -> Result<bool> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM candles WHERE symbol = ?1 AND timeframe = ?2 LIMIT 1",
        )?;
        let found = stmt.exists(params![symbol, timeframe.as_str()])?;
        Ok(found)
    }

    /// Retention cleanup: delete every candle strictly older than `cutoff`.
    pub fn delete_older_than(&self, cutoff: i64) -> Result<usize> {
        let conn = self.db.lock();
        let deleted = conn
            .execute("DELETE FROM candles WHERE ts < ?1", params![cutoff])
            .context("candle retention delete failed")?;
        Ok(deleted)
    }
}

fn row_to_candle(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candle> {
    let tf: String = row.get(1)?;
    Ok(Candle {
        symbol: row.get(0)?,
        timeframe: Timeframe::parse(&tf).unwrap_or(Timeframe::Ltf),
        ts: row.get(2)?,
        open: row.get(3)?,
        high: row.get(4)?,
        low: row.get(5)?,
        close: row.get(6)?,
        volume: row.get::<_, i64>(7)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> CandleRepository {
        CandleRepository::new(Arc::new(Database::open_in_memory().unwrap()))
    }

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
    fn upsert_overwrites_same_key() {
        let repo = repo();
        repo.upsert(&candle(60_000, 100.0)).unwrap();
        repo.upsert(&candle(60_000, 101.5)).unwrap();

        let latest = repo.find_latest("ACME", Timeframe::Ltf).unwrap().unwrap();
        assert_eq!(latest.ts, 60_000);
        assert!((latest.close - 101.5).abs() < f64::EPSILON);

        let all = repo.find_all("ACME", Timeframe::Ltf, 10).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn range_is_ascending_and_half_open() {
        let repo = repo();
        for i in 0..5 {
            repo.upsert(&candle(i * 60_000, 100.0 + i as f64)).unwrap();
        }

        let range = repo
            .find_range("ACME", Timeframe::Ltf, 60_000, 240_000)
            .unwrap();
        let ts: Vec<i64> = range.iter().map(|c| c.ts).collect();
        assert_eq!(ts, vec![60_000, 120_000, 180_000]);
    }

    #[test]
    fn find_all_is_descending_with_limit() {
        let repo = repo();
        for i in 0..5 {
            repo.upsert(&candle(i * 60_000, 100.0)).unwrap();
        }
        let all = repo.find_all("ACME", Timeframe::Ltf, 3).unwrap();
        let ts: Vec<i64> = all.iter().map(|c| c.ts).collect();
        assert_eq!(ts, vec![240_000, 180_000, 120_000]);
    }

    #[test]
    fn timeframes_are_disjoint_series() {
        let repo = repo();
        repo.upsert(&candle(0, 100.0)).unwrap();
        let mut itf = candle(0, 100.0);
        itf.timeframe = Timeframe::Itf;
        repo.upsert(&itf).unwrap();

        assert!(repo.exists("ACME", Timeframe::Ltf).unwrap());
        assert!(repo.exists("ACME", Timeframe::Itf).unwrap());
        assert!(!repo.exists("ACME", Timeframe::Htf).unwrap());
        assert_eq!(repo.find_all("ACME", Timeframe::Ltf, 10).unwrap().len(), 1);
    }

    #[test]
    fn retention_deletes_old_rows() {
        let repo = repo();
        for i in 0..5 {
            repo.upsert(&candle(i * 60_000, 100.0)).unwrap();
        }
        let deleted = repo.delete_older_than(120_000).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(repo.find_all("ACME", Timeframe::Ltf, 10).unwrap().len(), 3);
    }

    #[test]
    fn batch_upsert_writes_all_rows() {
        let repo = repo();
        let batch: Vec<Candle> = (0..10).map(|i| candle(i * 60_000, 100.0)).collect();
        assert_eq!(repo.upsert_batch(&batch).unwrap(), 10);
        assert_eq!(repo.find_all("ACME", Timeframe::Ltf, 20).unwrap().len(), 10);
    }
}
