use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::candle::{Candle, SeriesBySymbol};
use crate::timeframe::Timeframe;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store connection lock poisoned")]
    LockPoisoned,
}

pub trait CandleReader: Send + Sync + 'static {
    fn latest_candles_per_symbol(
        &self,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<SeriesBySymbol, StoreError>;
}

pub struct SqliteCandleStore {
    conn: Mutex<Connection>,
}

const WRITER_PRAGMAS: &str = "
    PRAGMA busy_timeout = 10000;
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA cache_size = -65536;
    PRAGMA temp_store = MEMORY;
    PRAGMA mmap_size = 268435456;
";

const READER_PRAGMAS: &str = "
    PRAGMA busy_timeout = 10000;
    PRAGMA cache_size = -65536;
    PRAGMA temp_store = MEMORY;
    PRAGMA mmap_size = 268435456;
    PRAGMA query_only = ON;
";

impl SqliteCandleStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(WRITER_PRAGMAS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_reader(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(READER_PRAGMAS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn ensure_schema(&self, timeframes: &[Timeframe]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        for tf in timeframes {
            let table = tf.table_name();
            conn.execute_batch(&format!(
                "
                CREATE TABLE IF NOT EXISTS {table} (
                    symbol TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    open REAL NOT NULL,
                    high REAL NOT NULL,
                    low REAL NOT NULL,
                    close REAL NOT NULL,
                    volume REAL NOT NULL,
                    turnover REAL NOT NULL,
                    PRIMARY KEY(symbol, timestamp)
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_timestamp ON {table}(timestamp);
                "
            ))?;
        }
        Ok(())
    }

    /// Inserts or overwrites rows keyed on `(symbol, timestamp)` in one
    /// transaction. Returns the number of rows written.
    pub fn upsert(&self, timeframe: Timeframe, rows: &SeriesBySymbol) -> Result<usize, StoreError> {
        if rows.values().all(|series| series.is_empty()) {
            return Ok(0);
        }

        let table = timeframe.table_name();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare(&format!(
                "
                INSERT INTO {table} (symbol, timestamp, open, high, low, close, volume, turnover)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(symbol, timestamp) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    turnover = excluded.turnover
                "
            ))?;

            for (symbol, series) in rows {
                for candle in series {
                    stmt.execute(params![
                        symbol,
                        candle.timestamp_ms,
                        candle.open,
                        candle.high,
                        candle.low,
                        candle.close,
                        candle.volume,
                        candle.turnover,
                    ])?;
                    written += 1;
                }
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn trim_to_limit(&self, timeframe: Timeframe, limit: usize) -> Result<usize, StoreError> {
        let table = timeframe.table_name();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            &format!(
                "
                DELETE FROM {table}
                WHERE rowid IN (
                    SELECT rowid FROM (
                        SELECT rowid,
                               ROW_NUMBER() OVER (PARTITION BY symbol ORDER BY timestamp DESC) AS rn
                        FROM {table}
                    )
                    WHERE rn > ?1
                )
                "
            ),
            params![limit as i64],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    pub fn has_any_rows(&self, timeframe: Timeframe) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let table = timeframe.table_name();
        if !table_exists(&conn, table)? {
            return Ok(false);
        }
        let found = conn
            .query_row(&format!("SELECT 1 FROM {table} LIMIT 1"), [], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    pub fn latest_timestamps(
        &self,
        timeframe: Timeframe,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<i64>, StoreError> {
        let conn = self.lock()?;
        let table = timeframe.table_name();
        if !table_exists(&conn, table)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT timestamp FROM {table} WHERE symbol = ?1 ORDER BY timestamp DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![symbol, limit as i64], |row| row.get::<_, i64>(0))?;
        let mut out = Vec::with_capacity(limit);
        for ts in rows {
            out.push(ts?);
        }
        Ok(out)
    }

    pub fn latest_timestamps_per_symbol(
        &self,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<HashMap<String, Vec<i64>>, StoreError> {
        let conn = self.lock()?;
        let table = timeframe.table_name();
        let mut out: HashMap<String, Vec<i64>> = HashMap::new();
        if !table_exists(&conn, table)? {
            return Ok(out);
        }
        let mut stmt = conn.prepare(&format!(
            "
            SELECT symbol, timestamp FROM (
                SELECT symbol, timestamp,
                       ROW_NUMBER() OVER (PARTITION BY symbol ORDER BY timestamp DESC) AS rn
                FROM {table}
            )
            WHERE rn <= ?1
            ORDER BY symbol ASC, timestamp DESC
            "
        ))?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (symbol, ts) = row?;
            out.entry(symbol).or_default().push(ts);
        }
        Ok(out)
    }

    pub fn count_rows(&self, timeframe: Timeframe, symbol: &str) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let table = timeframe.table_name();
        if !table_exists(&conn, table)? {
            return Ok(0);
        }
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE symbol = ?1"),
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl CandleReader for SqliteCandleStore {
    fn latest_candles_per_symbol(
        &self,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<SeriesBySymbol, StoreError> {
        let conn = self.lock()?;
        let table = timeframe.table_name();
        let mut out = SeriesBySymbol::new();
        if !table_exists(&conn, table)? {
            return Ok(out);
        }
        let mut stmt = conn.prepare(&format!(
            "
            SELECT symbol, timestamp, open, high, low, close, volume, turnover FROM (
                SELECT *,
                       ROW_NUMBER() OVER (PARTITION BY symbol ORDER BY timestamp DESC) AS rn
                FROM {table}
            )
            WHERE rn <= ?1
            ORDER BY symbol ASC, timestamp DESC
            "
        ))?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                Candle {
                    timestamp_ms: row.get(1)?,
                    open: row.get(2)?,
                    high: row.get(3)?,
                    low: row.get(4)?,
                    close: row.get(5)?,
                    volume: row.get(6)?,
                    turnover: row.get(7)?,
                },
            ))
        })?;
        for row in rows {
            let (symbol, candle) = row?;
            out.entry(symbol).or_default().push(candle);
        }
        Ok(out)
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}
