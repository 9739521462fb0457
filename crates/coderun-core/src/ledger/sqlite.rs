//! SQLite-backed ledger
//!
//! Schema is created on open. Timestamps are stored as Unix milliseconds,
//! results as JSON text. Every call runs on tokio's blocking pool.
//!
//! A file-backed ledger runs in WAL mode with two connections: appends go
//! through the writer, and `list_recent`, `stats_since` and `ping` through a
//! read-only connection, so polled reads never wait for an append. An
//! in-memory database cannot be opened twice and uses one connection for
//! both.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};

use crate::error::LedgerError;
use crate::fingerprint::Fingerprint;
use crate::stats::StatsSnapshot;

use super::{ExecutionLedger, ExecutionRecord, NewExecution};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS code_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL,
    code_hash TEXT NOT NULL,
    result TEXT,
    execution_time INTEGER NOT NULL,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    CHECK ((result IS NULL) <> (error IS NULL))
);
CREATE INDEX IF NOT EXISTS idx_code_executions_code_hash ON code_executions(code_hash);
CREATE INDEX IF NOT EXISTS idx_code_executions_created_at ON code_executions(created_at);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct SqliteLedger {
    // Dropped before the writer, so the writer closes last and checkpoints the WAL
    reader: Arc<Mutex<Connection>>,
    writer: Arc<Mutex<Connection>>,
}

/// Row as stored, before decoding fingerprint, JSON and timestamps
struct RawRow {
    id: i64,
    code: String,
    code_hash: String,
    result: Option<String>,
    execution_time: i64,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl SqliteLedger {
    /// Open (or create) the ledger database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let unavailable = |e: rusqlite::Error| {
            LedgerError::Unavailable(format!("open sqlite ledger {}: {}", path.display(), e))
        };
        let writer = Connection::open(path).map_err(unavailable)?;
        prepare(&writer)?;
        writer
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))
            .map_err(storage("enable WAL"))?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(unavailable)?;
        reader
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(storage("set busy timeout"))?;

        Ok(Self {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LedgerError::Unavailable(format!("open in-memory sqlite: {}", e)))?;
        prepare(&conn)?;
        let conn = Arc::new(Mutex::new(conn));
        Ok(Self {
            reader: Arc::clone(&conn),
            writer: conn,
        })
    }

    async fn write<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, LedgerError> + Send + 'static,
    {
        run_blocking(Arc::clone(&self.writer), f).await
    }

    async fn read<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, LedgerError> + Send + 'static,
    {
        run_blocking(Arc::clone(&self.reader), f).await
    }
}

fn prepare(conn: &Connection) -> Result<(), LedgerError> {
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(storage("set busy timeout"))?;
    conn.execute_batch(SCHEMA).map_err(storage("create schema"))
}

/// Run `f` against `conn` on the blocking pool
async fn run_blocking<T, F>(conn: Arc<Mutex<Connection>>, f: F) -> Result<T, LedgerError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, LedgerError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = conn.lock();
        f(&conn)
    })
    .await
    .map_err(|e| LedgerError::Unavailable(format!("ledger task failed: {}", e)))?
}

fn storage(context: &str) -> impl Fn(rusqlite::Error) -> LedgerError + '_ {
    move |e| LedgerError::Storage(format!("{}: {}", context, e))
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, LedgerError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| LedgerError::Storage(format!("timestamp {} out of range", ms)))
}

fn decode(row: RawRow) -> Result<ExecutionRecord, LedgerError> {
    let fingerprint = Fingerprint::from_hex(&row.code_hash).ok_or_else(|| {
        LedgerError::Storage(format!("row {} has malformed code_hash", row.id))
    })?;
    let result = row
        .result
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|e| LedgerError::Storage(format!("row {} result: {}", row.id, e)))?;
    Ok(ExecutionRecord {
        id: row.id as u64,
        code: row.code,
        fingerprint,
        result,
        error: row.error,
        execution_time_ms: row.execution_time.max(0) as u64,
        created_at: timestamp(row.created_at)?,
        updated_at: timestamp(row.updated_at)?,
    })
}

#[async_trait]
impl ExecutionLedger for SqliteLedger {
    async fn append(&self, record: NewExecution) -> Result<u64, LedgerError> {
        record.validate()?;
        let result = record
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| LedgerError::InvalidRecord(format!("result not serializable: {}", e)))?;
        self.write(move |conn| {
            let now = Utc::now().timestamp_millis();
            conn.execute(
                "INSERT INTO code_executions
                     (code, code_hash, result, execution_time, error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    record.code,
                    record.fingerprint.to_hex(),
                    result,
                    record.execution_time_ms as i64,
                    record.error,
                    now,
                ],
            )
            .map_err(storage("insert execution"))?;
            Ok(conn.last_insert_rowid() as u64)
        })
        .await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>, LedgerError> {
        let rows = self
            .read(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, code, code_hash, result, execution_time, error, created_at, updated_at
                         FROM code_executions
                         ORDER BY created_at DESC, id DESC
                         LIMIT ?1",
                    )
                    .map_err(storage("prepare list"))?;
                let rows = stmt
                    .query_map(params![limit as i64], |row| {
                        Ok(RawRow {
                            id: row.get(0)?,
                            code: row.get(1)?,
                            code_hash: row.get(2)?,
                            result: row.get(3)?,
                            execution_time: row.get(4)?,
                            error: row.get(5)?,
                            created_at: row.get(6)?,
                            updated_at: row.get(7)?,
                        })
                    })
                    .map_err(storage("list executions"))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(storage("read execution row"))?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(decode).collect()
    }

    async fn stats_since(&self, since: DateTime<Utc>) -> Result<StatsSnapshot, LedgerError> {
        let since = since.timestamp_millis();
        self.read(move |conn| {
            conn.query_row(
                "SELECT COUNT(*),
                        AVG(execution_time),
                        MIN(execution_time),
                        MAX(execution_time),
                        COUNT(CASE WHEN error IS NOT NULL THEN 1 END)
                 FROM code_executions
                 WHERE created_at > ?1",
                params![since],
                |row| {
                    let total: i64 = row.get(0)?;
                    let avg: Option<f64> = row.get(1)?;
                    let min: Option<i64> = row.get(2)?;
                    let max: Option<i64> = row.get(3)?;
                    let errors: i64 = row.get(4)?;
                    Ok(StatsSnapshot {
                        total_executions: total as u64,
                        avg_time_ms: avg,
                        min_time_ms: min.map(|v| v as u64),
                        max_time_ms: max.map(|v| v as u64),
                        error_count: errors as u64,
                    })
                },
            )
            .map_err(storage("compute stats"))
        })
        .await
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        self.read(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(|e| LedgerError::Unavailable(format!("ping: {}", e)))
        })
        .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
