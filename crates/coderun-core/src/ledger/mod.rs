//! Append-only execution ledger
//!
//! One [`ExecutionRecord`] per evaluation attempt, success or fault. Cache
//! hits are never recorded. Records are immutable once appended and ids are
//! assigned by the ledger, strictly increasing and never reused.
//!
//! # Backends
//!
//! - [`MemoryLedger`]: process-local, lost on exit
//! - [`SqliteLedger`]: `code_executions` table in a SQLite file

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::fingerprint::Fingerprint;
use crate::stats::StatsSnapshot;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

/// Default number of records returned by `list_recent`
pub const DEFAULT_RECENT_LIMIT: usize = 100;

/// A stored execution attempt.
///
/// Serialized with the column names of the `code_executions` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: u64,
    pub code: String,
    #[serde(rename = "code_hash")]
    pub fingerprint: Fingerprint,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(rename = "execution_time")]
    pub execution_time_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A record about to be appended; the ledger assigns id and timestamps.
///
/// Exactly one of `result` / `error` must be set. Build it with
/// [`NewExecution::succeeded`] or [`NewExecution::failed`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewExecution {
    pub code: String,
    pub fingerprint: Fingerprint,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl NewExecution {
    pub fn succeeded(
        code: impl Into<String>,
        fingerprint: Fingerprint,
        result: serde_json::Value,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            code: code.into(),
            fingerprint,
            result: Some(result),
            error: None,
            execution_time_ms,
        }
    }

    pub fn failed(
        code: impl Into<String>,
        fingerprint: Fingerprint,
        error: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            code: code.into(),
            fingerprint,
            result: None,
            error: Some(error.into()),
            execution_time_ms,
        }
    }

    /// Enforce result/error exclusivity
    pub fn validate(&self) -> Result<(), LedgerError> {
        match (&self.result, &self.error) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(LedgerError::InvalidRecord(
                "both result and error are set".into(),
            )),
            (None, None) => Err(LedgerError::InvalidRecord(
                "neither result nor error is set".into(),
            )),
        }
    }

    pub(crate) fn into_record(self, id: u64, now: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord {
            id,
            code: self.code,
            fingerprint: self.fingerprint,
            result: self.result,
            error: self.error,
            execution_time_ms: self.execution_time_ms,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Durable, append-only store of execution attempts.
///
/// Reads reflect every append that returned before the read began.
#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    /// Store a record and return its id
    async fn append(&self, record: NewExecution) -> Result<u64, LedgerError>;

    /// Up to `limit` records, most recent first
    async fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>, LedgerError>;

    /// Aggregate over records created strictly after `since`
    async fn stats_since(&self, since: DateTime<Utc>) -> Result<StatsSnapshot, LedgerError>;

    async fn ping(&self) -> Result<(), LedgerError>;

    fn name(&self) -> &'static str;
}
