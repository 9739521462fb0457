//! Rolling execution statistics
//!
//! Derived from the ledger on every request, never stored. An empty window
//! reports zero counts and no time statistics.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::ledger::{ExecutionLedger, ExecutionRecord};

/// Default trailing window (24 hours)
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Aggregates over the records in one window.
///
/// Time fields are `None` when the window holds no records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_executions: u64,
    #[serde(rename = "avg_execution_time")]
    pub avg_time_ms: Option<f64>,
    #[serde(rename = "min_execution_time")]
    pub min_time_ms: Option<u64>,
    #[serde(rename = "max_execution_time")]
    pub max_time_ms: Option<u64>,
    pub error_count: u64,
}

impl StatsSnapshot {
    pub fn empty() -> Self {
        Self {
            total_executions: 0,
            avg_time_ms: None,
            min_time_ms: None,
            max_time_ms: None,
            error_count: 0,
        }
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ExecutionRecord>) -> Self {
        let mut snapshot = Self::empty();
        let mut total_time: u128 = 0;
        for record in records {
            let ms = record.execution_time_ms;
            snapshot.total_executions += 1;
            total_time += ms as u128;
            snapshot.min_time_ms = Some(snapshot.min_time_ms.map_or(ms, |m| m.min(ms)));
            snapshot.max_time_ms = Some(snapshot.max_time_ms.map_or(ms, |m| m.max(ms)));
            if record.is_error() {
                snapshot.error_count += 1;
            }
        }
        if snapshot.total_executions > 0 {
            snapshot.avg_time_ms = Some(total_time as f64 / snapshot.total_executions as f64);
        }
        snapshot
    }

    /// Fraction of executions that faulted, `None` for an empty window
    pub fn error_rate(&self) -> Option<f64> {
        if self.total_executions == 0 {
            return None;
        }
        Some(self.error_count as f64 / self.total_executions as f64)
    }
}

/// Computes [`StatsSnapshot`]s over a trailing window of the ledger
#[derive(Clone)]
pub struct StatsAggregator {
    ledger: Arc<dyn ExecutionLedger>,
    window: Duration,
}

impl StatsAggregator {
    pub fn new(ledger: Arc<dyn ExecutionLedger>, window: Duration) -> Self {
        Self { ledger, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Start of the window ending now
    pub fn window_start(&self) -> DateTime<Utc> {
        let window = chrono::Duration::milliseconds(self.window.as_millis().min(i64::MAX as u128) as i64);
        Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub async fn snapshot(&self) -> Result<StatsSnapshot, LedgerError> {
        self.ledger.stats_since(self.window_start()).await
    }
}
