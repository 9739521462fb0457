//! Process-local ledger

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::LedgerError;
use crate::stats::StatsSnapshot;

use super::{ExecutionLedger, ExecutionRecord, NewExecution};

/// Records kept in append order behind a read-write lock.
///
/// Appends hold the write lock only for the push; readers clone the `Arc`s
/// they need and do their work after releasing it.
pub struct MemoryLedger {
    records: RwLock<Vec<Arc<ExecutionRecord>>>,
    next_id: AtomicU64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionLedger for MemoryLedger {
    async fn append(&self, record: NewExecution) -> Result<u64, LedgerError> {
        record.validate()?;
        let mut records = self.records.write();
        // Allocated under the lock so ids follow append order
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        records.push(Arc::new(record.into_record(id, Utc::now())));
        Ok(id)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>, LedgerError> {
        let recent: Vec<Arc<ExecutionRecord>> = {
            let records = self.records.read();
            records.iter().rev().take(limit).cloned().collect()
        };
        Ok(recent.iter().map(|r| ExecutionRecord::clone(r)).collect())
    }

    async fn stats_since(&self, since: DateTime<Utc>) -> Result<StatsSnapshot, LedgerError> {
        let snapshot: Vec<Arc<ExecutionRecord>> = self.records.read().clone();
        Ok(StatsSnapshot::from_records(
            snapshot.iter().map(|r| r.as_ref()).filter(|r| r.created_at > since),
        ))
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
