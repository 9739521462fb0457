//! In-process cache backend

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::CacheError;

use super::CacheBackend;

/// Writes between two eager sweeps of expired entries
const DEFAULT_PURGE_INTERVAL: usize = 1024;

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Concurrent map with per-entry expiry.
///
/// Expired entries are dropped lazily on read; every 1024th write runs
/// [`purge_expired`] to evict the ones that are never read again.
///
/// [`purge_expired`]: MemoryCacheBackend::purge_expired
pub struct MemoryCacheBackend {
    entries: DashMap<String, Entry>,
    writes: AtomicUsize,
    purge_interval: usize,
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            writes: AtomicUsize::new(0),
            purge_interval: DEFAULT_PURGE_INTERVAL,
        }
    }
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep expired entries every `writes` writes (at least one)
    pub fn with_purge_interval(mut self, writes: usize) -> Self {
        self.purge_interval = writes.max(1);
        self
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Entries currently held, expired or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.purge_interval == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "purged expired cache entries");
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
