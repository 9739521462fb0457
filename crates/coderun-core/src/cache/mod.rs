//! Content-addressable result cache
//!
//! [`ResultCache`] maps a [`Fingerprint`] to the JSON result of a successful
//! run, under key `code:<hex>`, for a bounded TTL. The cache is an
//! optimization: every backend failure is logged and treated as a miss.

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::fingerprint::Fingerprint;

pub use memory::MemoryCacheBackend;
pub use self::redis::RedisCacheBackend;

/// Default entry lifetime (one hour)
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Key/value store holding serialized results.
///
/// Implementations enforce expiry themselves: `get` must never return an
/// entry older than the TTL it was stored with.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value`, replacing any existing entry
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;

    fn name(&self) -> &'static str;
}

/// A cached successful result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub result: serde_json::Value,
}

#[derive(Clone)]
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// In-process cache with the default TTL
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new()), DEFAULT_TTL)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Look up a result. Backend errors and undecodable entries are misses.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let raw = match self.backend.get(&fingerprint.cache_key()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::debug!(fingerprint = %fingerprint, "cache miss");
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    fingerprint = %fingerprint,
                    backend = self.backend.name(),
                    error = %e,
                    "cache lookup failed, treating as miss"
                );
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(result) => {
                tracing::debug!(fingerprint = %fingerprint, "cache hit");
                Some(CacheEntry {
                    fingerprint: *fingerprint,
                    result,
                })
            }
            Err(e) => {
                tracing::warn!(
                    fingerprint = %fingerprint,
                    error = %CacheError::from(e),
                    "discarding undecodable cache entry"
                );
                None
            }
        }
    }

    /// Store a successful result. Failures are logged and swallowed.
    pub async fn put(&self, fingerprint: &Fingerprint, result: &serde_json::Value) {
        let raw = match serde_json::to_string(result) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint, error = %e, "result not cacheable");
                return;
            }
        };
        if let Err(e) = self
            .backend
            .set(&fingerprint.cache_key(), &raw, self.ttl)
            .await
        {
            tracing::warn!(
                fingerprint = %fingerprint,
                backend = self.backend.name(),
                error = %e,
                "cache write failed"
            );
        }
    }

    /// Liveness check for health reporting
    pub async fn ping(&self) -> Result<(), CacheError> {
        self.backend.ping().await
    }
}
