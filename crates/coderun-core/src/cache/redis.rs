//! Redis cache backend
//!
//! Entries are written with `SET key value EX ttl`, so expiry is enforced by
//! the server. The connection is opened on first use and discarded after any
//! failure. Only one task connects at a time and no lock is held while it
//! does; concurrent callers, and every caller during the backoff after a
//! failed attempt, get an immediate error, so an outage degrades the cache
//! to misses instead of queueing requests behind the connect.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;

use crate::error::CacheError;

use super::CacheBackend;

/// Bound on connecting and on each command
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(500);

/// Quiet period after a failed connect before the next attempt
const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Slot {
    conn: Option<ConnectionManager>,
    connecting: bool,
    retry_at: Option<Instant>,
}

pub struct RedisCacheBackend {
    client: redis::Client,
    url: String,
    slot: Mutex<Slot>,
    op_timeout: Duration,
    reconnect_backoff: Duration,
}

/// Clears the connecting flag however the attempt ends
struct ConnectAttempt<'a> {
    slot: &'a Mutex<Slot>,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        self.slot.lock().connecting = false;
    }
}

impl RedisCacheBackend {
    /// Backend for `redis://host:port`. No connection is made yet.
    pub fn new(host: &str, port: u16) -> Result<Self, CacheError> {
        Self::from_url(&format!("redis://{}:{}", host, port))
    }

    pub fn from_url(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::Unavailable(format!("invalid redis url {}: {}", url, e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
            slot: Mutex::new(Slot::default()),
            op_timeout: DEFAULT_OP_TIMEOUT,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        })
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let attempt = {
            let mut slot = self.slot.lock();
            if let Some(conn) = slot.conn.as_ref() {
                return Ok(conn.clone());
            }
            if slot.connecting {
                return Err(CacheError::Unavailable(format!(
                    "connection to {} in progress",
                    self.url
                )));
            }
            if slot.retry_at.is_some_and(|at| Instant::now() < at) {
                return Err(CacheError::Unavailable(format!(
                    "{} unreachable, backing off",
                    self.url
                )));
            }
            slot.connecting = true;
            ConnectAttempt { slot: &self.slot }
        };

        let connected = match tokio::time::timeout(
            self.op_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(CacheError::Unavailable(format!(
                "connecting to {}: {}",
                self.url, e
            ))),
            Err(_) => Err(CacheError::Unavailable(format!(
                "connecting to {} timed out",
                self.url
            ))),
        };

        let mut slot = self.slot.lock();
        match connected {
            Ok(conn) => {
                tracing::debug!(url = %self.url, "connected to redis");
                slot.conn = Some(conn.clone());
                slot.retry_at = None;
                drop(slot);
                drop(attempt);
                Ok(conn)
            }
            Err(e) => {
                slot.retry_at = Some(Instant::now() + self.reconnect_backoff);
                drop(slot);
                drop(attempt);
                Err(e)
            }
        }
    }

    fn reset(&self) {
        self.slot.lock().conn = None;
    }

    /// Run one command with the op timeout, dropping the connection on error
    async fn query<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, CacheError> {
        let mut conn = self.connection().await?;
        let outcome = tokio::time::timeout(self.op_timeout, cmd.query_async(&mut conn)).await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.reset();
                Err(CacheError::Unavailable(e.to_string()))
            }
            Err(_) => {
                self.reset();
                Err(CacheError::Unavailable(format!(
                    "redis command timed out after {}ms",
                    self.op_timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl.as_secs().max(1));
        self.query(cmd).await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let pong: String = self.query(redis::cmd("PING")).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(CacheError::Unavailable(format!("unexpected PING reply {}", pong)))
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_from_host_and_port() {
        let backend = RedisCacheBackend::new("cache.internal", 6380).unwrap();
        assert_eq!(backend.url(), "redis://cache.internal:6380");
        assert_eq!(backend.name(), "redis");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RedisCacheBackend::from_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_fast() {
        // Port 1 on localhost is never a Redis server
        let backend = RedisCacheBackend::new("127.0.0.1", 1)
            .unwrap()
            .with_op_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        assert!(backend.get("code:abc").await.is_err());
        assert!(backend.ping().await.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_do_not_queue_behind_connect() {
        // Non-routable address: the connect either hangs until the timeout
        // or fails at once, never succeeds
        let op_timeout = Duration::from_millis(300);
        let backend = std::sync::Arc::new(
            RedisCacheBackend::new("10.255.255.1", 6379)
                .unwrap()
                .with_op_timeout(op_timeout),
        );
        let started = std::time::Instant::now();
        let calls: Vec<_> = (0..16)
            .map(|i| {
                let backend = backend.clone();
                tokio::spawn(async move { backend.get(&format!("code:{}", i)).await })
            })
            .collect();
        for call in calls {
            assert!(call.await.unwrap().is_err());
        }
        let elapsed = started.elapsed();
        assert!(
            elapsed < op_timeout * 3,
            "16 concurrent misses took {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_failed_connect_backs_off() {
        let backend = RedisCacheBackend::new("127.0.0.1", 1)
            .unwrap()
            .with_op_timeout(Duration::from_millis(200))
            .with_reconnect_backoff(Duration::from_secs(60));
        assert!(backend.get("code:abc").await.is_err());

        let started = std::time::Instant::now();
        let err = backend.get("code:abc").await.unwrap_err();
        assert!(err.to_string().contains("backing off"), "{}", err);
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
