//! Pipeline configuration
//!
//! Loaded from a JSON file (every field optional), then overridden by
//! environment variables, then validated:
//!
//! | Env | Field |
//! |---|---|
//! | `CODERUN_TIMEOUT_MS` | `sandbox.timeout_ms` |
//! | `CODERUN_CACHE` | `cache.backend` (`memory` / `redis`) |
//! | `REDIS_HOST`, `REDIS_PORT` | `cache.redis_host`, `cache.redis_port` |
//! | `CODERUN_LEDGER` | `ledger.backend` (`memory` / `sqlite`) |
//! | `CODERUN_LEDGER_PATH` | `ledger.sqlite_path` |

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheBackend, MemoryCacheBackend, RedisCacheBackend, ResultCache};
use crate::coordinator::ExecutionCoordinator;
use crate::error::{ConfigError, Result};
use crate::ledger::{ExecutionLedger, MemoryLedger, SqliteLedger};
use crate::sandbox::{InterpreterSandbox, SandboxLimits};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub cache: CacheConfig,
    pub ledger: LedgerConfig,
    pub stats: StatsConfig,
    /// Coalesce concurrent misses for the same snippet
    pub single_flight: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            cache: CacheConfig::default(),
            ledger: LedgerConfig::default(),
            stats: StatsConfig::default(),
            single_flight: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    #[serde(flatten)]
    pub limits: SandboxLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            limits: SandboxLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheKind,
    pub redis_host: String,
    pub redis_port: u16,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheKind::Memory,
            redis_host: "localhost".into(),
            redis_port: 6379,
            ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerKind,
    pub sqlite_path: PathBuf,
    pub recent_limit: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerKind::Memory,
            sqlite_path: PathBuf::from("coderun.db"),
            recent_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub window_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { window_secs: 86_400 }
    }
}

impl FromStr for CacheKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(CacheKind::Memory),
            "redis" => Ok(CacheKind::Redis),
            other => Err(format!("unknown cache backend `{}`", other)),
        }
    }
}

impl FromStr for LedgerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(LedgerKind::Memory),
            "sqlite" => Ok(LedgerKind::Sqlite),
            other => Err(format!("unknown ledger backend `{}`", other)),
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheKind::Memory => "memory",
            CacheKind::Redis => "redis",
        })
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LedgerKind::Memory => "memory",
            LedgerKind::Sqlite => "sqlite",
        })
    }
}

fn parse_env<T: FromStr>(field: &'static str, raw: &str) -> std::result::Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })
}

impl Config {
    pub fn from_json(text: &str) -> std::result::Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// File (if given) + process environment, validated
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    pub fn apply_env<F>(&mut self, lookup: F) -> std::result::Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("CODERUN_TIMEOUT_MS") {
            self.sandbox.timeout_ms = parse_env("sandbox.timeout_ms", &raw)?;
        }
        if let Some(raw) = lookup("CODERUN_CACHE") {
            self.cache.backend = parse_env("cache.backend", &raw)?;
        }
        if let Some(raw) = lookup("REDIS_HOST") {
            self.cache.redis_host = raw;
        }
        if let Some(raw) = lookup("REDIS_PORT") {
            self.cache.redis_port = parse_env("cache.redis_port", &raw)?;
        }
        if let Some(raw) = lookup("CODERUN_LEDGER") {
            self.ledger.backend = parse_env("ledger.backend", &raw)?;
        }
        if let Some(raw) = lookup("CODERUN_LEDGER_PATH") {
            self.ledger.sqlite_path = PathBuf::from(raw);
        }
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if self.sandbox.timeout_ms == 0 {
            return invalid("sandbox.timeout_ms", "must be greater than zero");
        }
        if self.cache.ttl_secs == 0 {
            return invalid("cache.ttl_secs", "must be greater than zero");
        }
        if self.ledger.recent_limit == 0 {
            return invalid("ledger.recent_limit", "must be greater than zero");
        }
        if self.stats.window_secs == 0 {
            return invalid("stats.window_secs", "must be greater than zero");
        }
        if self.sandbox.limits.max_call_depth == 0 {
            return invalid("sandbox.max_call_depth", "must be greater than zero");
        }
        if self.cache.backend == CacheKind::Redis && self.cache.redis_host.trim().is_empty() {
            return invalid("cache.redis_host", "must not be empty");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox.timeout_ms)
    }

    /// Wire sandbox, cache and ledger backends into a coordinator
    pub fn build_coordinator(&self) -> Result<ExecutionCoordinator> {
        let backend: Arc<dyn CacheBackend> = match self.cache.backend {
            CacheKind::Memory => Arc::new(MemoryCacheBackend::new()),
            CacheKind::Redis => {
                let redis = RedisCacheBackend::new(&self.cache.redis_host, self.cache.redis_port)?;
                tracing::info!(url = redis.url(), "using redis result cache");
                Arc::new(redis)
            }
        };
        let ledger: Arc<dyn ExecutionLedger> = match self.ledger.backend {
            LedgerKind::Memory => Arc::new(MemoryLedger::new()),
            LedgerKind::Sqlite => Arc::new(SqliteLedger::open(&self.ledger.sqlite_path)?),
        };
        tracing::debug!(
            cache = %self.cache.backend,
            ledger = %self.ledger.backend,
            timeout_ms = self.sandbox.timeout_ms,
            "building coordinator"
        );

        Ok(ExecutionCoordinator::new(
            Arc::new(InterpreterSandbox::new(self.sandbox.limits.clone())),
            ResultCache::new(backend, Duration::from_secs(self.cache.ttl_secs)),
            ledger,
        )
        .with_timeout(self.timeout())
        .with_stats_window(Duration::from_secs(self.stats.window_secs))
        .with_recent_limit(self.ledger.recent_limit)
        .with_single_flight(self.single_flight))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sandbox.timeout_ms, 1000);
        assert_eq!(config.cache.backend, CacheKind::Memory);
        assert_eq!(config.cache.redis_port, 6379);
        assert_eq!(config.ledger.recent_limit, 100);
        assert_eq!(config.stats.window_secs, 86_400);
        assert!(config.single_flight);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_json(
            r#"{"sandbox": {"timeout_ms": 250, "max_call_depth": 64}, "cache": {"backend": "redis"}}"#,
        )
        .unwrap();
        assert_eq!(config.sandbox.timeout_ms, 250);
        assert_eq!(config.sandbox.limits.max_call_depth, 64);
        assert_eq!(
            config.sandbox.limits.max_console_lines,
            SandboxLimits::default().max_console_lines
        );
        assert_eq!(config.cache.backend, CacheKind::Redis);
        assert_eq!(config.cache.ttl_secs, 3600);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("CODERUN_TIMEOUT_MS", "500"),
                ("CODERUN_CACHE", "Redis"),
                ("REDIS_HOST", "cache.internal"),
                ("REDIS_PORT", "6380"),
                ("CODERUN_LEDGER", "sqlite"),
                ("CODERUN_LEDGER_PATH", "/tmp/runs.db"),
            ]))
            .unwrap();
        assert_eq!(config.sandbox.timeout_ms, 500);
        assert_eq!(config.cache.backend, CacheKind::Redis);
        assert_eq!(config.cache.redis_host, "cache.internal");
        assert_eq!(config.cache.redis_port, 6380);
        assert_eq!(config.ledger.backend, LedgerKind::Sqlite);
        assert_eq!(config.ledger.sqlite_path, PathBuf::from("/tmp/runs.db"));
    }

    #[test]
    fn test_bad_env_value_names_field() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("REDIS_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { field: "cache.redis_port", .. }
        ));

        let err = config.apply_env(env(&[("CODERUN_CACHE", "memcached")])).unwrap_err();
        assert!(err.to_string().contains("memcached"));
    }

    #[test]
    fn test_validation_rejects_zeroes() {
        let mut config = Config::default();
        config.sandbox.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ledger.recent_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Config::load_from_file("/nonexistent/coderun.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coderun.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(
            Config::load_from_file(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_build_coordinator_with_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.ledger.backend = LedgerKind::Sqlite;
        config.ledger.sqlite_path = dir.path().join("ledger.db");
        config.sandbox.timeout_ms = 200;

        let coordinator = config.build_coordinator().unwrap();
        assert_eq!(coordinator.timeout(), Duration::from_millis(200));
        let outcome = coordinator.execute("[1, 2, 3].length").await.unwrap();
        assert_eq!(outcome.result, serde_json::json!(3));
        assert_eq!(coordinator.recent_executions(10).await.unwrap().len(), 1);
        assert!(coordinator.health().await.is_healthy());
    }
}
