//! Request orchestration: fingerprint → cache → sandbox → cache → ledger
//!
//! [`ExecutionCoordinator::execute`] is the only write path. A cache hit
//! returns immediately without touching the sandbox or the ledger. A miss
//! evaluates the snippet in a spawned task that always runs to completion,
//! so the cache and ledger stay consistent even if the caller goes away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cache::ResultCache;
use crate::error::{ExecutionFault, InputFault, LedgerError, Result};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::ledger::{ExecutionLedger, ExecutionRecord, NewExecution, DEFAULT_RECENT_LIMIT};
use crate::sandbox::{CapturedConsole, ConsoleLine, SandboxExecutor, DEFAULT_TIMEOUT};
use crate::single_flight::{Flight, FlightGuard, SingleFlight};
use crate::stats::{StatsAggregator, StatsSnapshot, DEFAULT_WINDOW};

type FlightOutcome = std::result::Result<serde_json::Value, ExecutionFault>;

/// What a successful `execute` hands back
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub fingerprint: Fingerprint,
    pub result: serde_json::Value,
    /// True when the snippet was not evaluated for this request
    pub cached: bool,
    /// Console output of this evaluation; empty when `cached`
    pub console: Vec<ConsoleLine>,
}

/// Dependency status as seen by `health()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub cache_backend: &'static str,
    pub cache_ok: bool,
    pub ledger_backend: &'static str,
    pub ledger_ok: bool,
    /// The most recent ledger append failed
    pub ledger_degraded: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.cache_ok && self.ledger_ok && !self.ledger_degraded
    }
}

#[derive(Clone)]
pub struct ExecutionCoordinator {
    sandbox: Arc<dyn SandboxExecutor>,
    cache: ResultCache,
    ledger: Arc<dyn ExecutionLedger>,
    stats: StatsAggregator,
    flights: Option<SingleFlight<Fingerprint, FlightOutcome>>,
    timeout: Duration,
    recent_limit: usize,
    ledger_degraded: Arc<AtomicBool>,
}

impl ExecutionCoordinator {
    /// Coordinator with default timeout, stats window and recent limit, and
    /// single-flight enabled
    pub fn new(
        sandbox: Arc<dyn SandboxExecutor>,
        cache: ResultCache,
        ledger: Arc<dyn ExecutionLedger>,
    ) -> Self {
        Self {
            sandbox,
            cache,
            stats: StatsAggregator::new(Arc::clone(&ledger), DEFAULT_WINDOW),
            ledger,
            flights: Some(SingleFlight::new()),
            timeout: DEFAULT_TIMEOUT,
            recent_limit: DEFAULT_RECENT_LIMIT,
            ledger_degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stats_window(mut self, window: Duration) -> Self {
        self.stats = StatsAggregator::new(Arc::clone(&self.ledger), window);
        self
    }

    pub fn with_recent_limit(mut self, limit: usize) -> Self {
        self.recent_limit = limit;
        self
    }

    pub fn with_single_flight(mut self, enabled: bool) -> Self {
        self.flights = enabled.then(SingleFlight::new);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn recent_limit(&self) -> usize {
        self.recent_limit
    }

    /// Run a snippet, or answer it from the cache.
    ///
    /// Returns [`Error::Input`](crate::Error::Input) for an empty snippet
    /// and [`Error::Execution`](crate::Error::Execution) when the snippet
    /// faults.
    pub async fn execute(&self, code: &str) -> Result<ExecutionOutcome> {
        if code.is_empty() {
            return Err(InputFault::Empty.into());
        }
        let fp = fingerprint(code.as_bytes());

        if let Some(entry) = self.cache.get(&fp).await {
            tracing::info!(fingerprint = %fp, cached = true, "served from cache");
            return Ok(cached(fp, entry.result));
        }

        let Some(flights) = &self.flights else {
            return self.evaluate(code, fp, None).await;
        };

        match flights.join(fp) {
            Flight::Leader(guard) => {
                // The previous flight may have filled the cache after our lookup
                if let Some(entry) = self.cache.get(&fp).await {
                    guard.complete(Ok(entry.result.clone()));
                    return Ok(cached(fp, entry.result));
                }
                self.evaluate(code, fp, Some(guard)).await
            }
            Flight::Follower(waiter) => {
                tracing::debug!(
                    fingerprint = %fp,
                    in_flight = flights.in_flight(),
                    "waiting on in-flight execution"
                );
                match waiter.wait().await {
                    Some(Ok(result)) => {
                        tracing::info!(fingerprint = %fp, cached = true, "joined in-flight execution");
                        Ok(cached(fp, result))
                    }
                    Some(Err(fault)) => Err(fault.into()),
                    None => {
                        tracing::debug!(fingerprint = %fp, "leader abandoned flight, executing");
                        self.evaluate(code, fp, None).await
                    }
                }
            }
        }
    }

    /// Evaluate on a detached task and wait for it
    async fn evaluate(
        &self,
        code: &str,
        fp: Fingerprint,
        guard: Option<FlightGuard<Fingerprint, FlightOutcome>>,
    ) -> Result<ExecutionOutcome> {
        let this = self.clone();
        let code = code.to_owned();
        let task = tokio::spawn(async move { this.run_to_ledger(code, fp, guard).await });
        let (outcome, console) = task
            .await
            .map_err(|e| ExecutionFault::Internal(format!("execution task failed: {}", e)))?;
        let result = outcome?;
        Ok(ExecutionOutcome {
            fingerprint: fp,
            result,
            cached: false,
            console,
        })
    }

    async fn run_to_ledger(
        &self,
        code: String,
        fp: Fingerprint,
        guard: Option<FlightGuard<Fingerprint, FlightOutcome>>,
    ) -> (FlightOutcome, Vec<ConsoleLine>) {
        let console = Arc::new(CapturedConsole::new(Some(fp)));
        let started = Instant::now();
        let outcome = self.sandbox.run(&code, self.timeout, console.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if let Ok(result) = &outcome {
            self.cache.put(&fp, result).await;
        }
        if let Some(guard) = guard {
            guard.complete(outcome.clone());
        }

        let record = match &outcome {
            Ok(result) => {
                tracing::info!(fingerprint = %fp, elapsed_ms, "execution succeeded");
                NewExecution::succeeded(code, fp, result.clone(), elapsed_ms)
            }
            Err(fault) => {
                tracing::info!(fingerprint = %fp, elapsed_ms, error = %fault, "execution faulted");
                NewExecution::failed(code, fp, fault.to_string(), elapsed_ms)
            }
        };
        match self.ledger.append(record).await {
            Ok(id) => {
                self.ledger_degraded.store(false, Ordering::Relaxed);
                tracing::debug!(fingerprint = %fp, id, "execution recorded");
            }
            Err(e) => {
                self.ledger_degraded.store(true, Ordering::Relaxed);
                tracing::error!(
                    fingerprint = %fp,
                    ledger = self.ledger.name(),
                    error = %e,
                    "failed to record execution"
                );
            }
        }

        (outcome, console.lines())
    }

    /// Up to `limit` records, most recent first
    pub async fn recent_executions(
        &self,
        limit: usize,
    ) -> std::result::Result<Vec<ExecutionRecord>, LedgerError> {
        self.ledger.list_recent(limit).await
    }

    pub async fn stats(&self) -> std::result::Result<StatsSnapshot, LedgerError> {
        self.stats.snapshot().await
    }

    pub async fn health(&self) -> HealthReport {
        let (cache, ledger) = tokio::join!(self.cache.ping(), self.ledger.ping());
        if let Err(e) = &cache {
            tracing::warn!(backend = self.cache.backend_name(), error = %e, "cache unhealthy");
        }
        if let Err(e) = &ledger {
            tracing::warn!(backend = self.ledger.name(), error = %e, "ledger unhealthy");
        }
        HealthReport {
            cache_backend: self.cache.backend_name(),
            cache_ok: cache.is_ok(),
            ledger_backend: self.ledger.name(),
            ledger_ok: ledger.is_ok(),
            ledger_degraded: self.ledger_degraded.load(Ordering::Relaxed),
        }
    }
}

fn cached(fingerprint: Fingerprint, result: serde_json::Value) -> ExecutionOutcome {
    ExecutionOutcome {
        fingerprint,
        result,
        cached: true,
        console: Vec::new(),
    }
}
