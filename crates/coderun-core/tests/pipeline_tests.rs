//! End-to-end tests for the execution pipeline
//!
//! Each test wires a coordinator from real backends (in-memory or SQLite)
//! and drives it through the public API only.

use std::sync::Arc;
use std::time::{Duration, Instant};

use coderun_core::cache::{MemoryCacheBackend, ResultCache};
use coderun_core::ledger::{ExecutionLedger, MemoryLedger, NewExecution, SqliteLedger};
use coderun_core::stats::{StatsAggregator, DEFAULT_WINDOW};
use coderun_core::{
    fingerprint, Api, Error, ExecutionCoordinator, ExecutionFault, InterpreterSandbox,
    StatsSnapshot,
};
use serde_json::json;

// ── Helpers ───────────────────────────────────────────────

fn pipeline(ttl: Duration, timeout: Duration) -> (ExecutionCoordinator, Arc<MemoryLedger>) {
    let ledger = Arc::new(MemoryLedger::new());
    let coordinator = ExecutionCoordinator::new(
        Arc::new(InterpreterSandbox::default()),
        ResultCache::new(Arc::new(MemoryCacheBackend::new()), ttl),
        ledger.clone(),
    )
    .with_timeout(timeout);
    (coordinator, ledger)
}

fn default_pipeline() -> (ExecutionCoordinator, Arc<MemoryLedger>) {
    pipeline(Duration::from_secs(3600), Duration::from_millis(1000))
}

// ── Fingerprints ──────────────────────────────────────────

#[test]
fn test_fingerprint_determinism_100_iterations() {
    let snippets = ["1+1", "1 + 1", "", "const x = 'ü'; x", "\n"];
    for snippet in snippets {
        let first = fingerprint(snippet.as_bytes());
        for i in 0..100 {
            assert_eq!(
                first,
                fingerprint(snippet.as_bytes()),
                "Non-determinism for {:?} at iteration {}",
                snippet,
                i
            );
        }
    }
    assert_ne!(fingerprint(b"1+1"), fingerprint(b"1 + 1"));
}

// ── Cache ─────────────────────────────────────────────────

#[tokio::test]
async fn test_cache_round_trip_adds_no_record() {
    let (coordinator, ledger) = default_pipeline();
    let first = coordinator.execute("[1, 'two', {three: 3}]").await.unwrap();
    assert!(!first.cached);
    assert_eq!(ledger.len(), 1);

    for _ in 0..5 {
        let again = coordinator.execute("[1, 'two', {three: 3}]").await.unwrap();
        assert!(again.cached);
        assert_eq!(again.result, first.result);
    }
    assert_eq!(ledger.len(), 1);
}

#[tokio::test]
async fn test_expired_entry_is_reexecuted() {
    let (coordinator, ledger) = pipeline(Duration::from_millis(50), Duration::from_millis(1000));
    assert!(!coordinator.execute("Math.max(4, 9)").await.unwrap().cached);
    assert!(coordinator.execute("Math.max(4, 9)").await.unwrap().cached);

    tokio::time::sleep(Duration::from_millis(120)).await;

    let outcome = coordinator.execute("Math.max(4, 9)").await.unwrap();
    assert!(!outcome.cached);
    assert_eq!(outcome.result, json!(9));
    assert_eq!(ledger.len(), 2);
}

#[tokio::test]
async fn test_whitespace_variants_are_distinct_entries() {
    let (coordinator, ledger) = default_pipeline();
    coordinator.execute("1+1").await.unwrap();
    let spaced = coordinator.execute("1 + 1").await.unwrap();
    assert!(!spaced.cached);
    assert_eq!(ledger.len(), 2);
}

// ── Sandbox bounds ────────────────────────────────────────

#[tokio::test]
async fn test_timeout_fault_within_bound() {
    let timeout = Duration::from_millis(200);
    let (coordinator, ledger) = pipeline(Duration::from_secs(3600), timeout);
    let started = Instant::now();
    let err = coordinator.execute("while(true){}").await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(
        err,
        Error::Execution(ExecutionFault::Timeout { timeout_ms: 200 })
    ));
    assert!(elapsed >= timeout, "returned early after {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_secs(1), "took {:?}", elapsed);

    let records = ledger.list_recent(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].error.as_deref(),
        Some("Script execution timed out after 200ms")
    );
    assert!(records[0].result.is_none());
}

#[tokio::test]
async fn test_timeout_is_not_cached() {
    let (coordinator, ledger) = pipeline(Duration::from_secs(3600), Duration::from_millis(50));
    for _ in 0..2 {
        assert!(coordinator.execute("for(;;){}").await.is_err());
    }
    assert_eq!(ledger.len(), 2);
}

#[tokio::test]
async fn test_no_state_leaks_between_runs() {
    let (coordinator, _) = default_pipeline();
    coordinator.execute("var leaked = 42; leaked").await.unwrap();
    let err = coordinator.execute("leaked").await.unwrap_err();
    assert_eq!(err.to_string(), "ReferenceError: leaked is not defined");
}

// ── Ledger ────────────────────────────────────────────────

#[tokio::test]
async fn test_one_exclusive_record_per_attempt() {
    let (coordinator, ledger) = default_pipeline();
    let snippets = ["1", "nope()", "'a'.toUpperCase()", "throw new RangeError('r')", "null"];
    for snippet in snippets {
        let _ = coordinator.execute(snippet).await;
    }
    let records = ledger.list_recent(100).await.unwrap();
    assert_eq!(records.len(), snippets.len());
    for record in &records {
        assert!(
            record.result.is_some() != record.error.is_some(),
            "record {} violates exclusivity",
            record.id
        );
        assert_eq!(record.fingerprint, fingerprint(record.code.as_bytes()));
    }
    assert!(records.windows(2).all(|w| w[0].id > w[1].id));
    assert_eq!(records.iter().filter(|r| r.is_error()).count(), 2);
}

#[tokio::test]
async fn test_sqlite_ledger_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coderun.db");
    {
        let ledger = Arc::new(SqliteLedger::open(&path).unwrap());
        let coordinator = ExecutionCoordinator::new(
            Arc::new(InterpreterSandbox::default()),
            ResultCache::in_memory(),
            ledger,
        );
        coordinator.execute("6 * 7").await.unwrap();
        coordinator.execute("missing").await.unwrap_err();
    }

    let reopened = SqliteLedger::open(&path).unwrap();
    let records = reopened.list_recent(10).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].result, Some(json!(42)));
    assert_eq!(
        records[0].error.as_deref(),
        Some("ReferenceError: missing is not defined")
    );
}

// ── Stats ─────────────────────────────────────────────────

#[tokio::test]
async fn test_empty_window_stats() {
    let ledger: Arc<dyn ExecutionLedger> = Arc::new(MemoryLedger::new());
    let stats = StatsAggregator::new(ledger.clone(), DEFAULT_WINDOW)
        .snapshot()
        .await
        .unwrap();
    assert_eq!(stats, StatsSnapshot::empty());

    // Records outside the window are not counted
    ledger
        .append(NewExecution::succeeded("1", fingerprint(b"1"), json!(1), 5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let narrow = StatsAggregator::new(ledger, Duration::from_millis(5))
        .snapshot()
        .await
        .unwrap();
    assert_eq!(narrow.total_executions, 0);
    assert_eq!(narrow.avg_time_ms, None);
}

#[tokio::test]
async fn test_stats_track_executions() {
    let (coordinator, _) = default_pipeline();
    coordinator.execute("1").await.unwrap();
    coordinator.execute("2").await.unwrap();
    coordinator.execute("oops").await.unwrap_err();
    coordinator.execute("1").await.unwrap(); // cache hit, not counted

    let stats = coordinator.stats().await.unwrap();
    assert_eq!(stats.total_executions, 3);
    assert_eq!(stats.error_count, 1);
    assert!(stats.min_time_ms.unwrap() <= stats.max_time_ms.unwrap());
    assert!(stats.avg_time_ms.is_some());
}

// ── Scenarios ─────────────────────────────────────────────

#[tokio::test]
async fn test_scenario_one_plus_one() {
    let (coordinator, ledger) = default_pipeline();
    let api = Api::new(coordinator);

    let first = api.execute(&json!({"code": "1+1"})).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.body, json!({"result": 2, "cached": false}));

    let second = api.execute(&json!({"code": "1+1"})).await;
    assert_eq!(second.body, json!({"result": 2, "cached": true}));

    let records = ledger.list_recent(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].code, "1+1");
    assert_eq!(records[0].result, Some(json!(2)));
    assert_eq!(records[0].error, None);
}

#[tokio::test]
async fn test_scenario_infinite_loop() {
    let (coordinator, ledger) = default_pipeline();
    let api = Api::new(coordinator);

    let started = Instant::now();
    let response = api.execute(&json!({"code": "while(true){}"})).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(response.status, 400);
    assert_eq!(
        response.body,
        json!({"error": "Script execution timed out after 1000ms"})
    );
    assert_eq!(ledger.len(), 1);

    // Later requests are unaffected
    let next = api.execute(&json!({"code": "'still' + ' alive'"})).await;
    assert_eq!(next.body["result"], json!("still alive"));
}

#[tokio::test]
async fn test_scenario_invalid_request() {
    let (coordinator, ledger) = default_pipeline();
    let api = Api::new(coordinator);
    for body in [json!({}), json!({"code": ""}), json!({"code": 5})] {
        let response = api.execute(&body).await;
        assert_eq!(response.status, 400);
        assert!(response.body["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid code"));
    }
    assert!(ledger.is_empty());
}

// ── Concurrency ───────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_snippet_does_not_block_others() {
    let (coordinator, _) = pipeline(Duration::from_secs(3600), Duration::from_millis(500));
    let slow = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.execute("while(true){}").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let quick = coordinator.execute("2 ** 10").await.unwrap();
    assert_eq!(quick.result, json!(1024));
    assert!(started.elapsed() < Duration::from_millis(400));
    assert!(slow.await.unwrap().is_err());
}
