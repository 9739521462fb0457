//! Integration tests for the coderun CLI
//!
//! These tests invoke the actual coderun binary and verify:
//! - Exit codes (0 = success, 1 = fault or unhealthy, 2 = error)
//! - stdout output, plain and JSON
//! - Cache behaviour across snippets in one invocation
//! - History persisted through a SQLite ledger

use std::path::{Path, PathBuf};
use std::process::Command;

// ── Helpers ───────────────────────────────────────────────

fn coderun_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_coderun"))
}

fn run_coderun(args: &[&str]) -> std::process::Output {
    Command::new(coderun_bin())
        .args(args)
        .env("NO_COLOR", "1")
        .env("RUST_LOG", "off")
        .env("CODERUN_CACHE", "memory")
        .env("CODERUN_LEDGER", "memory")
        .env_remove("CODERUN_TIMEOUT_MS")
        .env_remove("CODERUN_LEDGER_PATH")
        .output()
        .expect("failed to execute coderun")
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn json_lines(output: &std::process::Output) -> Vec<serde_json::Value> {
    stdout_of(output)
        .lines()
        .map(|line| serde_json::from_str(line).expect("each line should be JSON"))
        .collect()
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("temp path should be UTF-8")
}

// ── Version ───────────────────────────────────────────────

#[test]
fn test_version_command() {
    let output = run_coderun(&["version"]);
    assert!(output.status.success(), "version should exit 0");
    let stdout = stdout_of(&output);
    assert!(stdout.contains("coderun"), "should contain 'coderun'");
    assert!(
        stdout.contains(env!("CARGO_PKG_VERSION")),
        "should contain version"
    );
}

#[test]
fn test_version_flag() {
    let output = run_coderun(&["--version"]);
    assert!(output.status.success(), "--version should exit 0");
    assert!(stdout_of(&output).contains(env!("CARGO_PKG_VERSION")));
}

// ── Hash ──────────────────────────────────────────────────

#[test]
fn test_hash_is_sha256_hex() {
    let output = run_coderun(&["hash", "1+1"]);
    assert!(output.status.success());
    let stdout = stdout_of(&output);
    let hex = stdout.trim();
    assert_eq!(hex.len(), 64);
    assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));

    let again = run_coderun(&["hash", "1+1"]);
    assert_eq!(stdout_of(&again).trim(), hex, "hash should be deterministic");
    let other = run_coderun(&["hash", "1 + 1"]);
    assert_ne!(stdout_of(&other).trim(), hex);
}

// ── Execute ───────────────────────────────────────────────

#[test]
fn test_execute_json_reports_cache() {
    let output = run_coderun(&["execute", "--json", "1+1", "1+1"]);
    assert!(output.status.success(), "execute should exit 0");
    let lines = json_lines(&output);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], serde_json::json!({"result": 2, "cached": false}));
    assert_eq!(lines[1], serde_json::json!({"result": 2, "cached": true}));
}

#[test]
fn test_execute_plain_output() {
    let output = run_coderun(&["execute", "console.log('hello'); 'done'"]);
    assert!(output.status.success());
    let stdout = stdout_of(&output);
    assert!(stdout.contains("hello"), "should show console output");
    assert!(stdout.contains("\"done\""), "should show the result");
    assert!(stdout.contains("executed"));
}

#[test]
fn test_execute_fault_exits_1() {
    let output = run_coderun(&["execute", "--json", "undefinedVar"]);
    assert_eq!(output.status.code(), Some(1), "fault should exit 1");
    let lines = json_lines(&output);
    assert_eq!(
        lines[0]["error"],
        "ReferenceError: undefinedVar is not defined"
    );
}

#[test]
fn test_execute_timeout() {
    let output = run_coderun(&["execute", "--json", "--timeout-ms", "100", "while(true){}"]);
    assert_eq!(output.status.code(), Some(1));
    let lines = json_lines(&output);
    assert_eq!(lines[0]["error"], "Script execution timed out after 100ms");
}

#[test]
fn test_execute_empty_snippet_is_input_fault() {
    let output = run_coderun(&["execute", ""]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout_of(&output).contains("Invalid code"));
}

#[test]
fn test_execute_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snippet.js");
    std::fs::write(&path, "const xs = [1, 2, 3];\nxs.map(x => x * x)").unwrap();
    let output = run_coderun(&["execute", "--json", "--file", path_arg(&path)]);
    assert!(output.status.success());
    assert_eq!(json_lines(&output)[0]["result"], serde_json::json!([1, 4, 9]));
}

#[test]
fn test_execute_missing_file_exits_2() {
    let output = run_coderun(&["execute", "--file", "nonexistent.js"]);
    assert_eq!(output.status.code(), Some(2), "missing file should exit 2");
}

// ── Configuration ─────────────────────────────────────────

#[test]
fn test_missing_config_exits_2() {
    let output = run_coderun(&["--config", "nonexistent.json", "health"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error"), "should mention error");
}

#[test]
fn test_zero_timeout_rejected() {
    let output = run_coderun(&["execute", "--timeout-ms", "0", "1"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_config_file_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coderun.json");
    std::fs::write(&path, r#"{"sandbox": {"timeout_ms": 150}}"#).unwrap();
    let output = run_coderun(&[
        "--config",
        path_arg(&path),
        "execute",
        "--json",
        "for(;;){}",
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(
        json_lines(&output)[0]["error"],
        "Script execution timed out after 150ms"
    );
}

// ── History / Stats / Health ──────────────────────────────

#[test]
fn test_history_and_stats_with_sqlite_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("ledger.db");
    let db = path_arg(&db);

    let run = run_coderun(&["--ledger", db, "execute", "6*7", "nope"]);
    assert_eq!(run.status.code(), Some(1));

    let history = run_coderun(&["--ledger", db, "history", "--json"]);
    assert!(history.status.success());
    let body = &json_lines(&history)[0];
    let executions = body["executions"].as_array().unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0]["code"], "nope");
    assert_eq!(executions[1]["result"], 42);
    assert!(executions[1]["code_hash"].as_str().unwrap().len() == 64);

    let limited = run_coderun(&["--ledger", db, "history", "--json", "--limit", "1"]);
    assert_eq!(json_lines(&limited)[0]["executions"].as_array().unwrap().len(), 1);

    let stats = run_coderun(&["--ledger", db, "stats", "--json"]);
    assert!(stats.status.success());
    let stats = &json_lines(&stats)[0]["stats"];
    assert_eq!(stats["total_executions"], 2);
    assert_eq!(stats["error_count"], 1);

    let plain = run_coderun(&["--ledger", db, "stats"]);
    assert!(plain.status.success());
    assert!(stdout_of(&plain).contains("error rate: 50.0%"));
}

#[test]
fn test_history_empty() {
    let output = run_coderun(&["history"]);
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("No executions recorded"));
}

#[test]
fn test_health_with_local_backends() {
    let output = run_coderun(&["health"]);
    assert!(output.status.success(), "memory backends should be healthy");
    assert!(stdout_of(&output).contains("healthy"));
}

#[test]
fn test_health_with_unreachable_redis() {
    let output = Command::new(coderun_bin())
        .args(["health"])
        .env("NO_COLOR", "1")
        .env("RUST_LOG", "off")
        .env("CODERUN_CACHE", "redis")
        .env("REDIS_HOST", "127.0.0.1")
        .env("REDIS_PORT", "1")
        .env("CODERUN_LEDGER", "memory")
        .output()
        .expect("failed to execute coderun");
    assert_eq!(output.status.code(), Some(1), "unhealthy should exit 1");
    assert!(stdout_of(&output).contains("unhealthy"));
}
