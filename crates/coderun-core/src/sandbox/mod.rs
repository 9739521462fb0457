//! Sandboxed snippet evaluation
//!
//! [`SandboxExecutor`] is the seam the coordinator depends on.
//! [`InterpreterSandbox`] implements it with a restricted JavaScript-flavoured
//! interpreter that has no filesystem, network, environment or clock access.
//! Each run gets a fresh heap and scope chain on its own worker thread.
//!
//! Pipeline: source → [`tokenizer`] → [`parser`] → [`interpreter`] → JSON.

pub mod ast;
mod builtins;
pub mod console;
pub mod interpreter;
pub mod parser;
pub mod tokenizer;
pub mod value;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ExecutionFault;

pub use console::{CapturedConsole, Console, ConsoleLine, LogLevel};
use interpreter::EvalContext;

/// Default wall-clock bound for one evaluation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Worker threads get a large stack; recursion is bounded separately
const WORKER_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Extra time the host waits past the deadline before abandoning the worker
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

/// Per-evaluation resource bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    pub max_call_depth: usize,
    /// Elements per array or object, bytes per string
    pub max_collection_len: usize,
    /// Total arrays, objects, closures and elements allocated in one run,
    /// plus one unit per 16 bytes of string data built
    pub max_heap_units: usize,
    pub max_console_lines: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_call_depth: 256,
            max_collection_len: 1_000_000,
            max_heap_units: 4_000_000,
            max_console_lines: 1000,
        }
    }
}

/// Runs untrusted snippets under a wall-clock bound.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Evaluate `code` and return its completion value as JSON.
    ///
    /// Must return within roughly `timeout` whatever the snippet does.
    async fn run(
        &self,
        code: &str,
        timeout: Duration,
        console: Arc<dyn Console>,
    ) -> Result<serde_json::Value, ExecutionFault>;

    fn name(&self) -> &'static str;
}

/// Sets the worker's cancel flag when the waiting future goes away
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// [`SandboxExecutor`] backed by the built-in interpreter
#[derive(Debug, Clone, Default)]
pub struct InterpreterSandbox {
    limits: SandboxLimits,
}

impl InterpreterSandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl SandboxExecutor for InterpreterSandbox {
    async fn run(
        &self,
        code: &str,
        timeout: Duration,
        console: Arc<dyn Console>,
    ) -> Result<serde_json::Value, ExecutionFault> {
        let timeout_ms = timeout.as_millis() as u64;
        let cancel = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(Arc::clone(&cancel));

        let ctx = EvalContext {
            limits: self.limits.clone(),
            deadline: Instant::now() + timeout,
            timeout_ms,
            cancel,
            console,
        };
        let source = code.to_owned();
        let (tx, rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("coderun-sandbox".into())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    interpreter::evaluate(&source, ctx)
                }))
                .unwrap_or_else(|_| {
                    Err(ExecutionFault::Internal("evaluation panicked".into()))
                });
                // The receiver is gone if the host already gave up
                let _ = tx.send(outcome);
            })
            .map_err(|e| ExecutionFault::Internal(format!("failed to start worker: {}", e)))?;

        match tokio::time::timeout(timeout + TIMEOUT_GRACE, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ExecutionFault::Internal(
                "worker exited without a result".into(),
            )),
            Err(_) => {
                tracing::warn!(timeout_ms, "sandbox worker missed its deadline, abandoning it");
                Err(ExecutionFault::Timeout { timeout_ms })
            }
        }
    }

    fn name(&self) -> &'static str {
        "interpreter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn console() -> Arc<dyn Console> {
        Arc::new(CapturedConsole::new(None))
    }

    #[tokio::test]
    async fn test_one_plus_one() {
        let sandbox = InterpreterSandbox::default();
        let value = sandbox.run("1+1", DEFAULT_TIMEOUT, console()).await.unwrap();
        assert_eq!(value, json!(2));
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out_within_bound() {
        let sandbox = InterpreterSandbox::default();
        let timeout = Duration::from_millis(100);
        let started = Instant::now();
        let fault = sandbox
            .run("while(true){}", timeout, console())
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert_eq!(fault, ExecutionFault::Timeout { timeout_ms: 100 });
        assert_eq!(fault.to_string(), "Script execution timed out after 100ms");
        assert!(elapsed < timeout + TIMEOUT_GRACE + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_recursive_timeout() {
        let sandbox = InterpreterSandbox::default();
        let fault = sandbox
            .run(
                "function spin(n) { if (n > 100) return 0; return spin(n + 1) + spin(n + 1) } spin(0)",
                Duration::from_millis(100),
                console(),
            )
            .await
            .unwrap_err();
        assert!(fault.is_timeout());
    }

    #[tokio::test]
    async fn test_syntax_error() {
        let sandbox = InterpreterSandbox::default();
        let fault = sandbox.run("1 +* 2", DEFAULT_TIMEOUT, console()).await.unwrap_err();
        assert!(matches!(fault, ExecutionFault::Syntax(_)));
    }

    #[tokio::test]
    async fn test_reference_error() {
        let sandbox = InterpreterSandbox::default();
        let fault = sandbox.run("require('fs')", DEFAULT_TIMEOUT, console()).await.unwrap_err();
        assert_eq!(fault.to_string(), "ReferenceError: require is not defined");
    }

    #[tokio::test]
    async fn test_thrown_error() {
        let sandbox = InterpreterSandbox::default();
        let fault = sandbox
            .run("throw new Error('nope')", DEFAULT_TIMEOUT, console())
            .await
            .unwrap_err();
        assert_eq!(fault.to_string(), "nope");
    }

    #[tokio::test]
    async fn test_console_is_per_invocation() {
        let sandbox = InterpreterSandbox::default();
        let first = Arc::new(CapturedConsole::new(None));
        let second = Arc::new(CapturedConsole::new(None));
        sandbox
            .run("console.log('a')", DEFAULT_TIMEOUT, first.clone())
            .await
            .unwrap();
        sandbox
            .run("console.log('b'); console.log('c')", DEFAULT_TIMEOUT, second.clone())
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
        assert_eq!(second.lines()[1].text, "c");
    }

    #[tokio::test]
    async fn test_no_state_leaks_between_runs() {
        let sandbox = InterpreterSandbox::default();
        sandbox
            .run("var leaked = 1; Math.PI = 3", DEFAULT_TIMEOUT, console())
            .await
            .unwrap();
        let fault = sandbox.run("leaked", DEFAULT_TIMEOUT, console()).await.unwrap_err();
        assert!(matches!(fault, ExecutionFault::Reference(_)));
        let pi = sandbox.run("Math.PI", DEFAULT_TIMEOUT, console()).await.unwrap();
        assert_eq!(pi, json!(std::f64::consts::PI));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_are_independent() {
        let sandbox = Arc::new(InterpreterSandbox::default());
        let mut handles = Vec::new();
        for i in 0..8 {
            let sandbox = Arc::clone(&sandbox);
            handles.push(tokio::spawn(async move {
                let code = format!("let x = {}; x * x", i);
                sandbox.run(&code, DEFAULT_TIMEOUT, console()).await
            }));
        }
        // One runaway snippet must not delay the others
        let runaway = {
            let sandbox = Arc::clone(&sandbox);
            tokio::spawn(async move {
                sandbox
                    .run("for(;;){}", Duration::from_millis(200), console())
                    .await
            })
        };
        for (i, handle) in handles.into_iter().enumerate() {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value, json!(i * i));
        }
        assert!(runaway.await.unwrap().unwrap_err().is_timeout());
    }

    #[test]
    fn test_limits_deserialize_with_defaults() {
        let limits: SandboxLimits = serde_json::from_str(r#"{"max_call_depth": 10}"#).unwrap();
        assert_eq!(limits.max_call_depth, 10);
        assert_eq!(limits.max_console_lines, 1000);
    }
}
