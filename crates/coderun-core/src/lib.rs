//! coderun core - fingerprinted, cached, sandboxed snippet execution
//!
//! Accepts short JavaScript-flavoured snippets, evaluates them in an
//! isolated interpreter under a wall-clock bound, caches successful results
//! by content fingerprint, and records every evaluation attempt.
//!
//! # Architecture
//!
//! ```text
//! code → Fingerprint → ResultCache ──hit──────────────────────→ {result, cached: true}
//!                          │
//!                         miss → SingleFlight → SandboxExecutor
//!                                                   │
//!                                     ResultCache (on success) + ExecutionLedger
//!                                                   │
//!                                                   └──→ {result, cached: false} | fault
//! ```
//!
//! # Guarantees
//!
//! - **Deterministic keys**: identical bytes always share a fingerprint
//! - **Bounded**: every evaluation ends within its timeout
//! - **Isolated**: no state survives from one evaluation to the next
//! - **Auditable**: one ledger record per evaluation, never per cache hit

pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod sandbox;
pub mod single_flight;
pub mod stats;

pub use api::{Api, ApiResponse};
pub use cache::{CacheBackend, ResultCache};
pub use config::Config;
pub use coordinator::{ExecutionCoordinator, ExecutionOutcome, HealthReport};
pub use error::{Error, ExecutionFault, InputFault, Result};
pub use fingerprint::{fingerprint, Fingerprint};
pub use ledger::{ExecutionLedger, ExecutionRecord, NewExecution};
pub use sandbox::{InterpreterSandbox, SandboxExecutor, SandboxLimits};
pub use stats::StatsSnapshot;
