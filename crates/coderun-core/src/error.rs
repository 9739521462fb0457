//! Error types for the coderun pipeline
//!
//! Each failure domain has its own enum so callers can tell a bad request
//! from a faulting snippet from an unreachable backend. The crate-level
//! [`Error`] wraps them all; fallible pipeline operations return
//! [`Result<T>`].

use thiserror::Error;

/// The submitted request did not carry a usable snippet.
///
/// Raised before fingerprinting; never recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputFault {
    #[error("Invalid code: missing `code` field")]
    Missing,

    #[error("Invalid code: expected a string, found {0}")]
    NotText(&'static str),

    #[error("Invalid code: snippet is empty")]
    Empty,
}

/// The snippet itself failed: it did not parse, raised an error, ran out of
/// time, or tripped a resource limit.
///
/// The `Display` form is what the caller sees and what the ledger stores.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionFault {
    #[error("SyntaxError: {0}")]
    Syntax(String),

    #[error("ReferenceError: {0}")]
    Reference(String),

    #[error("TypeError: {0}")]
    Type(String),

    #[error("RangeError: {0}")]
    Range(String),

    /// A value raised with `throw`; carries its message verbatim
    #[error("{0}")]
    Thrown(String),

    #[error("Script execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// The sandbox could not run the snippet at all (worker panicked, etc.)
    #[error("Sandbox failure: {0}")]
    Internal(String),
}

impl ExecutionFault {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionFault::Timeout { .. })
    }
}

/// Result cache backend failures. Never fatal for a request.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache entry could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Execution ledger failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger backend unavailable: {0}")]
    Unavailable(String),

    /// A record with both or neither of result/error populated
    #[error("invalid execution record: {0}")]
    InvalidRecord(String),

    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Input(#[from] InputFault),

    #[error(transparent)]
    Execution(#[from] ExecutionFault),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type alias for coderun operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_the_limit() {
        let fault = ExecutionFault::Timeout { timeout_ms: 1000 };
        assert_eq!(
            fault.to_string(),
            "Script execution timed out after 1000ms"
        );
        assert!(fault.is_timeout());
    }

    #[test]
    fn test_thrown_message_is_verbatim() {
        let fault = ExecutionFault::Thrown("boom".into());
        assert_eq!(fault.to_string(), "boom");
        assert!(!fault.is_timeout());
    }

    #[test]
    fn test_wrapped_errors_keep_their_message() {
        let err: Error = InputFault::Empty.into();
        assert_eq!(err.to_string(), "Invalid code: snippet is empty");

        let err: Error = ExecutionFault::Reference("x is not defined".into()).into();
        assert_eq!(err.to_string(), "ReferenceError: x is not defined");
    }
}
