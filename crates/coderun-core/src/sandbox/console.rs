//! Console capability handed to each snippet evaluation

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// Tracing target for snippet console output
pub const SNIPPET_LOG_TARGET: &str = "coderun::snippet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// Sink for `console.*` calls made by a snippet.
///
/// Called from the evaluation worker thread, hence `Send + Sync`.
pub trait Console: Send + Sync {
    fn log(&self, level: LogLevel, line: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub level: LogLevel,
    pub text: String,
}

/// Records console lines in order and mirrors them to `tracing`.
pub struct CapturedConsole {
    fingerprint: Option<Fingerprint>,
    lines: Mutex<Vec<ConsoleLine>>,
}

impl CapturedConsole {
    pub fn new(fingerprint: Option<Fingerprint>) -> Self {
        Self {
            fingerprint,
            lines: Mutex::new(Vec::new()),
        }
    }

    /// Lines captured so far, oldest first
    pub fn lines(&self) -> Vec<ConsoleLine> {
        self.lines.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl Console for CapturedConsole {
    fn log(&self, level: LogLevel, line: &str) {
        let fingerprint = self
            .fingerprint
            .map(|fp| fp.to_hex())
            .unwrap_or_default();
        match level {
            LogLevel::Debug => {
                tracing::debug!(target: SNIPPET_LOG_TARGET, fingerprint = %fingerprint, "{}", line)
            }
            LogLevel::Info => {
                tracing::info!(target: SNIPPET_LOG_TARGET, fingerprint = %fingerprint, "{}", line)
            }
            LogLevel::Warn => {
                tracing::warn!(target: SNIPPET_LOG_TARGET, fingerprint = %fingerprint, "{}", line)
            }
            LogLevel::Error => {
                tracing::error!(target: SNIPPET_LOG_TARGET, fingerprint = %fingerprint, "{}", line)
            }
        }
        self.lines.lock().push(ConsoleLine {
            level,
            text: line.to_string(),
        });
    }
}
