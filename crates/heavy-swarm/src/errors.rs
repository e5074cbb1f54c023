//! Error taxonomy for workers and the orchestration layer.
//!
//! Two enums cover the whole crate:
//!
//! | Type          | Raised by                         | Surfaces to caller?        |
//! |---------------|-----------------------------------|----------------------------|
//! | `WorkerError` | `Worker::run`, `WorkerFactory`    | recorded per slot          |
//! | `HeavyError`  | config loading, orchestration     | only `Configuration` / IO  |
//!
//! Per-slot failures are never thrown past the executor; they become
//! `WorkerResult`s with status `error` or `timeout`.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification used by retry sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    /// Network hiccup, 5xx, rate limit, garbled output. Worth another attempt.
    Transient,
    /// Missing credentials, missing binary, failed cleanup. Retrying won't help.
    Permanent,
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure of a single worker call or worker construction.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The remote inference call failed (network, HTTP status, backend crash).
    #[error("Inference failure: {0}")]
    Inference(String),

    /// The CLI subprocess could not be spawned or exited abnormally.
    #[error("Worker process failed: {0}")]
    Process(String),

    /// The worker produced output that could not be interpreted.
    #[error("Parse failure: {0}")]
    Parse(String),

    /// The worker cannot be built: missing credentials, CLI not installed,
    /// unreachable endpoint.
    #[error("Worker unavailable: {0}")]
    Unavailable(String),

    /// The reset hook failed while returning the worker to the pool.
    #[error("Worker cleanup failed: {0}")]
    Cleanup(String),
}

impl WorkerError {
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Inference(_) | Self::Process(_) | Self::Parse(_) => RetryCategory::Transient,
            Self::Unavailable(_) | Self::Cleanup(_) => RetryCategory::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.retry_category() == RetryCategory::Transient
    }
}

/// Orchestration-level error taxonomy.
#[derive(Debug, Error)]
pub enum HeavyError {
    /// Invalid or missing configuration. Fatal; aborts before any worker runs.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The decomposition worker could not produce a usable subtask list.
    /// Recovered internally via the template fallback.
    #[error("Decomposition failure: {0}")]
    Decomposition(String),

    /// A worker slot failed. Recorded as an `error` result, never thrown.
    #[error("Worker {index} failed: {source}")]
    Worker {
        index: usize,
        #[source]
        source: WorkerError,
    },

    /// A worker slot did not finish before the batch deadline.
    #[error("Worker {index} timed out after {}s", after.as_secs())]
    Timeout { index: usize, after: Duration },

    /// The synthesis call failed. Recovered via concatenation.
    #[error("Synthesis failure: {0}")]
    Synthesis(String),

    /// Pool bookkeeping disagreed with itself. Logged; the pool drops the
    /// offending entry.
    #[error("Pool consistency error: {0}")]
    PoolConsistency(String),

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl HeavyError {
    /// Build a `Configuration` variant conveniently.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns `true` for the variants that must reach the top-level caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Io(_) | Self::ConfigParse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_failure_is_transient() {
        let err = WorkerError::Inference("502 bad gateway".into());
        assert!(err.is_transient());
        assert_eq!(err.retry_category(), RetryCategory::Transient);
    }

    #[test]
    fn unavailable_is_permanent() {
        let err = WorkerError::Unavailable("claude not found".into());
        assert!(!err.is_transient());
    }

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(HeavyError::config("missing provider").is_fatal());
        assert!(!HeavyError::Synthesis("boom".into()).is_fatal());
        assert!(!HeavyError::Timeout {
            index: 2,
            after: Duration::from_secs(5)
        }
        .is_fatal());
    }

    #[test]
    fn worker_error_display_includes_index() {
        let err = HeavyError::Worker {
            index: 3,
            source: WorkerError::Process("exit 1".into()),
        };
        assert_eq!(err.to_string(), "Worker 3 failed: Worker process failed: exit 1");
    }
}
