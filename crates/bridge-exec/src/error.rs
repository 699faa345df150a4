//! Executor error types.

use bridge_message::ErrorCategory;
use thiserror::Error;

/// Errors surfaced by subprocess execution.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Invalid executor configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A pre-spawn security check failed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The child process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(std::io::Error),

    /// The child did not finish within the configured timeout.
    #[error("child timed out after {timeout_ms} ms")]
    Timeout {
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// The child produced more stdout than permitted.
    #[error("child output exceeded {limit} bytes")]
    OutputLimitExceeded {
        /// Configured cap.
        limit: usize,
    },

    /// The child exited with a non-zero status.
    #[error("child exited with status {code}: {stderr_tail}")]
    NonZeroExit {
        /// Exit code (-1 when terminated by signal).
        code: i32,
        /// Trailing stderr output, bounded.
        stderr_tail: String,
    },

    /// The executor was closed while the child was running.
    #[error("execution cancelled")]
    Cancelled,

    /// An I/O failure on one of the child's pipes.
    #[error("child io failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// The taxonomy category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Config,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::OutputLimitExceeded { .. } => ErrorCategory::OutputLimit,
            Self::Spawn(_) | Self::NonZeroExit { .. } | Self::Cancelled | Self::Io(_) => {
                ErrorCategory::RunnerExec
            },
        }
    }
}

/// Result type for executor operations.
pub type ExecResult<T> = Result<T, ExecError>;
