//! Runner error types.

use bridge_codec::CodecError;
use bridge_exec::ExecError;
use bridge_message::{ErrorCategory, MessageError};
use thiserror::Error;

/// Errors surfaced by runner execution.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Invalid runner configuration, surfaced at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A pre-execution check failed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The per-message deadline expired.
    #[error("runner timed out after {timeout_ms} ms")]
    Timeout {
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// A codec failed at the process boundary.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Reading the message from its source failed.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// The subprocess executor failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// The WASM module trapped or the sandbox could not be built.
    #[error("wasm execution failed: {0}")]
    Wasm(String),

    /// An expression engine returned an error or panicked.
    #[error("expression evaluation failed: {0}")]
    Expression(String),

    /// The LLM endpoint returned an error.
    #[error("llm request failed: {0}")]
    Llm(String),

    /// A plugin has not reported `READY`.
    #[error("plugin not ready: {0}")]
    PluginNotReady(String),

    /// A plugin RPC failed.
    #[error("plugin rpc failed: {0}")]
    Rpc(String),

    /// The runner instance was marked unhealthy; close and rebuild it.
    #[error("runner is unhealthy, close and rebuild")]
    Unhealthy,

    /// Bug class.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RunnerError {
    /// The taxonomy category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Config,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Codec(e) => e.category(),
            Self::Message(e) => e.category(),
            Self::Exec(e) => e.category(),
            Self::Wasm(_) | Self::Expression(_) | Self::Llm(_) => ErrorCategory::RunnerExec,
            Self::PluginNotReady(_) => ErrorCategory::PluginNotReady,
            Self::Rpc(_) => ErrorCategory::RpcFailed,
            Self::Unhealthy | Self::Internal(_) => ErrorCategory::FatalInternal,
        }
    }
}

/// Result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;
