//! Message-level error types and the cross-crate error taxonomy.

use thiserror::Error;

/// Errors that can occur in the message core.
#[derive(Debug, Error)]
pub enum MessageError {
    /// A metadata map exceeded one of its configured bounds.
    #[error("metadata limit exceeded: {reason}")]
    MetadataLimit {
        /// Which bound was violated.
        reason: String,
    },

    /// A source returned metadata that is not a string-to-string map.
    #[error("metadata must be string map: {0}")]
    InvalidMetadata(String),

    /// Reading metadata or data from the source failed.
    #[error("source read failed: {0}")]
    SourceRead(String),

    /// Acknowledging or rejecting the message at the source failed.
    #[error("source settle failed: {0}")]
    SourceSettle(String),

    /// The source does not support replying.
    #[error("reply not supported by this source")]
    ReplyUnsupported,

    /// Replying at the source failed.
    #[error("reply failed: {0}")]
    ReplyFailed(String),
}

impl MessageError {
    /// The taxonomy category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MetadataLimit { .. } => ErrorCategory::Validation,
            Self::InvalidMetadata(_) | Self::SourceRead(_) => ErrorCategory::MessageRead,
            Self::SourceSettle(_) | Self::ReplyFailed(_) | Self::ReplyUnsupported => {
                ErrorCategory::FatalInternal
            },
        }
    }
}

/// Result type for message-core operations.
pub type MessageResult<T> = Result<T, MessageError>;

/// Domain-wide error classification used by the dispatcher to decide
/// whether a failed message may be redelivered.
///
/// Every error type in the workspace exposes a `category()` accessor
/// returning one of these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid configuration, surfaced at startup only.
    Config,
    /// A security or schema check failed before any side effect.
    Validation,
    /// A deadline expired.
    Timeout,
    /// A codec failed to decode bytes.
    Decode,
    /// A codec failed to encode a message.
    Encode,
    /// A source-side read failed.
    MessageRead,
    /// A child process, WASM module, plugin, or expression returned an error.
    RunnerExec,
    /// A configured output cap was breached.
    OutputLimit,
    /// A plugin has not reported `READY`.
    PluginNotReady,
    /// A one-shot plugin RPC failed.
    RpcFailed,
    /// A plugin stream broke.
    StreamFailed,
    /// Bug class; naks and propagates upward.
    FatalInternal,
}

impl ErrorCategory {
    /// Whether a higher layer may retry delivery after this failure.
    #[must_use]
    pub fn retriable(self) -> bool {
        matches!(self, Self::Timeout | Self::RpcFailed | Self::StreamFailed)
    }

    /// Stable lowercase tag for log fields and error surfaces.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config_error",
            Self::Validation => "validation_error",
            Self::Timeout => "timeout",
            Self::Decode => "decode_error",
            Self::Encode => "encode_error",
            Self::MessageRead => "message_read_error",
            Self::RunnerExec => "runner_exec_error",
            Self::OutputLimit => "output_limit_exceeded",
            Self::PluginNotReady => "plugin_not_ready",
            Self::RpcFailed => "rpc_failed",
            Self::StreamFailed => "stream_failed",
            Self::FatalInternal => "fatal_internal",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_categories() {
        assert!(ErrorCategory::Timeout.retriable());
        assert!(ErrorCategory::RpcFailed.retriable());
        assert!(ErrorCategory::StreamFailed.retriable());
        assert!(!ErrorCategory::Validation.retriable());
        assert!(!ErrorCategory::Decode.retriable());
        assert!(!ErrorCategory::FatalInternal.retriable());
    }

    #[test]
    fn test_category_tags() {
        assert_eq!(ErrorCategory::Validation.as_str(), "validation_error");
        assert_eq!(ErrorCategory::OutputLimit.as_str(), "output_limit_exceeded");
    }
}
