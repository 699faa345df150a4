//! Plugin error types.

use bridge_message::ErrorCategory;
use thiserror::Error;

/// Errors surfaced by the plugin manager and plugin lifecycle.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Invalid plugin configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A plugin with this name is already registered.
    #[error("duplicate plugin name: {0}")]
    DuplicateName(String),

    /// A pre-spawn security check failed.
    #[error("security validation failed: {0}")]
    SecurityValidation(String),

    /// The configured transport protocol is not supported.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The plugin executable could not be started.
    #[error("spawn failed: {0}")]
    Spawn(std::io::Error),

    /// The host could not establish the gRPC connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The plugin never reported `READY`.
    #[error("plugin not ready: {0}")]
    NotReady(String),

    /// A one-shot RPC failed.
    #[error("rpc failed: {0}")]
    Rpc(tonic::Status),

    /// The source stream broke.
    #[error("stream failed: {0}")]
    Stream(String),

    /// The plugin returned a message the host cannot represent.
    #[error("invalid plugin message: {0}")]
    InvalidMessage(String),
}

impl PluginError {
    /// The taxonomy category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::DuplicateName(_) | Self::UnsupportedProtocol(_) => {
                ErrorCategory::Config
            },
            Self::SecurityValidation(_) => ErrorCategory::Validation,
            Self::Spawn(_) => ErrorCategory::RunnerExec,
            Self::Connect(_) | Self::NotReady(_) => ErrorCategory::PluginNotReady,
            Self::Rpc(_) => ErrorCategory::RpcFailed,
            Self::Stream(_) => ErrorCategory::StreamFailed,
            Self::InvalidMessage(_) => ErrorCategory::Decode,
        }
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;
