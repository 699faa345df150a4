//! Virtual filesystem error types.

use thiserror::Error;

/// Errors surfaced by the sandboxed filesystem view.
#[derive(Debug, Error)]
pub enum VfsError {
    /// The path escapes the sandbox or misses the whitelist.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A write was attempted through a read-only view.
    #[error("write not permitted")]
    WriteNotPermitted,

    /// The file does not exist inside the sandbox.
    #[error("not found: {0}")]
    NotFound(String),

    /// An underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sandbox operations.
pub type VfsResult<T> = Result<T, VfsError>;
