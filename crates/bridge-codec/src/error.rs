//! Codec error types.

use bridge_message::{ErrorCategory, MessageError};
use thiserror::Error;

/// Errors that can occur while encoding or decoding messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The requested codec token is not registered.
    #[error("unknown encoder type: {0}")]
    UnknownEncoder(String),

    /// The input bytes could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The value or message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// A frame did not begin with the expected magic marker.
    #[error("invalid frame marker")]
    InvalidMarker,

    /// A frame was truncated mid-length or mid-payload.
    #[error("unexpected end of stream inside a frame")]
    UnexpectedEof,

    /// A key, value, or payload exceeds the wire format's length fields.
    #[error("{what} of {len} bytes exceeds the frame format limit")]
    Oversize {
        /// What was being encoded.
        what: &'static str,
        /// Its size in bytes.
        len: usize,
    },

    /// A single message exceeds the per-message size cap.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge {
        /// Observed size.
        size: usize,
        /// Configured cap.
        limit: usize,
    },

    /// A stream produced more messages than permitted.
    #[error("stream exceeded {limit} messages")]
    TooManyMessages {
        /// Configured cap.
        limit: usize,
    },

    /// A document nests deeper than permitted.
    #[error("value nesting exceeds depth {limit}")]
    DepthExceeded {
        /// Configured cap.
        limit: usize,
    },

    /// An array is longer than permitted.
    #[error("array length {len} exceeds {limit}")]
    ArrayTooLong {
        /// Observed length.
        len: usize,
        /// Configured cap.
        limit: usize,
    },

    /// The codec cannot represent this value.
    #[error("unsupported value: {0}")]
    Unsupported(String),

    /// Decoded metadata violated a message-core bound.
    #[error(transparent)]
    Metadata(#[from] MessageError),

    /// An I/O error from the underlying reader.
    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// The taxonomy category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownEncoder(_) => ErrorCategory::Config,
            Self::Encode(_) | Self::Oversize { .. } | Self::Unsupported(_) => ErrorCategory::Encode,
            Self::MessageTooLarge { .. } | Self::TooManyMessages { .. } => {
                ErrorCategory::OutputLimit
            },
            Self::Metadata(e) => e.category(),
            Self::Io(_) => ErrorCategory::StreamFailed,
            _ => ErrorCategory::Decode,
        }
    }
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
