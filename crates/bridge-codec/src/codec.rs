//! The codec strategy trait and the name registry.

use std::io::BufRead;
use std::sync::Arc;

use bridge_message::{Envelope, Metadata};
use bytes::Bytes;

use crate::cbor::CborCodec;
use crate::error::{CodecError, CodecResult};
use crate::frame::CliFrameCodec;
use crate::json::JsonCodec;

/// Hard cap on a single message payload, in bytes.
pub const MAX_DATA_SIZE: usize = 10 * 1024 * 1024;

/// Converts between an `(metadata, data)` pair and a byte string.
///
/// Implementations are stateless and shareable across workers.
pub trait MessageCodec: Send + Sync {
    /// Encode a generic value (for runner outputs that produce structured
    /// data rather than a full message).
    fn encode_value(&self, value: &serde_json::Value) -> CodecResult<Bytes>;

    /// Encode a message's effective metadata and data.
    fn encode(&self, metadata: &Metadata, data: &[u8]) -> CodecResult<Bytes>;

    /// Decode one message from a byte string.
    fn decode(&self, bytes: &[u8]) -> CodecResult<Envelope>;

    /// Decode a lazy, finite-or-infinite, non-restartable sequence of
    /// messages from a reader. Each item carries either a message or an
    /// error; a clean end-of-stream ends the sequence silently.
    fn decode_stream<'r>(
        &self,
        reader: Box<dyn BufRead + Send + 'r>,
    ) -> Box<dyn Iterator<Item = CodecResult<Envelope>> + Send + 'r>;
}

/// Look up a codec by its lowercase token: `json`, `cbor`, or `cli`
/// (alias `cliformat`).
///
/// # Errors
///
/// Returns [`CodecError::UnknownEncoder`] for any other token; this is a
/// configuration error surfaced at startup.
pub fn codec_for(name: &str) -> CodecResult<Arc<dyn MessageCodec>> {
    match name.to_ascii_lowercase().as_str() {
        "json" => Ok(Arc::new(JsonCodec::default())),
        "cbor" => Ok(Arc::new(CborCodec::default())),
        "cli" | "cliformat" => Ok(Arc::new(CliFrameCodec::default())),
        other => Err(CodecError::UnknownEncoder(other.to_string())),
    }
}
