//! Identity codec: raw payload passthrough.
//!
//! Used by sources and targets that carry their own wire format; metadata
//! is not representable on the wire, so encoding drops it and decoding
//! yields an empty map.

use std::io::BufRead;

use bridge_message::{Envelope, Metadata};
use bytes::Bytes;

use crate::codec::MessageCodec;
use crate::error::{CodecError, CodecResult};

/// Passthrough codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl MessageCodec for IdentityCodec {
    fn encode_value(&self, value: &serde_json::Value) -> CodecResult<Bytes> {
        match value {
            serde_json::Value::String(s) => Ok(Bytes::from(s.clone().into_bytes())),
            other => Err(CodecError::Unsupported(format!(
                "identity codec cannot encode {other}"
            ))),
        }
    }

    fn encode(&self, _metadata: &Metadata, data: &[u8]) -> CodecResult<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Envelope> {
        Ok(Envelope::new(Metadata::new(), Bytes::copy_from_slice(bytes)))
    }

    fn decode_stream<'r>(
        &self,
        mut reader: Box<dyn BufRead + Send + 'r>,
    ) -> Box<dyn Iterator<Item = CodecResult<Envelope>> + Send + 'r> {
        // The whole stream is one opaque payload.
        let mut buf = Vec::new();
        let result = std::io::Read::read_to_end(&mut reader, &mut buf)
            .map(|_| Envelope::new(Metadata::new(), Bytes::from(buf)))
            .map_err(CodecError::Io);
        Box::new(std::iter::once(result))
    }
}
