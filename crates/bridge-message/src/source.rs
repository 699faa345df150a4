//! Source message contract and the owned envelope form.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{MessageError, MessageResult};
use crate::metadata::Metadata;

/// Payload of a reply sent back through an RPC-style source.
#[derive(Debug, Clone, Default)]
pub struct ReplyData {
    /// Reply body.
    pub data: Bytes,
    /// Reply metadata (headers, for HTTP-like sources).
    pub metadata: Metadata,
    /// Optional status code for sources that carry one.
    pub status_code: Option<u16>,
}

/// A single ingested event as seen by the pipeline: an immutable read-only
/// view plus delivery callbacks.
///
/// Implementations live in source connectors. `metadata` and `data` are
/// idempotent and SHOULD cache; `ack` and `nak` have at-most-once
/// meaningful effect (the pipeline additionally guards this on its side).
#[async_trait]
pub trait SourceMessage: Send + Sync {
    /// Opaque identifier, used for logging and correlation only.
    fn id(&self) -> &[u8];

    /// Read the source metadata.
    async fn metadata(&self) -> MessageResult<Metadata>;

    /// Read the source payload.
    async fn data(&self) -> MessageResult<Bytes>;

    /// Confirm delivery upstream.
    async fn ack(&self) -> MessageResult<()>;

    /// Reject delivery upstream.
    async fn nak(&self) -> MessageResult<()>;

    /// Send a reply through the source's reply channel, when it has one.
    ///
    /// # Errors
    ///
    /// The default implementation returns [`MessageError::ReplyUnsupported`].
    async fn reply(&self, _reply: ReplyData) -> MessageResult<()> {
        Err(MessageError::ReplyUnsupported)
    }
}

/// An owned `(metadata, data)` pair.
///
/// Codecs decode wire bytes into envelopes and plugin responses are copied
/// into envelopes on handoff, so nothing downstream holds references into
/// transport buffers. An envelope acts as a [`SourceMessage`] with no
/// upstream delivery to settle: ack and nak succeed without effect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    /// Decoded metadata.
    pub metadata: Metadata,
    /// Decoded payload.
    pub data: Bytes,
}

impl Envelope {
    /// Create an envelope from its parts.
    #[must_use]
    pub fn new(metadata: Metadata, data: Bytes) -> Self {
        Self { metadata, data }
    }
}

#[async_trait]
impl SourceMessage for Envelope {
    fn id(&self) -> &[u8] {
        &[]
    }

    async fn metadata(&self) -> MessageResult<Metadata> {
        Ok(self.metadata.clone())
    }

    async fn data(&self) -> MessageResult<Bytes> {
        Ok(self.data.clone())
    }

    async fn ack(&self) -> MessageResult<()> {
        Ok(())
    }

    async fn nak(&self) -> MessageResult<()> {
        Ok(())
    }
}
