//! The mutable per-pipeline-message object.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::MessageResult;
use crate::metadata::Metadata;
use crate::source::{Envelope, ReplyData, SourceMessage};

/// Delivery settlement state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// No terminal settlement yet.
    Pending,
    /// Delivery was confirmed upstream.
    Acked,
    /// Delivery was rejected upstream.
    Naked,
}

/// The message object shared along the pipeline.
///
/// Wraps a read-only source view and a mutable target overlay. The
/// *effective metadata view* is source metadata with target entries
/// overriding on key collision; the *effective data view* is the target
/// data once [`set_data`](Self::set_data) has been called, the source data
/// otherwise. Source reads are cached after the first success.
///
/// A message is owned by a single worker at a time; reads that fill caches
/// take `&mut self` and there is no internal synchronization.
pub struct RunnerMessage {
    source: Arc<dyn SourceMessage>,
    source_metadata: Option<Metadata>,
    source_data: Option<Bytes>,
    target_metadata: Metadata,
    target_data: Option<Bytes>,
    ack_state: AckState,
}

impl RunnerMessage {
    /// Wrap a source message. O(1); no source reads happen here.
    #[must_use]
    pub fn new(source: Arc<dyn SourceMessage>) -> Self {
        Self {
            source,
            source_metadata: None,
            source_data: None,
            target_metadata: Metadata::new(),
            target_data: None,
            ack_state: AckState::Pending,
        }
    }

    /// Opaque message identifier, delegated to the source.
    #[must_use]
    pub fn id(&self) -> &[u8] {
        self.source.id()
    }

    /// Current settlement state.
    #[must_use]
    pub fn ack_state(&self) -> AckState {
        self.ack_state
    }

    /// The effective metadata view: source metadata overlaid with target
    /// entries, target winning on collision.
    ///
    /// # Errors
    ///
    /// Propagates the source read error on the very first invocation only;
    /// the source view is cached after the first success.
    pub async fn metadata(&mut self) -> MessageResult<Metadata> {
        let source = self.source_metadata_cached().await?;
        let mut effective = source.clone();
        effective.merge(&self.target_metadata)?;
        Ok(effective)
    }

    /// The effective data view: target data when set, source data
    /// otherwise (cached after the first read).
    ///
    /// # Errors
    ///
    /// Propagates the source read error on the first source read only.
    pub async fn data(&mut self) -> MessageResult<Bytes> {
        if let Some(data) = &self.target_data {
            return Ok(data.clone());
        }
        if self.source_data.is_none() {
            self.source_data = Some(self.source.data().await?);
        }
        // Cache was just filled above.
        Ok(self.source_data.clone().unwrap_or_default())
    }

    /// Replace the target data. Stores the buffer by reference; the caller
    /// must not mutate it afterward.
    pub fn set_data(&mut self, data: Bytes) {
        self.target_data = Some(data);
    }

    /// Add a single entry to the target metadata overlay.
    ///
    /// # Errors
    ///
    /// Returns a metadata limit error when a bound is exceeded.
    pub fn add_metadata(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> MessageResult<()> {
        self.target_metadata.insert(key, value)
    }

    /// Merge entries into the target overlay. Incoming entries win over
    /// prior target entries; the target always wins over the source.
    ///
    /// # Errors
    ///
    /// Returns a metadata limit error when a bound is exceeded.
    pub fn merge_metadata(&mut self, metadata: &Metadata) -> MessageResult<()> {
        self.target_metadata.merge(metadata)
    }

    /// Replace data and overlay metadata from a decoded envelope. Used by
    /// runners that synthesize a replacement message from child output.
    ///
    /// # Errors
    ///
    /// Returns a metadata limit error when the overlay merge exceeds a
    /// bound.
    pub fn set_from_envelope(&mut self, envelope: Envelope) -> MessageResult<()> {
        self.target_metadata.merge(&envelope.metadata)?;
        self.target_data = Some(envelope.data);
        Ok(())
    }

    /// Confirm delivery. Only the first terminal transition reaches the
    /// source; every later ack or nak call returns `Ok(())` with no side
    /// effect.
    ///
    /// # Errors
    ///
    /// Propagates the source's ack failure. The message still counts as
    /// settled: the meaningful effect was attempted exactly once.
    pub async fn ack(&mut self) -> MessageResult<()> {
        if self.ack_state != AckState::Pending {
            return Ok(());
        }
        self.ack_state = AckState::Acked;
        self.source.ack().await
    }

    /// Reject delivery. Same settlement semantics as [`ack`](Self::ack).
    ///
    /// # Errors
    ///
    /// Propagates the source's nak failure.
    pub async fn nak(&mut self) -> MessageResult<()> {
        if self.ack_state != AckState::Pending {
            debug!("nak after settlement ignored");
            return Ok(());
        }
        self.ack_state = AckState::Naked;
        self.source.nak().await
    }

    /// Send a reply through the source's reply channel.
    ///
    /// # Errors
    ///
    /// Propagates the source's reply failure, or reply-unsupported for
    /// sources without a reply channel.
    pub async fn reply(&self, reply: ReplyData) -> MessageResult<()> {
        self.source.reply(reply).await
    }

    async fn source_metadata_cached(&mut self) -> MessageResult<&Metadata> {
        if self.source_metadata.is_none() {
            self.source_metadata = Some(self.source.metadata().await?);
        }
        Ok(self.source_metadata.get_or_insert_with(Metadata::new))
    }
}

impl std::fmt::Debug for RunnerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerMessage")
            .field("id", &self.source.id())
            .field("ack_state", &self.ack_state)
            .field("target_data_set", &self.target_data.is_some())
            .field("target_metadata_len", &self.target_metadata.len())
            .finish_non_exhaustive()
    }
}
