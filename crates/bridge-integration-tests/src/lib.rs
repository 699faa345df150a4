//! Shared fixtures for the workspace's end-to-end scenario tests.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;
use bridge_message::{Metadata, MessageResult, RunnerMessage, SourceMessage};
use bridge_runner::{RunnerResult, Target};
use bytes::Bytes;
use tokio::sync::Mutex;

/// Install a log subscriber honoring `RUST_LOG`. Safe to call from every
/// test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory source message with settlement counters.
pub struct TestSource {
    id: Vec<u8>,
    metadata: Metadata,
    data: Bytes,
    acks: AtomicUsize,
    naks: AtomicUsize,
}

impl TestSource {
    /// Build a source message from its parts.
    #[must_use]
    pub fn new(id: &str, metadata: Metadata, data: impl Into<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            id: id.as_bytes().to_vec(),
            metadata,
            data: data.into(),
            acks: AtomicUsize::new(0),
            naks: AtomicUsize::new(0),
        })
    }

    /// Number of acks delivered upstream.
    #[must_use]
    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    /// Number of naks delivered upstream.
    #[must_use]
    pub fn naks(&self) -> usize {
        self.naks.load(Ordering::SeqCst)
    }
}

/// Wrapper so callers can keep a handle on the source after handing the
/// boxed/Arc'd message off to a pipeline or runner (mirrors the orphan-rule
/// workaround used for `SharedSource` in `bridge-runner`'s own tests, since
/// `SourceMessage` can't be implemented directly on the foreign `Arc` type).
pub struct TestSourceHandle(pub Arc<TestSource>);

#[async_trait]
impl SourceMessage for TestSourceHandle {
    fn id(&self) -> &[u8] {
        &self.0.id
    }

    async fn metadata(&self) -> MessageResult<Metadata> {
        Ok(self.0.metadata.clone())
    }

    async fn data(&self) -> MessageResult<Bytes> {
        Ok(self.0.data.clone())
    }

    async fn ack(&self) -> MessageResult<()> {
        self.0.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nak(&self) -> MessageResult<()> {
        self.0.naks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Target that records every consumed payload.
#[derive(Default)]
pub struct CollectingTarget {
    /// Consumed `(metadata, data)` pairs in arrival order.
    pub seen: Mutex<Vec<(Metadata, Bytes)>>,
}

#[async_trait]
impl Target for CollectingTarget {
    async fn consume(&self, msg: &mut RunnerMessage) -> RunnerResult<()> {
        let metadata = msg.metadata().await?;
        let data = msg.data().await?;
        self.seen.lock().await.push((metadata, data));
        Ok(())
    }
}
