//! Message dispatcher: source channel → runner chain → target.

use std::sync::Arc;

use async_trait::async_trait;
use bridge_message::{RunnerMessage, SourceMessage};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};

use crate::error::RunnerResult;
use crate::runner::Runner;

/// The narrow contract a target connector fulfills.
#[async_trait]
pub trait Target: Send + Sync {
    /// Deliver the message's effective view downstream.
    async fn consume(&self, msg: &mut RunnerMessage) -> RunnerResult<()>;

    /// Release target resources. Idempotent.
    async fn close(&self) -> RunnerResult<()> {
        Ok(())
    }
}

/// Drives messages from a source stream through the runner chain into a
/// target.
///
/// Within one message, runners execute sequentially in configuration
/// order. On the first runner error the message is nakked once and
/// dropped; retriable categories (timeout, rpc, stream failures) are
/// logged with their tag so source-level redelivery can retry. After the
/// target consumes the message it is acked once.
///
/// Per-source-stream FIFO holds with a single worker (the default);
/// additional workers trade ordering for throughput.
pub struct Pipeline {
    runners: Vec<Arc<dyn Runner>>,
    target: Arc<dyn Target>,
}

impl Pipeline {
    /// Assemble a pipeline.
    #[must_use]
    pub fn new(runners: Vec<Arc<dyn Runner>>, target: Arc<dyn Target>) -> Self {
        Self { runners, target }
    }

    /// Consume the source channel until it closes, with `workers`
    /// concurrent message slots.
    pub async fn run(
        self: Arc<Self>,
        receiver: mpsc::Receiver<Box<dyn SourceMessage>>,
        workers: usize,
    ) {
        let receiver = Arc::new(Mutex::new(receiver));
        let mut tasks = Vec::new();
        for worker in 0..workers.max(1) {
            let pipeline = Arc::clone(&self);
            let receiver = Arc::clone(&receiver);
            tasks.push(tokio::spawn(async move {
                loop {
                    let source = {
                        let mut receiver = receiver.lock().await;
                        receiver.recv().await
                    };
                    let Some(source) = source else {
                        debug!(worker, "source channel closed");
                        break;
                    };
                    pipeline.dispatch(source).await;
                }
            }));
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker task failed");
            }
        }
    }

    /// Run one message through the chain and settle it.
    pub async fn dispatch(&self, source: Box<dyn SourceMessage>) {
        let mut msg = RunnerMessage::new(Arc::from(source));

        for (index, runner) in self.runners.iter().enumerate() {
            if let Err(e) = runner.process(&mut msg).await {
                let category = e.category();
                if category.retriable() {
                    warn!(
                        %category,
                        runner = index,
                        error = %e,
                        "runner failed, source may redeliver"
                    );
                } else {
                    error!(%category, runner = index, error = %e, "runner failed, dropping");
                }
                settle_nak(&mut msg).await;
                return;
            }
        }

        match self.target.consume(&mut msg).await {
            Ok(()) => {
                if let Err(e) = msg.ack().await {
                    warn!(error = %e, "ack failed");
                }
            },
            Err(e) => {
                error!(category = %e.category(), error = %e, "target failed");
                settle_nak(&mut msg).await;
            },
        }
    }

    /// Close every runner and the target.
    pub async fn close(&self) {
        for runner in &self.runners {
            if let Err(e) = runner.close().await {
                warn!(error = %e, "runner close failed");
            }
        }
        if let Err(e) = self.target.close().await {
            warn!(error = %e, "target close failed");
        }
    }
}

async fn settle_nak(msg: &mut RunnerMessage) {
    if let Err(e) = msg.nak().await {
        warn!(error = %e, "nak failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bridge_message::{Envelope, Metadata, MessageError, MessageResult};
    use bytes::Bytes;

    use super::*;
    use crate::error::RunnerError;

    #[derive(Default)]
    struct CountingSource {
        acks: AtomicUsize,
        naks: AtomicUsize,
    }

    #[async_trait]
    impl SourceMessage for CountingSource {
        fn id(&self) -> &[u8] {
            b"test"
        }

        async fn metadata(&self) -> MessageResult<Metadata> {
            Metadata::try_from_pairs([("origin", "test")])
                .map_err(|e| MessageError::SourceRead(e.to_string()))
        }

        async fn data(&self) -> MessageResult<Bytes> {
            Ok(Bytes::from_static(b"payload"))
        }

        async fn ack(&self) -> MessageResult<()> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nak(&self) -> MessageResult<()> {
            self.naks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct TagRunner(&'static str);

    #[async_trait]
    impl Runner for TagRunner {
        async fn process(&self, msg: &mut RunnerMessage) -> RunnerResult<()> {
            msg.add_metadata("tag", self.0)?;
            msg.set_from_envelope(Envelope::new(
                Metadata::new(),
                Bytes::from(format!("{}:{}", self.0, String::from_utf8_lossy(&msg.data().await?))),
            ))?;
            Ok(())
        }

        async fn close(&self) -> RunnerResult<()> {
            Ok(())
        }
    }

    struct FailRunner;

    #[async_trait]
    impl Runner for FailRunner {
        async fn process(&self, _msg: &mut RunnerMessage) -> RunnerResult<()> {
            Err(RunnerError::Validation("boom".to_string()))
        }

        async fn close(&self) -> RunnerResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingTarget {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Target for CollectingTarget {
        async fn consume(&self, msg: &mut RunnerMessage) -> RunnerResult<()> {
            let data = msg.data().await?;
            self.seen
                .lock()
                .await
                .push(String::from_utf8_lossy(&data).into_owned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_chain_runs_in_order_then_acks() {
        let target = Arc::new(CollectingTarget::default());
        let pipeline = Pipeline::new(
            vec![Arc::new(TagRunner("a")), Arc::new(TagRunner("b"))],
            Arc::clone(&target) as Arc<dyn Target>,
        );

        let source = Arc::new(CountingSource::default());
        pipeline
            .dispatch(Box::new(SharedSource(Arc::clone(&source))))
            .await;

        assert_eq!(target.seen.lock().await.as_slice(), ["b:a:payload"]);
        assert_eq!(source.acks.load(Ordering::SeqCst), 1);
        assert_eq!(source.naks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_runner_failure_naks_once_and_skips_target() {
        let target = Arc::new(CollectingTarget::default());
        let pipeline = Pipeline::new(
            vec![Arc::new(TagRunner("a")), Arc::new(FailRunner)],
            Arc::clone(&target) as Arc<dyn Target>,
        );

        let source = Arc::new(CountingSource::default());
        pipeline
            .dispatch(Box::new(SharedSource(Arc::clone(&source))))
            .await;

        assert!(target.seen.lock().await.is_empty());
        assert_eq!(source.acks.load(Ordering::SeqCst), 0);
        assert_eq!(source.naks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let target = Arc::new(CollectingTarget::default());
        let pipeline = Arc::new(Pipeline::new(
            vec![Arc::new(TagRunner("x"))],
            Arc::clone(&target) as Arc<dyn Target>,
        ));

        let (tx, rx) = mpsc::channel::<Box<dyn SourceMessage>>(8);
        for _ in 0..3 {
            tx.send(Box::new(SharedSource(Arc::new(CountingSource::default()))))
                .await
                .unwrap();
        }
        drop(tx);

        pipeline.run(rx, 1).await;
        assert_eq!(target.seen.lock().await.len(), 3);
    }

    /// Wrapper so tests can keep a handle on the source after handing the
    /// boxed message to the pipeline.
    struct SharedSource(Arc<CountingSource>);

    #[async_trait]
    impl SourceMessage for SharedSource {
        fn id(&self) -> &[u8] {
            self.0.id()
        }

        async fn metadata(&self) -> MessageResult<Metadata> {
            self.0.metadata().await
        }

        async fn data(&self) -> MessageResult<Bytes> {
            self.0.data().await
        }

        async fn ack(&self) -> MessageResult<()> {
            self.0.ack().await
        }

        async fn nak(&self) -> MessageResult<()> {
            self.0.nak().await
        }
    }
}
