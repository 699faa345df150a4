//! The runner contract.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bridge_message::RunnerMessage;

use crate::error::RunnerResult;

/// A stateless-per-message transformer.
///
/// Instances may be shared across workers and must tolerate parallel
/// `process` calls; callers guarantee a message is never shared between
/// concurrent calls. Implementations must not retain the message past
/// `process`'s return.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Transform the message in place.
    async fn process(&self, msg: &mut RunnerMessage) -> RunnerResult<()>;

    /// Release resources (compiled modules, subprocess contexts, gRPC
    /// connections). Idempotent.
    async fn close(&self) -> RunnerResult<()>;
}

/// Instance health flag.
///
/// Runners that hit an instance-fatal condition (a breached output cap on
/// a misconfigured executor, a plugin that stays not-ready) trip the flag;
/// later `process` calls short-circuit with
/// [`RunnerError::Unhealthy`](crate::RunnerError::Unhealthy) until the
/// runner is closed and rebuilt.
#[derive(Debug, Default)]
pub struct Health {
    unhealthy: AtomicBool,
}

impl Health {
    /// A fresh, healthy flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the instance unhealthy.
    pub fn trip(&self) {
        self.unhealthy.store(true, Ordering::SeqCst);
    }

    /// Whether the instance is still usable.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }

    /// Short-circuit helper for the top of `process`.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Unhealthy`](crate::RunnerError::Unhealthy)
    /// once tripped.
    pub fn check(&self) -> RunnerResult<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(crate::RunnerError::Unhealthy)
        }
    }
}
