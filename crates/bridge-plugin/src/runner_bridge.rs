//! Plugin-backed runner.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bridge_message::RunnerMessage;
use bridge_runner::{Health, Runner, RunnerError, RunnerResult};
use tracing::debug;

use crate::error::PluginError;
use crate::plugin::Plugin;

/// Consecutive not-ready responses before the runner instance is marked
/// unhealthy.
const MAX_NOT_READY_STRIKES: u32 = 3;

/// Bridges a supervised [`Plugin`] into the runner chain via its one-shot
/// `Runner` RPC.
pub struct PluginRunner {
    plugin: Arc<Plugin>,
    health: Health,
    not_ready_strikes: AtomicU32,
}

impl PluginRunner {
    /// Wrap a plugin. The plugin's lifecycle stays owned by the manager.
    #[must_use]
    pub fn new(plugin: Arc<Plugin>) -> Self {
        Self {
            plugin,
            health: Health::new(),
            not_ready_strikes: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Runner for PluginRunner {
    async fn process(&self, msg: &mut RunnerMessage) -> RunnerResult<()> {
        self.health.check()?;

        let metadata = msg.metadata().await?;
        let data = msg.data().await?;

        match self
            .plugin
            .runner_call(msg.id(), &metadata, &data)
            .await
        {
            Ok(envelope) => {
                self.not_ready_strikes.store(0, Ordering::SeqCst);
                msg.set_from_envelope(envelope)?;
                Ok(())
            },
            Err(e @ PluginError::NotReady(_)) => {
                let strikes = self.not_ready_strikes.fetch_add(1, Ordering::SeqCst) + 1;
                if strikes >= MAX_NOT_READY_STRIKES {
                    self.health.trip();
                }
                Err(RunnerError::PluginNotReady(e.to_string()))
            },
            Err(e) => Err(map_plugin_error(e)),
        }
    }

    async fn close(&self) -> RunnerResult<()> {
        // The manager owns the plugin process; closing the runner only
        // detaches this chain from it.
        debug!(plugin = %self.plugin.name(), "plugin runner closed");
        Ok(())
    }
}

fn map_plugin_error(e: PluginError) -> RunnerError {
    match e {
        PluginError::NotReady(msg) | PluginError::Connect(msg) => {
            RunnerError::PluginNotReady(msg)
        },
        PluginError::Rpc(status) => RunnerError::Rpc(status.to_string()),
        PluginError::InvalidMessage(msg) => {
            RunnerError::Codec(bridge_codec::CodecError::Decode(msg))
        },
        other => RunnerError::Internal(other.to_string()),
    }
}
