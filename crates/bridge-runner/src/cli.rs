//! CLI subprocess runner.

use std::sync::Arc;

use async_trait::async_trait;
use bridge_codec::{MessageCodec, codec_for};
use bridge_exec::{DEFAULT_TIMEOUT_MS, ExecError, ExecutorConfig, SubprocessExecutor};
use bridge_message::RunnerMessage;
use serde::Deserialize;
use tracing::debug;

use crate::error::RunnerResult;
use crate::runner::{Health, Runner};

/// Configuration for [`CliRunner`]: the executor options plus the codec
/// used for the stdin/stdout framing. Unknown keys are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct CliRunnerConfig {
    /// Codec token for the stdin/stdout framing.
    pub format: String,
    /// Program to run.
    pub command: String,
    /// Arguments passed verbatim after validation.
    pub args: Vec<String>,
    /// Environment entries in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Working directory for the child.
    pub work_dir: Option<String>,
    /// Permit running a shell interpreter.
    pub use_shell: bool,
    /// When non-empty, the command must equal one of these entries.
    pub allowed_commands: Vec<String>,
    /// Environment keys stripped from the child and rejected in `env`.
    pub deny_env_vars: Vec<String>,
    /// Stdout cap in bytes; defaults to 1 MiB when unset.
    pub max_output_size: Option<i64>,
    /// Per-execution timeout in milliseconds.
    pub timeout: u64,
    /// Window between SIGTERM and SIGKILL on timeout, in milliseconds.
    pub grace: u64,
}

impl Default for CliRunnerConfig {
    fn default() -> Self {
        Self {
            format: "cli".to_string(),
            command: String::new(),
            args: Vec::new(),
            env: Vec::new(),
            work_dir: None,
            use_shell: false,
            allowed_commands: Vec::new(),
            deny_env_vars: Vec::new(),
            max_output_size: None,
            timeout: DEFAULT_TIMEOUT_MS,
            grace: 0,
        }
    }
}

impl CliRunnerConfig {
    fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            work_dir: self.work_dir.clone(),
            use_shell: self.use_shell,
            allowed_commands: self.allowed_commands.clone(),
            deny_env_vars: self.deny_env_vars.clone(),
            max_output_size: self.max_output_size,
            timeout: self.timeout,
            grace: self.grace,
        }
    }
}

/// Encodes the incoming message with the configured codec, feeds it to a
/// child process's stdin, decodes stdout, and applies the result back to
/// the message.
pub struct CliRunner {
    executor: SubprocessExecutor,
    codec: Arc<dyn MessageCodec>,
    health: Health,
}

impl CliRunner {
    /// Validate the configuration and build the runner.
    ///
    /// # Errors
    ///
    /// Surfaces executor validation failures and unknown codec tokens.
    pub fn new(config: &CliRunnerConfig) -> RunnerResult<Self> {
        Ok(Self {
            executor: SubprocessExecutor::new(&config.executor_config())?,
            codec: codec_for(&config.format)?,
            health: Health::new(),
        })
    }
}

#[async_trait]
impl Runner for CliRunner {
    async fn process(&self, msg: &mut RunnerMessage) -> RunnerResult<()> {
        self.health.check()?;

        let metadata = msg.metadata().await?;
        let data = msg.data().await?;
        let encoded = self.codec.encode(&metadata, &data)?;

        let output = match self.executor.execute(encoded).await {
            Ok(output) => output,
            Err(e @ ExecError::OutputLimitExceeded { .. }) => {
                // The cap is fixed per instance; mark it unhealthy so
                // later calls short-circuit until a rebuild.
                self.health.trip();
                return Err(e.into());
            },
            Err(e) => return Err(e.into()),
        };

        let envelope = self.codec.decode(&output.stdout)?;
        debug!(
            id = %String::from_utf8_lossy(msg.id()),
            bytes = envelope.data.len(),
            "child replied"
        );
        msg.set_from_envelope(envelope)?;
        Ok(())
    }

    async fn close(&self) -> RunnerResult<()> {
        self.executor.close();
        Ok(())
    }
}
