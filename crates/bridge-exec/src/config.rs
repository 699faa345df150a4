//! Executor configuration.

use serde::Deserialize;

use crate::error::{ExecError, ExecResult};

/// Default stdout cap when `maxOutputSize` is unset.
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 1024 * 1024;
/// Default per-execution timeout when `timeout` is unset.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Configuration for a [`SubprocessExecutor`](crate::SubprocessExecutor).
///
/// Durations are milliseconds. Unknown keys are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct ExecutorConfig {
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
    /// When non-empty, the command must equal one of these entries exactly.
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

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
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

impl ExecutorConfig {
    /// Resolve the stdout cap.
    ///
    /// # Errors
    ///
    /// A configured non-positive cap is an [`ExecError::Config`].
    pub fn resolved_max_output_size(&self) -> ExecResult<usize> {
        match self.max_output_size {
            None => Ok(DEFAULT_MAX_OUTPUT_SIZE),
            Some(size) if size > 0 => Ok(size as usize),
            Some(size) => Err(ExecError::Config(format!(
                "maxOutputSize must be positive, got {size}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: ExecutorConfig = serde_json::from_str(r#"{"command":"cat"}"#).unwrap();
        assert_eq!(config.command, "cat");
        assert_eq!(config.timeout, DEFAULT_TIMEOUT_MS);
        assert_eq!(
            config.resolved_max_output_size().unwrap(),
            DEFAULT_MAX_OUTPUT_SIZE
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = serde_json::from_str::<ExecutorConfig>(
            r#"{"command":"cat","bogus":true}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_non_positive_output_cap_is_config_error() {
        let config: ExecutorConfig =
            serde_json::from_str(r#"{"command":"cat","maxOutputSize":0}"#).unwrap();
        assert!(matches!(
            config.resolved_max_output_size(),
            Err(ExecError::Config(_))
        ));
    }
}
