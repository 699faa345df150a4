//! Subprocess execution with capped output and kill escalation.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::error::{ExecError, ExecResult};
use crate::validate::{
    parse_env_entry, validate_arg, validate_command, validate_env_pair, validate_work_dir,
};

/// How much trailing stderr is retained for error surfaces.
const STDERR_TAIL_BYTES: usize = 4096;

/// Result of one successful child run.
#[derive(Debug)]
pub struct ExecOutput {
    /// Everything the child wrote to stdout.
    pub stdout: Bytes,
    /// Trailing stderr output, bounded to the last few KiB.
    pub stderr_tail: String,
}

/// A validated, reusable subprocess executor.
///
/// Construction performs every security check; `execute` only spawns.
/// The executor is safe to share across workers; each call runs its own
/// child. `close` cancels the shared token and outstanding executions
/// surface [`ExecError::Cancelled`].
#[derive(Debug)]
pub struct SubprocessExecutor {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    env_remove: Vec<String>,
    work_dir: Option<String>,
    max_output_size: usize,
    timeout: Duration,
    grace: Duration,
    cancel: CancellationToken,
}

impl SubprocessExecutor {
    /// Validate the configuration and build an executor.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Validation`] when any pre-spawn check fails
    /// and [`ExecError::Config`] for malformed caps.
    pub fn new(config: &ExecutorConfig) -> ExecResult<Self> {
        let command = config.command.trim().to_string();
        validate_command(&command, &config.allowed_commands, config.use_shell)?;

        let shell_invocation =
            config.use_shell && crate::validate::is_shell_command(&command);
        if !shell_invocation {
            for arg in &config.args {
                validate_arg(arg)?;
            }
        }

        let deny: std::collections::HashSet<&str> =
            config.deny_env_vars.iter().map(String::as_str).collect();
        let mut env = Vec::with_capacity(config.env.len());
        for entry in &config.env {
            let (key, value) = parse_env_entry(entry)?;
            validate_env_pair(&key, &value, &deny)?;
            env.push((key, value));
        }

        if let Some(dir) = &config.work_dir {
            validate_work_dir(dir)?;
        }

        Ok(Self {
            program: command,
            args: config.args.clone(),
            env,
            env_remove: config.deny_env_vars.clone(),
            work_dir: config.work_dir.clone(),
            max_output_size: config.resolved_max_output_size()?,
            timeout: Duration::from_millis(config.timeout),
            grace: Duration::from_millis(config.grace),
            cancel: CancellationToken::new(),
        })
    }

    /// Stop accepting work and cancel outstanding executions.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Run the child once: write `input` to stdin, return capped stdout.
    ///
    /// # Errors
    ///
    /// Surfaces spawn failures, timeouts, output-cap breaches, non-zero
    /// exits (with a stderr tail), and cancellation.
    pub async fn execute(&self, input: Bytes) -> ExecResult<ExecOutput> {
        if self.cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &self.env_remove {
            command.env_remove(key);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(dir) = &self.work_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(ExecError::Spawn)?;

        // Stdin is fed from its own task so a child that fills its stdout
        // pipe before draining stdin cannot deadlock the executor.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "stdin write ended early");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let tail = Arc::new(Mutex::new(Vec::new()));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(pump_stderr(stderr, Arc::clone(&tail))));

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::Spawn(std::io::Error::other("stdout not piped")))?;

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let read_fut = read_capped(stdout, self.max_output_size);
        tokio::pin!(read_fut);

        let timeout_ms = self.timeout.as_millis() as u64;

        let stdout_bytes = tokio::select! {
            out = &mut read_fut => match out {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.kill(&mut child).await;
                    return Err(e);
                },
            },
            () = &mut deadline => {
                self.kill(&mut child).await;
                return Err(ExecError::Timeout { timeout_ms });
            },
            () = self.cancel.cancelled() => {
                self.kill(&mut child).await;
                return Err(ExecError::Cancelled);
            },
        };

        enum WaitOutcome {
            Done(std::io::Result<std::process::ExitStatus>),
            Timeout,
            Cancelled,
        }
        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Done(status),
            () = &mut deadline => WaitOutcome::Timeout,
            () = self.cancel.cancelled() => WaitOutcome::Cancelled,
        };
        let status = match outcome {
            WaitOutcome::Done(status) => status?,
            WaitOutcome::Timeout => {
                self.kill(&mut child).await;
                return Err(ExecError::Timeout { timeout_ms });
            },
            WaitOutcome::Cancelled => {
                self.kill(&mut child).await;
                return Err(ExecError::Cancelled);
            },
        };

        if let Some(task) = stderr_task {
            let _ = task.await;
        }
        let stderr_tail = {
            let tail = tail.lock().map_err(|_| {
                ExecError::Io(std::io::Error::other("stderr tail poisoned"))
            })?;
            String::from_utf8_lossy(&tail).into_owned()
        };

        if !status.success() {
            return Err(ExecError::NonZeroExit {
                code: status.code().unwrap_or(-1),
                stderr_tail,
            });
        }

        Ok(ExecOutput {
            stdout: stdout_bytes,
            stderr_tail,
        })
    }

    /// Terminate the child: SIGTERM with a grace window when configured,
    /// SIGKILL as the last resort, then a single wait.
    async fn kill(&self, child: &mut Child) {
        #[cfg(unix)]
        if !self.grace.is_zero() {
            if let Some(pid) = child.id() {
                let pid = nix::unistd::Pid::from_raw(pid as i32);
                if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                    debug!(error = %e, "SIGTERM failed");
                }
            }
            if tokio::time::timeout(self.grace, child.wait()).await.is_ok() {
                return;
            }
            warn!(program = %self.program, "child ignored SIGTERM, escalating");
        }
        if let Err(e) = child.kill().await {
            debug!(error = %e, "kill failed (child may have exited)");
        }
    }
}

async fn read_capped(mut stdout: ChildStdout, cap: usize) -> ExecResult<Bytes> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            return Ok(Bytes::from(out));
        }
        if out.len() + n > cap {
            return Err(ExecError::OutputLimitExceeded { limit: cap });
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Drain child stderr line by line into the log, retaining a bounded tail.
async fn pump_stderr(stderr: ChildStderr, tail: Arc<Mutex<Vec<u8>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "bridge_exec::child", "{line}");
        if let Ok(mut tail) = tail.lock() {
            tail.extend_from_slice(line.as_bytes());
            tail.push(b'\n');
            if tail.len() > STDERR_TAIL_BYTES {
                let excess = tail.len() - STDERR_TAIL_BYTES;
                tail.drain(..excess);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str) -> ExecutorConfig {
        ExecutorConfig {
            command: command.to_string(),
            ..ExecutorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_cat_passthrough() {
        let executor = SubprocessExecutor::new(&config("cat")).unwrap();
        let out = executor
            .execute(Bytes::from_static(b"test data"))
            .await
            .unwrap();
        assert_eq!(out.stdout, Bytes::from_static(b"test data"));
    }

    #[tokio::test]
    async fn test_large_payload_does_not_deadlock() {
        let mut cfg = config("cat");
        cfg.max_output_size = Some(4 * 1024 * 1024);
        let executor = SubprocessExecutor::new(&cfg).unwrap();
        let input = Bytes::from(vec![b'x'; 512 * 1024]);
        let out = executor.execute(input.clone()).await.unwrap();
        assert_eq!(out.stdout, input);
    }

    #[tokio::test]
    async fn test_validation_rejects_chained_command() {
        let err = SubprocessExecutor::new(&config("/usr/bin/cat;/bin/rm")).unwrap_err();
        assert!(matches!(err, ExecError::Validation(_)));
    }

    #[tokio::test]
    async fn test_allow_list_rejects_pre_spawn() {
        let mut cfg = config("rm");
        cfg.allowed_commands = vec!["cat".to_string()];
        let err = SubprocessExecutor::new(&cfg).unwrap_err();
        assert!(matches!(err, ExecError::Validation(_)));
    }

    #[tokio::test]
    async fn test_output_cap() {
        let mut cfg = config("cat");
        cfg.max_output_size = Some(16);
        let executor = SubprocessExecutor::new(&cfg).unwrap();
        let err = executor
            .execute(Bytes::from(vec![b'y'; 64]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::OutputLimitExceeded { limit: 16 }));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let mut cfg = config("sleep");
        cfg.args = vec!["30".to_string()];
        cfg.timeout = 200;
        let executor = SubprocessExecutor::new(&cfg).unwrap();
        let start = std::time::Instant::now();
        let err = executor.execute(Bytes::new()).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let mut cfg = config("ls");
        cfg.args = vec!["/definitely/not/a/path".to_string()];
        let executor = SubprocessExecutor::new(&cfg).unwrap();
        let err = executor.execute(Bytes::new()).await.unwrap_err();
        match err {
            ExecError::NonZeroExit { code, stderr_tail } => {
                assert_ne!(code, 0);
                assert!(!stderr_tail.is_empty());
            },
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_cancels() {
        let executor = SubprocessExecutor::new(&config("cat")).unwrap();
        executor.close();
        let err = executor.execute(Bytes::new()).await.unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
    }
}
