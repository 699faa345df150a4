//! Supervised plugin child process.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bridge_message::{Envelope, Metadata};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{PluginConfig, Protocol};
use crate::error::{PluginError, PluginResult};
use crate::proto::plugin_service_client::PluginServiceClient;
use crate::proto::{ConfigEntry, PluginMessage, PluginStatus, ShutdownRequest, SourceRequest, StatusRequest};
use crate::security;
use crate::transport::{self, PluginAddress};

/// Backoff after a transient receive error on a source stream.
const SOURCE_RECV_BACKOFF: Duration = Duration::from_millis(100);
/// Consecutive receive failures tolerated before a source stream is
/// declared broken.
const SOURCE_MAX_RECV_FAILURES: u32 = 3;

/// Lifecycle state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Registered but never started.
    Created,
    /// Spawn and connect in progress.
    Starting,
    /// Connected; last health probe reported `READY`.
    Ready,
    /// Spawn, connect, or health probe failed.
    Error,
    /// Stopped.
    Shutdown,
}

#[derive(Default)]
struct PluginInner {
    child: Option<Child>,
    client: Option<PluginServiceClient<Channel>>,
    address: Option<PluginAddress>,
    health_task: Option<JoinHandle<()>>,
}

/// One supervised external plugin process.
pub struct Plugin {
    id: Uuid,
    config: PluginConfig,
    state: Arc<StdMutex<PluginState>>,
    inner: Mutex<PluginInner>,
    cancel: CancellationToken,
}

impl Plugin {
    pub(crate) fn new(id: Uuid, config: PluginConfig) -> Self {
        Self {
            id,
            config,
            state: Arc::new(StdMutex::new(PluginState::Created)),
            inner: Mutex::new(PluginInner::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// The manager-assigned plugin id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The registry name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PluginState {
        *lock(&self.state)
    }

    /// Validate, spawn, connect, and start the health loop.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SecurityValidation`] before any side
    /// effect, [`PluginError::UnsupportedProtocol`] for unknown
    /// transports, [`PluginError::Spawn`] when the child cannot start,
    /// and connect/not-ready errors when the plugin never reports
    /// `READY` within `retry × delay`.
    pub async fn start(&self) -> PluginResult<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                PluginState::Starting | PluginState::Ready => {
                    return Err(PluginError::Config(format!(
                        "plugin {:?} is already started",
                        self.config.name
                    )));
                },
                _ => *state = PluginState::Starting,
            }
        }

        match self.start_inner().await {
            Ok(()) => {
                *lock(&self.state) = PluginState::Ready;
                info!(plugin = %self.config.name, id = %self.id, "plugin ready");
                Ok(())
            },
            Err(e) => {
                *lock(&self.state) = PluginState::Error;
                self.kill_child().await;
                Err(e)
            },
        }
    }

    async fn start_inner(&self) -> PluginResult<()> {
        // Every check that could prevent damage runs before the child
        // process exists.
        security::validate(&self.config)?;
        let protocol = Protocol::parse(&self.config.protocol)?;
        let address = transport::allocate(protocol, &self.id)?;

        let mut command = Command::new(&self.config.exec);
        command
            .args(&self.config.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for entry in &self.config.env {
            let (key, value) = bridge_exec::parse_env_entry(entry)
                .map_err(|e| PluginError::SecurityValidation(e.to_string()))?;
            command.env(key, value);
        }
        command
            .env("PLUGIN_ID", self.id.to_string())
            .env("PLUGIN_PROTOCOL", protocol.as_str())
            .env("PLUGIN_ADDRESS", address.env_value());

        let mut child = command.spawn().map_err(PluginError::Spawn)?;
        debug!(plugin = %self.config.name, address = %address.env_value(), "plugin spawned");

        self.pump_child_output(&mut child);
        {
            let mut inner = self.inner.lock().await;
            inner.child = Some(child);
            inner.address = Some(address.clone());
        }

        let client = self.connect_with_retry(&address).await?;
        let health_task = self.spawn_health_loop(client.clone());
        {
            let mut inner = self.inner.lock().await;
            inner.client = Some(client);
            inner.health_task = Some(health_task);
        }
        Ok(())
    }

    /// Constant-backoff retrier: `retry` attempts, `delay` between them,
    /// each dialing the transport and requiring a `READY` status.
    async fn connect_with_retry(
        &self,
        address: &PluginAddress,
    ) -> PluginResult<PluginServiceClient<Channel>> {
        let delay = Duration::from_millis(self.config.delay);
        let timeout = Duration::from_millis(self.config.timeout);
        let mut last_err: Option<PluginError> = None;

        for attempt in 1..=self.config.retry.max(1) {
            tokio::time::sleep(delay).await;

            let channel = match transport::connect(address, timeout).await {
                Ok(channel) => channel,
                Err(e) => {
                    debug!(plugin = %self.config.name, attempt, error = %e, "dial failed");
                    last_err = Some(e);
                    continue;
                },
            };

            let mut client = PluginServiceClient::new(channel);
            match client.status(StatusRequest {}).await {
                Ok(response) => {
                    let response = response.into_inner();
                    if response.status() == PluginStatus::Ready {
                        return Ok(client);
                    }
                    last_err = Some(PluginError::NotReady(format!(
                        "status {:?}: {}",
                        response.status(),
                        response.error
                    )));
                },
                Err(status) => {
                    debug!(plugin = %self.config.name, attempt, %status, "status probe failed");
                    last_err = Some(PluginError::Rpc(status));
                },
            }
        }

        Err(last_err.unwrap_or_else(|| {
            PluginError::NotReady("no connect attempts were made".to_string())
        }))
    }

    fn pump_child_output(&self, child: &mut Child) {
        let name = self.config.name.clone();
        if let Some(stdout) = child.stdout.take() {
            let cancel = self.cancel.child_token();
            let name = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                info!(target: "bridge_plugin::child", plugin = %name, "{line}");
                            },
                            _ => break,
                        },
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                warn!(target: "bridge_plugin::child", plugin = %name, "{line}");
                            },
                            _ => break,
                        },
                    }
                }
            });
        }
    }

    fn spawn_health_loop(&self, client: PluginServiceClient<Channel>) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.status_interval.max(1));
        let cancel = self.cancel.child_token();
        let state = Arc::clone(&self.state);
        let name = self.config.name.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so probing starts
            // one interval after readiness.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut client = client.clone();
                        match client.status(StatusRequest {}).await {
                            Ok(response) => {
                                let status = response.into_inner().status();
                                let new_state = match status {
                                    PluginStatus::Ready => PluginState::Ready,
                                    PluginStatus::Shutdown => PluginState::Shutdown,
                                    _ => PluginState::Error,
                                };
                                *lock(&state) = new_state;
                            },
                            Err(e) => {
                                warn!(plugin = %name, error = %e, "health probe failed");
                                *lock(&state) = PluginState::Error;
                            },
                        }
                    },
                }
            }
            debug!(plugin = %name, "health loop stopped");
        })
    }

    /// Stop the plugin: cancel background tasks, send a best-effort
    /// shutdown RPC, then kill the child.
    pub async fn stop(&self) {
        self.cancel.cancel();
        *lock(&self.state) = PluginState::Shutdown;

        let (client, health_task) = {
            let mut inner = self.inner.lock().await;
            (inner.client.take(), inner.health_task.take())
        };
        if let Some(task) = health_task {
            task.abort();
        }

        if let Some(mut client) = client {
            let deadline = Duration::from_millis(self.config.timeout);
            let request = ShutdownRequest {
                wait_ms: self.config.timeout,
            };
            match tokio::time::timeout(deadline, client.shutdown(request)).await {
                Ok(Ok(_)) => debug!(plugin = %self.config.name, "plugin acknowledged shutdown"),
                Ok(Err(e)) => warn!(plugin = %self.config.name, error = %e, "shutdown rpc failed"),
                Err(_) => warn!(plugin = %self.config.name, "shutdown rpc timed out"),
            }
        }

        self.kill_child().await;
        info!(plugin = %self.config.name, "plugin stopped");
    }

    async fn kill_child(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut child) = inner.child.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "plugin kill failed (child may have exited)");
            }
        }
        if let Some(PluginAddress::Unix(path)) = inner.address.take() {
            let _ = std::fs::remove_file(path);
        }
    }

    async fn ready_client(&self) -> PluginResult<PluginServiceClient<Channel>> {
        let state = self.state();
        if state != PluginState::Ready {
            return Err(PluginError::NotReady(format!(
                "plugin {:?} is {state:?}",
                self.config.name
            )));
        }
        let inner = self.inner.lock().await;
        inner
            .client
            .clone()
            .ok_or_else(|| PluginError::NotReady("no client connected".to_string()))
    }

    /// Open the plugin's source stream.
    ///
    /// Messages arrive on the returned channel. Transient receive errors
    /// back off briefly and continue; after three consecutive failures
    /// the stream is declared broken, the failure is recorded on the
    /// handle, and the channel closes. End-of-stream closes the channel
    /// silently. The handle's `close` is idempotent.
    ///
    /// # Errors
    ///
    /// Returns not-ready and RPC errors from opening the stream.
    pub async fn source(
        &self,
        buffer: usize,
        configs: Vec<(String, String)>,
    ) -> PluginResult<(mpsc::Receiver<Envelope>, SourceHandle)> {
        let mut client = self.ready_client().await?;
        let request = SourceRequest {
            configs: configs
                .into_iter()
                .map(|(name, value)| ConfigEntry { name, value })
                .collect(),
        };
        let mut stream = client
            .source(request)
            .await
            .map_err(PluginError::Rpc)?
            .into_inner();

        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = self.cancel.child_token();
        let task_cancel = cancel.clone();
        let failure: Arc<StdMutex<Option<PluginError>>> = Arc::new(StdMutex::new(None));
        let task_failure = Arc::clone(&failure);
        let name = self.config.name.clone();

        tokio::spawn(async move {
            let mut consecutive_failures = 0u32;
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    next = stream.message() => match next {
                        Ok(Some(message)) => {
                            consecutive_failures = 0;
                            match envelope_from_message(message) {
                                Ok(envelope) => {
                                    if tx.send(envelope).await.is_err() {
                                        break;
                                    }
                                },
                                Err(e) => {
                                    warn!(plugin = %name, error = %e, "dropping invalid source message");
                                },
                            }
                        },
                        Ok(None) => {
                            debug!(plugin = %name, "source stream ended");
                            break;
                        },
                        Err(status) => {
                            consecutive_failures += 1;
                            if consecutive_failures >= SOURCE_MAX_RECV_FAILURES {
                                let broken = PluginError::Stream(format!(
                                    "receive failed {consecutive_failures} times in a row: {status}"
                                ));
                                error!(
                                    plugin = %name,
                                    category = %broken.category(),
                                    error = %broken,
                                    "source stream broken, giving up"
                                );
                                *task_failure
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner) = Some(broken);
                                break;
                            }
                            warn!(plugin = %name, %status, "source receive failed, backing off");
                            tokio::time::sleep(SOURCE_RECV_BACKOFF).await;
                        },
                    },
                }
            }
        });

        Ok((rx, SourceHandle { cancel, failure }))
    }

    /// One-shot transform RPC. The response is copied into an owned
    /// [`Envelope`] on handoff.
    ///
    /// # Errors
    ///
    /// Returns not-ready, RPC, and invalid-message errors.
    pub async fn runner_call(
        &self,
        id: &[u8],
        metadata: &Metadata,
        data: &[u8],
    ) -> PluginResult<Envelope> {
        let mut client = self.ready_client().await?;
        let mut request = tonic::Request::new(self.plugin_message(id, metadata, data));
        request.set_timeout(Duration::from_millis(self.config.timeout));
        let response = client.runner(request).await.map_err(PluginError::Rpc)?;
        envelope_from_message(response.into_inner())
    }

    /// One-shot delivery RPC.
    ///
    /// # Errors
    ///
    /// Returns not-ready and RPC errors.
    pub async fn target_call(
        &self,
        id: &[u8],
        metadata: &Metadata,
        data: &[u8],
    ) -> PluginResult<()> {
        let mut client = self.ready_client().await?;
        let mut request = tonic::Request::new(self.plugin_message(id, metadata, data));
        request.set_timeout(Duration::from_millis(self.config.timeout));
        client.target(request).await.map_err(PluginError::Rpc)?;
        Ok(())
    }

    fn plugin_message(&self, id: &[u8], metadata: &Metadata, data: &[u8]) -> PluginMessage {
        PluginMessage {
            uuid: id.to_vec(),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            data: data.to_vec(),
        }
    }
}

/// Closes a plugin source stream and reports its terminal failure.
pub struct SourceHandle {
    cancel: CancellationToken,
    failure: Arc<StdMutex<Option<PluginError>>>,
}

impl SourceHandle {
    /// Stop the background receive task and close the channel.
    /// Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Take the stream failure, if the receive task gave up. `None` for
    /// streams that are still running or ended cleanly.
    #[must_use]
    pub fn take_failure(&self) -> Option<PluginError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

fn lock<'a>(state: &'a Arc<StdMutex<PluginState>>) -> std::sync::MutexGuard<'a, PluginState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn envelope_from_message(message: PluginMessage) -> PluginResult<Envelope> {
    let metadata = Metadata::try_from_pairs(message.metadata)
        .map_err(|e| PluginError::InvalidMessage(e.to_string()))?;
    Ok(Envelope::new(metadata, Bytes::from(message.data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_json(json: &str) -> PluginConfig {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_unsupported_protocol_rejected() {
        let plugin = Plugin::new(
            Uuid::new_v4(),
            config_json(r#"{"name":"p","exec":"/bin/sleep","protocol":"vsock"}"#),
        );
        let err = plugin.start().await.unwrap_err();
        assert!(matches!(err, PluginError::UnsupportedProtocol(_)));
        assert_eq!(plugin.state(), PluginState::Error);
    }

    #[tokio::test]
    async fn test_security_failure_before_spawn() {
        let plugin = Plugin::new(
            Uuid::new_v4(),
            config_json(r#"{"name":"bad name!","exec":"/bin/sleep"}"#),
        );
        let err = plugin.start().await.unwrap_err();
        assert!(matches!(err, PluginError::SecurityValidation(_)));
    }

    #[tokio::test]
    async fn test_connect_retry_exhaustion() {
        // `sleep` never binds the socket, so every attempt fails and the
        // plugin ends in the error state.
        let plugin = Plugin::new(
            Uuid::new_v4(),
            config_json(
                r#"{"name":"never-ready","exec":"/bin/sleep","args":["5"],
                     "retry":2,"delay":50,"timeout":200}"#,
            ),
        );
        let err = plugin.start().await.unwrap_err();
        assert!(matches!(
            err,
            PluginError::Connect(_) | PluginError::NotReady(_) | PluginError::Rpc(_)
        ));
        assert_eq!(plugin.state(), PluginState::Error);
        plugin.stop().await;
        assert_eq!(plugin.state(), PluginState::Shutdown);
    }

    #[test]
    fn test_source_handle_reports_failure_once() {
        let handle = SourceHandle {
            cancel: CancellationToken::new(),
            failure: Arc::new(StdMutex::new(Some(PluginError::Stream(
                "receive failed 3 times in a row".to_string(),
            )))),
        };
        assert!(matches!(
            handle.take_failure(),
            Some(PluginError::Stream(_))
        ));
        assert!(handle.take_failure().is_none());
        handle.close();
        handle.close();
    }

    #[tokio::test]
    async fn test_calls_require_ready_state() {
        let plugin = Plugin::new(
            Uuid::new_v4(),
            config_json(r#"{"name":"idle","exec":"/bin/sleep"}"#),
        );
        let err = plugin
            .runner_call(b"id", &Metadata::new(), b"data")
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotReady(_)));
    }
}
