//! Plugin configuration.

use serde::Deserialize;

use crate::error::{PluginError, PluginResult};

/// Transport between host and plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Unix-domain socket under `/tmp`. The default; lowest per-call
    /// latency and no loopback port consumption.
    Unix,
    /// Local TCP, for containers where Unix sockets are awkward.
    Tcp,
}

impl Protocol {
    /// Parse the configuration token.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::UnsupportedProtocol`] for anything but
    /// `unix` and `tcp`.
    pub fn parse(token: &str) -> PluginResult<Self> {
        match token {
            "unix" => Ok(Self::Unix),
            "tcp" => Ok(Self::Tcp),
            other => Err(PluginError::UnsupportedProtocol(other.to_string())),
        }
    }

    /// The token the child reads from `PLUGIN_PROTOCOL`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unix => "unix",
            Self::Tcp => "tcp",
        }
    }
}

/// Configuration for one supervised plugin.
///
/// Durations are milliseconds. Unknown keys are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PluginConfig {
    /// Registry name, `[A-Za-z0-9_-]{1,128}`.
    pub name: String,
    /// Path to the plugin executable.
    pub exec: String,
    /// Arguments passed after sanitization.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment entries in `KEY=VALUE` form.
    #[serde(default)]
    pub env: Vec<String>,
    /// Transport protocol: `unix` or `tcp`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Delay before each connect attempt, in milliseconds.
    #[serde(default = "default_delay")]
    pub delay: u64,
    /// Connect attempts.
    #[serde(default = "default_retry")]
    pub retry: u32,
    /// Health probe interval, in milliseconds.
    #[serde(default = "default_status_interval")]
    pub status_interval: u64,
    /// RPC and shutdown deadline, in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// When set, the executable must live inside this directory.
    #[serde(default)]
    pub allowed_plugins_dir: Option<String>,
    /// Expected SHA-256 of the executable, 64 hex characters.
    #[serde(default, rename = "expectedSHA256")]
    pub expected_sha256: Option<String>,
    /// Verify the executable hash before spawn.
    #[serde(default)]
    pub verify_hash: bool,
    /// Enforce path checks on the executable. On by default.
    #[serde(default = "default_true")]
    pub strict_validation: bool,
}

fn default_protocol() -> String {
    "unix".to_string()
}

fn default_delay() -> u64 {
    250
}

fn default_retry() -> u32 {
    10
}

fn default_status_interval() -> u64 {
    5_000
}

fn default_timeout() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}
