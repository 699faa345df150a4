//! Plugin manager and gRPC plugin host.
//!
//! A plugin is an external executable speaking the [`proto`]
//! `PluginService` contract over a Unix-domain socket or local TCP. The
//! [`PluginManager`] singleton supervises a named registry of
//! [`Plugin`]s: it validates each executable before spawn (name shape,
//! path containment, SHA-256 pinning, argument/environment sanitization),
//! allocates a transport address, spawns the child with the address in
//! its environment, connects with a constant-backoff retrier, and keeps a
//! health loop running until shutdown.
//!
//! Host-side adapters expose a plugin as a message source, a
//! [`Runner`](bridge_runner::Runner) (via [`PluginRunner`]), or a target.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod error;
mod manager;
mod plugin;
mod runner_bridge;
mod security;
mod transport;

/// Generated gRPC types for the plugin wire contract.
#[allow(missing_docs, clippy::all)]
pub mod proto {
    tonic::include_proto!("bridge.plugin.v1");
}

pub use config::{PluginConfig, Protocol};
pub use error::{PluginError, PluginResult};
pub use manager::PluginManager;
pub use plugin::{Plugin, PluginState, SourceHandle};
pub use runner_bridge::PluginRunner;
