//! Process-wide plugin registry and supervisor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::info;
use uuid::Uuid;

use crate::config::PluginConfig;
use crate::error::{PluginError, PluginResult};
use crate::plugin::Plugin;

static MANAGER: OnceLock<Arc<PluginManager>> = OnceLock::new();

/// Supervisor owning every registered [`Plugin`].
///
/// The process normally uses the [`global`](Self::global) singleton;
/// independent instances exist for tests.
#[derive(Default)]
pub struct PluginManager {
    plugins: Mutex<HashMap<String, Arc<Plugin>>>,
}

impl PluginManager {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide manager, created on first use.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(MANAGER.get_or_init(|| Arc::new(Self::new())))
    }

    /// Register a plugin without starting it. Assigns a fresh UUID.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::DuplicateName`] when the name is taken.
    pub fn create_plugin(&self, config: PluginConfig) -> PluginResult<Arc<Plugin>> {
        let mut plugins = self.lock();
        if plugins.contains_key(&config.name) {
            return Err(PluginError::DuplicateName(config.name));
        }
        let name = config.name.clone();
        let plugin = Arc::new(Plugin::new(Uuid::new_v4(), config));
        plugins.insert(name.clone(), Arc::clone(&plugin));
        info!(plugin = %name, id = %plugin.id(), "plugin registered");
        Ok(plugin)
    }

    /// Exact-name lookup.
    #[must_use]
    pub fn get_plugin(&self, name: &str) -> Option<Arc<Plugin>> {
        self.lock().get(name).cloned()
    }

    /// Fetch an existing plugin or register (and optionally start) a new
    /// one.
    ///
    /// # Errors
    ///
    /// Propagates registration and start failures.
    pub async fn get_or_create_plugin(
        &self,
        config: PluginConfig,
        start_now: bool,
    ) -> PluginResult<Arc<Plugin>> {
        if let Some(existing) = self.get_plugin(&config.name) {
            return Ok(existing);
        }
        let plugin = self.create_plugin(config)?;
        if start_now {
            plugin.start().await?;
        }
        Ok(plugin)
    }

    /// Stop every plugin and clear the registry.
    pub async fn stop_all(&self) {
        let plugins: Vec<Arc<Plugin>> = {
            let mut registry = self.lock();
            registry.drain().map(|(_, plugin)| plugin).collect()
        };
        for plugin in plugins {
            info!(plugin = %plugin.name(), "stopping plugin");
            plugin.stop().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Plugin>>> {
        self.plugins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
