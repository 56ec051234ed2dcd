//! Shared registry of running MCP plugin instances.
//!
//! At most one instance exists per `(name, version)` pair. Inserting a
//! duplicate replaces the old instance, and the displaced one is disposed
//! so its client connection cannot leak.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::client::McpPluginInstance;

/// Instances keyed by plugin name, then by canonical version string.
#[derive(Default)]
pub struct McpServerContainer {
    plugins: RwLock<HashMap<String, HashMap<String, Arc<McpPluginInstance>>>>,
}

impl McpServerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an instance under its own name and version, disposing any
    /// instance it displaces.
    pub async fn add_plugin(&self, instance: Arc<McpPluginInstance>) {
        let name = instance.name().to_string();
        let version = instance.version().to_string();

        let displaced = {
            let mut plugins = self
                .plugins
                .write()
                .expect("plugin container lock poisoned");
            plugins
                .entry(name.clone())
                .or_default()
                .insert(version.clone(), instance)
        };

        if let Some(displaced) = displaced {
            info!(
                plugin = %name,
                version = %version,
                "replacing registered instance, disposing the displaced one"
            );
            displaced.dispose().await;
        } else {
            debug!(plugin = %name, version = %version, "registered plugin instance");
        }
    }

    pub fn get_plugin(&self, name: &str, version: &str) -> Option<Arc<McpPluginInstance>> {
        let plugins = self.plugins.read().expect("plugin container lock poisoned");
        plugins.get(name).and_then(|versions| versions.get(version)).cloned()
    }

    pub fn contains(&self, name: &str, version: &str) -> bool {
        let plugins = self.plugins.read().expect("plugin container lock poisoned");
        plugins
            .get(name)
            .is_some_and(|versions| versions.contains_key(version))
    }

    /// Registered version strings for `name`, sorted lexically.
    pub fn plugin_versions(&self, name: &str) -> Vec<String> {
        let plugins = self.plugins.read().expect("plugin container lock poisoned");
        let mut versions: Vec<String> = plugins
            .get(name)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default();
        versions.sort();
        versions
    }

    pub fn all_plugins(&self) -> Vec<Arc<McpPluginInstance>> {
        let plugins = self.plugins.read().expect("plugin container lock poisoned");
        plugins
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect()
    }

    /// Number of registered instances across all names and versions.
    pub fn len(&self) -> usize {
        let plugins = self.plugins.read().expect("plugin container lock poisoned");
        plugins.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and disposes one instance. Returns false when it was not
    /// registered. The name entry disappears with its last version.
    pub async fn remove_plugin(&self, name: &str, version: &str) -> bool {
        let removed = {
            let mut plugins = self
                .plugins
                .write()
                .expect("plugin container lock poisoned");
            let Some(versions) = plugins.get_mut(name) else {
                return false;
            };
            let removed = versions.remove(version);
            if versions.is_empty() {
                plugins.remove(name);
            }
            removed
        };

        match removed {
            Some(instance) => {
                instance.dispose().await;
                info!(plugin = %name, version = %version, "removed plugin instance");
                true
            }
            None => false,
        }
    }

    /// Disposes every registered instance and empties the container.
    pub async fn dispose_all(&self) {
        let drained: Vec<Arc<McpPluginInstance>> = {
            let mut plugins = self
                .plugins
                .write()
                .expect("plugin container lock poisoned");
            plugins
                .drain()
                .flat_map(|(_, versions)| versions.into_values())
                .collect()
        };

        for instance in drained {
            instance.dispose().await;
        }
    }
}
