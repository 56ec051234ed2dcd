//! In-memory registry of activated capabilities.
//!
//! Maps a string key to a live capability instance. Entries are rebuilt on
//! every process start; nothing here persists. Registration hooks from
//! native modules receive this registry (wrapped in [`HostServices`]) and
//! populate it during package loading.

use crate::loader::abi::PluginCapability;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// One registered capability.
#[derive(Clone)]
pub struct RegistryEntry {
    pub capability: Arc<dyn PluginCapability>,
    /// True when the entry came from a dynamically loaded package rather
    /// than from the host's built-ins.
    pub dynamic: bool,
}

/// Thread-safe key → capability table with replace-on-conflict semantics.
#[derive(Default)]
pub struct PluginRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a capability under `key`, replacing any existing entry.
    ///
    /// Returns the displaced entry so callers can log or dispose it.
    pub fn register(
        &self,
        key: impl Into<String>,
        capability: Arc<dyn PluginCapability>,
        dynamic: bool,
    ) -> Option<RegistryEntry> {
        let key = key.into();
        let displaced = self
            .entries
            .write()
            .expect("registry lock poisoned")
            .insert(key.clone(), RegistryEntry { capability, dynamic });
        if displaced.is_some() {
            info!(key = %key, "replaced existing registry entry");
        }
        displaced
    }

    /// Looks up a capability by key.
    pub fn resolve(&self, key: &str) -> Option<Arc<dyn PluginCapability>> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(key)
            .map(|entry| Arc::clone(&entry.capability))
    }

    /// Removes one entry; returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .remove(key)
            .is_some()
    }

    /// Drops every dynamically registered entry, keeping host built-ins.
    pub fn clear_dynamic(&self) {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .retain(|_, entry| !entry.dynamic);
    }

    /// Registered keys, unordered.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What registration hooks see: the registry plus the resolution scope the
/// current load pass runs under.
pub struct HostServices {
    pub registry: Arc<PluginRegistry>,
    /// Identifies the load pass (package name and version) a hook runs in.
    pub scope: String,
}

impl HostServices {
    pub fn new(registry: Arc<PluginRegistry>, scope: impl Into<String>) -> Self {
        Self {
            registry,
            scope: scope.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        name: &'static str,
    }

    impl PluginCapability for Echo {
        fn name(&self) -> &str {
            self.name
        }
    }

    #[test]
    fn register_replaces_on_conflict() {
        let registry = PluginRegistry::new();
        assert!(registry
            .register("echo", Arc::new(Echo { name: "first" }), true)
            .is_none());

        let displaced = registry
            .register("echo", Arc::new(Echo { name: "second" }), true)
            .expect("first entry should be displaced");
        assert_eq!(displaced.capability.name(), "first");

        assert_eq!(registry.resolve("echo").unwrap().name(), "second");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn clear_dynamic_keeps_static_entries() {
        let registry = PluginRegistry::new();
        registry.register("builtin", Arc::new(Echo { name: "builtin" }), false);
        registry.register("loaded", Arc::new(Echo { name: "loaded" }), true);

        registry.clear_dynamic();
        assert!(registry.resolve("builtin").is_some());
        assert!(registry.resolve("loaded").is_none());
    }

    #[test]
    fn remove_reports_existence() {
        let registry = PluginRegistry::new();
        registry.register("echo", Arc::new(Echo { name: "echo" }), true);
        assert!(registry.remove("echo"));
        assert!(!registry.remove("echo"));
        assert!(registry.is_empty());
    }
}
