//! Per-package module resolution with version-aware host fallback.
//!
//! Each loaded package gets its own [`LoadContext`]. Resolution prefers the
//! package's staged copy of a module only when it is strictly newer than
//! what the host already holds; allow-listed names always come from the
//! host so cross-cutting modules stay singletons.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::types::{LoadError, PluginVersion};

use super::runtime::{LoadedModule, ModuleRuntime, module_file_name};

/// Module names every context resolves from the host, regardless of what a
/// package ships.
pub const HOST_SHARED_MODULES: &[&str] = &["berth_host"];

/// A host-table entry: a loaded module plus the version it was recorded at.
#[derive(Clone)]
pub struct HostModule {
    pub name: String,
    pub version: Option<PluginVersion>,
    pub module: Arc<dyn LoadedModule>,
}

/// The host's default module table, shared by every load context.
#[derive(Default)]
pub struct HostModules {
    modules: RwLock<HashMap<String, HostModule>>,
}

impl HostModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a module under its name, replacing any prior entry.
    pub fn register(&self, module: Arc<dyn LoadedModule>) {
        let entry = HostModule {
            name: module.name().to_string(),
            version: module.version().copied(),
            module,
        };
        self.modules
            .write()
            .expect("host module table lock poisoned")
            .insert(entry.name.clone(), entry);
    }

    /// Exact-name lookup.
    pub fn lookup(&self, name: &str) -> Option<HostModule> {
        self.modules
            .read()
            .expect("host module table lock poisoned")
            .get(name)
            .cloned()
    }

    /// Case-insensitive scan over everything loaded so far.
    pub fn scan(&self, name: &str) -> Option<HostModule> {
        let target = name.to_ascii_lowercase();
        self.modules
            .read()
            .expect("host module table lock poisoned")
            .values()
            .find(|entry| entry.name.to_ascii_lowercase() == target)
            .cloned()
    }
}

/// Where a resolution was satisfied from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSource {
    Host,
    PluginDir,
}

/// A successful resolution.
#[derive(Clone)]
pub struct ResolvedModule {
    pub source: ModuleSource,
    pub module: Arc<dyn LoadedModule>,
}

/// Resolution context scoped to one package's staging directory.
pub struct LoadContext {
    plugin_name: String,
    plugin_dir: PathBuf,
    shared: HashSet<String>,
    host: Arc<HostModules>,
    runtime: Arc<dyn ModuleRuntime>,
    cache: Mutex<HashMap<String, ResolvedModule>>,
}

impl LoadContext {
    pub fn new(
        plugin_name: impl Into<String>,
        plugin_dir: impl Into<PathBuf>,
        shared_modules: impl IntoIterator<Item = String>,
        host: Arc<HostModules>,
        runtime: Arc<dyn ModuleRuntime>,
    ) -> Self {
        let mut shared: HashSet<String> = shared_modules
            .into_iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();
        shared.extend(
            HOST_SHARED_MODULES
                .iter()
                .map(|name| name.to_ascii_lowercase()),
        );
        Self {
            plugin_name: plugin_name.into(),
            plugin_dir: plugin_dir.into(),
            shared,
            host,
            runtime,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Resolves a module name against the host table and this package's
    /// staging directory. Successful resolutions are cached for the
    /// lifetime of the context.
    pub fn resolve(&self, name: &str) -> Result<ResolvedModule, LoadError> {
        if let Some(hit) = self
            .cache
            .lock()
            .expect("resolution cache lock poisoned")
            .get(name)
        {
            return Ok(hit.clone());
        }

        let resolved = self.resolve_uncached(name)?;
        self.cache
            .lock()
            .expect("resolution cache lock poisoned")
            .insert(name.to_string(), resolved.clone());
        Ok(resolved)
    }

    fn resolve_uncached(&self, name: &str) -> Result<ResolvedModule, LoadError> {
        // Allow-listed names are host singletons; the package's own copy is
        // never considered, even when one is staged.
        if self.shared.contains(&name.to_ascii_lowercase()) {
            let entry = self
                .host
                .lookup(name)
                .or_else(|| self.host.scan(name))
                .ok_or_else(|| LoadError::ModuleNotFound {
                    name: name.to_string(),
                })?;
            return Ok(ResolvedModule {
                source: ModuleSource::Host,
                module: entry.module,
            });
        }

        let host_candidate = self.host.lookup(name).or_else(|| self.host.scan(name));

        let plugin_path = self.plugin_dir.join(module_file_name(name));
        if plugin_path.exists() {
            let staged_version = self.runtime.probe(&plugin_path)?.and_then(|meta| meta.version);
            if let Some(host_entry) = &host_candidate
                && let Some(host_version) = host_entry.version
                && let Some(staged_version) = staged_version
                && staged_version <= host_version
            {
                debug!(
                    plugin = %self.plugin_name,
                    module = name,
                    host = %host_version,
                    staged = %staged_version,
                    "staged module is not newer, using host copy"
                );
                return Ok(ResolvedModule {
                    source: ModuleSource::Host,
                    module: host_entry.module.clone(),
                });
            }

            let module = self.runtime.load(&plugin_path)?;
            return Ok(ResolvedModule {
                source: ModuleSource::PluginDir,
                module,
            });
        }

        match host_candidate {
            Some(entry) => Ok(ResolvedModule {
                source: ModuleSource::Host,
                module: entry.module,
            }),
            None => Err(LoadError::ModuleNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Drops every cached resolution.
    pub fn teardown(&self) {
        self.cache
            .lock()
            .expect("resolution cache lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::abi::{CapabilityDecl, RegistrationHook};
    use crate::loader::runtime::{SidecarMetadata, module_name_from_path};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeModule {
        name: String,
        version: Option<PluginVersion>,
    }

    impl LoadedModule for FakeModule {
        fn name(&self) -> &str {
            &self.name
        }

        fn version(&self) -> Option<&PluginVersion> {
            self.version.as_ref()
        }

        fn capabilities(&self) -> &[CapabilityDecl] {
            &[]
        }

        fn hooks(&self) -> &[RegistrationHook] {
            &[]
        }
    }

    /// Probes answer from a scripted path -> version map; loads count up.
    #[derive(Default)]
    struct ScriptedRuntime {
        versions: HashMap<PathBuf, Option<PluginVersion>>,
        loads: AtomicUsize,
    }

    impl ModuleRuntime for ScriptedRuntime {
        fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let name = module_name_from_path(path).unwrap();
            let version = self.versions.get(path).copied().flatten();
            Ok(Arc::new(FakeModule { name, version }))
        }

        fn probe(&self, path: &Path) -> Result<Option<SidecarMetadata>, LoadError> {
            Ok(self.versions.get(path).map(|version| SidecarMetadata {
                name: module_name_from_path(path).unwrap_or_default(),
                version: *version,
            }))
        }
    }

    fn host_with(name: &str, version: Option<PluginVersion>) -> Arc<HostModules> {
        let host = Arc::new(HostModules::new());
        host.register(Arc::new(FakeModule {
            name: name.to_string(),
            version,
        }));
        host
    }

    fn stage_module(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(module_file_name(name));
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn strictly_newer_staged_copy_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = stage_module(dir.path(), "render");

        let mut runtime = ScriptedRuntime::default();
        runtime
            .versions
            .insert(path, Some(PluginVersion::new(2, 0, 0)));

        let ctx = LoadContext::new(
            "demo",
            dir.path(),
            Vec::new(),
            host_with("render", Some(PluginVersion::new(1, 0, 0))),
            Arc::new(runtime),
        );

        let resolved = ctx.resolve("render").unwrap();
        assert_eq!(resolved.source, ModuleSource::PluginDir);
        assert_eq!(resolved.module.version(), Some(&PluginVersion::new(2, 0, 0)));
    }

    #[test]
    fn equal_version_keeps_host_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = stage_module(dir.path(), "render");

        let mut runtime = ScriptedRuntime::default();
        runtime
            .versions
            .insert(path, Some(PluginVersion::new(1, 4, 0)));
        let runtime = Arc::new(runtime);

        let ctx = LoadContext::new(
            "demo",
            dir.path(),
            Vec::new(),
            host_with("render", Some(PluginVersion::new(1, 4, 0))),
            runtime.clone(),
        );

        let resolved = ctx.resolve("render").unwrap();
        assert_eq!(resolved.source, ModuleSource::Host);
        assert_eq!(runtime.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_staged_version_prefers_staged_copy() {
        let dir = tempfile::tempdir().unwrap();
        stage_module(dir.path(), "render");

        // No probe script for the path, so the staged version is unknown.
        let ctx = LoadContext::new(
            "demo",
            dir.path(),
            Vec::new(),
            host_with("render", Some(PluginVersion::new(1, 0, 0))),
            Arc::new(ScriptedRuntime::default()),
        );

        let resolved = ctx.resolve("render").unwrap();
        assert_eq!(resolved.source, ModuleSource::PluginDir);
    }

    #[test]
    fn allow_listed_names_never_come_from_the_plugin_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = stage_module(dir.path(), "telemetry");

        let mut runtime = ScriptedRuntime::default();
        runtime
            .versions
            .insert(path, Some(PluginVersion::new(9, 9, 9)));

        let ctx = LoadContext::new(
            "demo",
            dir.path(),
            vec!["Telemetry".to_string()],
            host_with("telemetry", Some(PluginVersion::new(1, 0, 0))),
            Arc::new(runtime),
        );

        let resolved = ctx.resolve("telemetry").unwrap();
        assert_eq!(resolved.source, ModuleSource::Host);
        assert_eq!(resolved.module.version(), Some(&PluginVersion::new(1, 0, 0)));

        // Allow-listed but absent from the host is a hard failure.
        let empty = LoadContext::new(
            "demo",
            dir.path(),
            vec!["telemetry".to_string()],
            Arc::new(HostModules::new()),
            Arc::new(ScriptedRuntime::default()),
        );
        assert!(matches!(
            empty.resolve("telemetry"),
            Err(LoadError::ModuleNotFound { .. })
        ));
    }

    #[test]
    fn resolutions_are_cached_until_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let path = stage_module(dir.path(), "render");

        let mut runtime = ScriptedRuntime::default();
        runtime.versions.insert(path, None);
        let runtime = Arc::new(runtime);

        let ctx = LoadContext::new(
            "demo",
            dir.path(),
            Vec::new(),
            Arc::new(HostModules::new()),
            runtime.clone(),
        );

        ctx.resolve("render").unwrap();
        ctx.resolve("render").unwrap();
        assert_eq!(runtime.loads.load(Ordering::SeqCst), 1);

        ctx.teardown();
        ctx.resolve("render").unwrap();
        assert_eq!(runtime.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_everywhere_is_module_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LoadContext::new(
            "demo",
            dir.path(),
            Vec::new(),
            Arc::new(HostModules::new()),
            Arc::new(ScriptedRuntime::default()),
        );
        assert!(matches!(
            ctx.resolve("absent"),
            Err(LoadError::ModuleNotFound { .. })
        ));
    }
}
