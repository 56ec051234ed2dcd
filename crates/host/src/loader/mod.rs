//! Dynamic loading of versioned native plugin packages.
//!
//! [`PackageLoader`] drives the pipeline: read the catalog's package
//! family, then per plugin version stage a clean directory, fetch and
//! extract the archive, load the primary module in its own
//! [`context::LoadContext`], discover capabilities, run registration
//! hooks, and record the result. One bad version never aborts the batch.

pub mod abi;
pub mod context;
pub mod extract;
pub mod runtime;
pub mod staging;
pub mod store;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::catalog::{CatalogReader, PackageDescriptor, WorkflowAssociation};
use crate::registry::{HostServices, PluginRegistry};
use crate::types::{LoadError, PluginVersion};

use abi::{CapabilityDecl, PluginCapability, select_capabilities};
use context::{HostModules, LoadContext};
use extract::extract_archive;
use runtime::{ModuleRuntime, module_file_name, module_name_from_path};
use staging::{StagingLayout, prepare_clean_dir};
use store::{PackageStore, blob_name};

/// One successfully loaded plugin package version.
pub struct LoadedPackage {
    pub name: String,
    pub version: PluginVersion,
    pub staging_dir: PathBuf,
    /// Capabilities matching the host contract, possibly empty.
    pub capabilities: Vec<CapabilityDecl>,
    context: LoadContext,
    primary: Arc<dyn runtime::LoadedModule>,
}

impl LoadedPackage {
    /// The package's module resolution context.
    pub fn context(&self) -> &LoadContext {
        &self.context
    }

    pub fn primary_module(&self) -> &Arc<dyn runtime::LoadedModule> {
        &self.primary
    }
}

/// A capability resolved for a workflow, with its provenance.
#[derive(Clone)]
pub struct ResolvedCapability {
    pub plugin: String,
    pub version: PluginVersion,
    pub decl: CapabilityDecl,
}

/// Loads every catalog-declared package version and serves lookups.
pub struct PackageLoader {
    catalog: Arc<dyn CatalogReader>,
    store: Arc<dyn PackageStore>,
    runtime: Arc<dyn ModuleRuntime>,
    registry: Arc<PluginRegistry>,
    host_modules: Arc<HostModules>,
    staging: StagingLayout,
    shared_modules: Vec<String>,
    load_once: OnceCell<()>,
    packages: RwLock<HashMap<String, HashMap<PluginVersion, Arc<LoadedPackage>>>>,
}

impl PackageLoader {
    pub fn new(
        catalog: Arc<dyn CatalogReader>,
        store: Arc<dyn PackageStore>,
        runtime: Arc<dyn ModuleRuntime>,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            catalog,
            store,
            runtime,
            registry,
            host_modules: Arc::new(HostModules::new()),
            staging: StagingLayout::new(),
            shared_modules: Vec::new(),
            load_once: OnceCell::new(),
            packages: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_staging(mut self, staging: StagingLayout) -> Self {
        self.staging = staging;
        self
    }

    /// Module names resolved from the host for every package.
    pub fn with_shared_modules(mut self, names: Vec<String>) -> Self {
        self.shared_modules = names;
        self
    }

    /// The host-side module table packages resolve against.
    pub fn host_modules(&self) -> &Arc<HostModules> {
        &self.host_modules
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Runs the full load pass exactly once.
    ///
    /// Concurrent callers share a single pass; late callers await the
    /// in-flight one instead of starting a second. A catalog read failure
    /// is logged and still completes the pass; per-version failures are
    /// logged and skipped.
    pub async fn ensure_loaded(&self) {
        self.load_once
            .get_or_init(|| async {
                self.load_all().await;
            })
            .await;
    }

    async fn load_all(&self) {
        let packages = match self.catalog.packages().await {
            Ok(packages) => packages,
            Err(err) => {
                warn!(error = %err, "package catalog unavailable, skipping native package load");
                return;
            }
        };

        for (name, descriptor) in packages {
            for version in descriptor.versions.clone() {
                if let Err(err) = self.load_version(&name, &descriptor, version).await {
                    warn!(
                        plugin = %name,
                        version = %version,
                        error = %err,
                        "failed to load package version"
                    );
                }
            }
        }
    }

    async fn load_version(
        &self,
        name: &str,
        descriptor: &PackageDescriptor,
        version: PluginVersion,
    ) -> Result<(), LoadError> {
        let staging_dir = self.staging.version_dir(name, &version);
        prepare_clean_dir(&staging_dir)?;

        let blob = blob_name(name, &version);
        let Some(archive) = self
            .store
            .fetch_archive(&descriptor.container, &blob)
            .await?
        else {
            info!(
                plugin = name,
                version = %version,
                blob = %blob,
                "no archive published for version, skipping"
            );
            return Ok(());
        };

        extract_archive(&archive, &staging_dir)?;

        let primary_path = find_primary_module(&staging_dir)
            .ok_or_else(|| LoadError::missing_primary(name, version.to_string()))?;

        let context = LoadContext::new(
            name,
            &staging_dir,
            self.shared_modules.iter().cloned(),
            self.host_modules.clone(),
            self.runtime.clone(),
        );

        let primary = self.runtime.load(&primary_path)?;

        // Pre-warm the remaining modules through resolution so copies the
        // host already holds at an equal-or-higher version are shared.
        for path in module_files_in(&staging_dir) {
            if path == primary_path {
                continue;
            }
            if let Some(module_name) = module_name_from_path(&path) {
                context.resolve(&module_name)?;
            }
        }

        let capabilities = select_capabilities(primary.capabilities());
        if capabilities.is_empty() {
            let declared: Vec<&str> = primary
                .capabilities()
                .iter()
                .map(|decl| decl.contract.as_str())
                .collect();
            warn!(
                plugin = name,
                version = %version,
                declared = ?declared,
                "no declared capability matched the host contract"
            );
        }

        for decl in &capabilities {
            let instance: Arc<dyn PluginCapability> = (decl.construct)().into();
            self.registry
                .register(format!("{}/{}", name, decl.type_name), instance, true);
        }

        let mut services = HostServices::new(self.registry.clone(), format!("{name}@{version}"));
        for hook in primary.hooks() {
            hook(&mut services);
        }

        let package = Arc::new(LoadedPackage {
            name: name.to_string(),
            version,
            staging_dir,
            capabilities,
            context,
            primary,
        });

        let replaced = self
            .packages
            .write()
            .expect("package table lock poisoned")
            .entry(name.to_string())
            .or_default()
            .insert(version, package)
            .is_some();
        if replaced {
            info!(plugin = name, version = %version, "replaced previously loaded package version");
        }
        info!(plugin = name, version = %version, "loaded native package");
        Ok(())
    }

    /// A loaded package by exact name and version.
    pub fn package(&self, name: &str, version: &PluginVersion) -> Option<Arc<LoadedPackage>> {
        self.packages
            .read()
            .expect("package table lock poisoned")
            .get(name)
            .and_then(|versions| versions.get(version))
            .cloned()
    }

    /// Loaded versions of a package, ascending.
    pub fn loaded_versions(&self, name: &str) -> Vec<PluginVersion> {
        let mut versions: Vec<PluginVersion> = self
            .packages
            .read()
            .expect("package table lock poisoned")
            .get(name)
            .map(|table| table.keys().copied().collect())
            .unwrap_or_default();
        versions.sort();
        versions
    }

    /// Capabilities available to a workflow, following its associations.
    ///
    /// Pinned associations select that exact loaded version; the rest take
    /// the highest loaded one. Associations whose package failed to load
    /// contribute nothing.
    pub async fn capabilities_for_workflow(&self, workflow_id: &str) -> Vec<ResolvedCapability> {
        self.ensure_loaded().await;

        let mut out = Vec::new();
        for association in self.catalog.associations_for(workflow_id).await {
            let Some(package) = self.select_for_association(&association) else {
                continue;
            };
            for decl in &package.capabilities {
                out.push(ResolvedCapability {
                    plugin: package.name.clone(),
                    version: package.version,
                    decl: decl.clone(),
                });
            }
        }
        out
    }

    fn select_for_association(
        &self,
        association: &WorkflowAssociation,
    ) -> Option<Arc<LoadedPackage>> {
        let table = self.packages.read().expect("package table lock poisoned");
        let versions = table.get(&association.plugin)?;
        if let Some(pinned) = association.pinned_version
            && !association.always_latest
        {
            return versions.get(&pinned).cloned();
        }
        versions
            .iter()
            .max_by_key(|(version, _)| **version)
            .map(|(_, package)| package.clone())
    }
}

fn module_files_in(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| module_name_from_path(path).is_some())
        .collect();
    files.sort();
    files
}

/// Picks the module a package is loaded through.
///
/// A directory with exactly one sidecar names its primary module; with
/// zero or several, the first module file in name order wins.
fn find_primary_module(dir: &Path) -> Option<PathBuf> {
    let entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();

    let mut sidecar_named: Vec<PathBuf> = entries
        .iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?;
            let stem = file_name.strip_suffix(".module.json")?;
            let module = dir.join(module_file_name(stem));
            module.exists().then_some(module)
        })
        .collect();
    if sidecar_named.len() == 1 {
        return sidecar_named.pop();
    }

    module_files_in(dir).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogError, CatalogService, PluginDescriptor};
    use crate::loader::abi::{CAPABILITY_CONTRACT, RegistrationHook};
    use crate::loader::runtime::{
        LibloadingRuntime, LoadedModule, SidecarMetadata, sidecar_file_name,
    };
    use crate::types::StoreError;
    use async_trait::async_trait;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::collections::HashSet;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop;

    impl PluginCapability for Noop {
        fn name(&self) -> &str {
            "noop"
        }
    }

    fn make_noop() -> Box<dyn PluginCapability> {
        Box::new(Noop)
    }

    fn install_marker(services: &mut HostServices) {
        let key = format!("{}/marker", services.scope);
        services.registry.register(key, make_noop().into(), true);
    }

    struct FakeModule {
        name: String,
        version: Option<PluginVersion>,
        capabilities: Vec<CapabilityDecl>,
        hooks: Vec<RegistrationHook>,
    }

    impl LoadedModule for FakeModule {
        fn name(&self) -> &str {
            &self.name
        }

        fn version(&self) -> Option<&PluginVersion> {
            self.version.as_ref()
        }

        fn capabilities(&self) -> &[CapabilityDecl] {
            &self.capabilities
        }

        fn hooks(&self) -> &[RegistrationHook] {
            &self.hooks
        }
    }

    /// Loads modules by reading real sidecars; declarations are scripted
    /// per module name.
    #[derive(Default)]
    struct ScriptedRuntime {
        declarations: HashMap<String, Vec<(String, String)>>,
        hook_modules: HashSet<String>,
        loads: AtomicUsize,
    }

    impl ModuleRuntime for ScriptedRuntime {
        fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let (name, version) = match LibloadingRuntime.probe(path)? {
                Some(meta) => (meta.name, meta.version),
                None => (module_name_from_path(path).unwrap(), None),
            };
            let capabilities = self
                .declarations
                .get(&name)
                .map(|decls| {
                    decls
                        .iter()
                        .map(|(contract, type_name)| CapabilityDecl {
                            contract: contract.clone(),
                            type_name: type_name.clone(),
                            construct: make_noop,
                        })
                        .collect()
                })
                .unwrap_or_default();
            let hooks: Vec<RegistrationHook> = if self.hook_modules.contains(&name) {
                vec![install_marker]
            } else {
                Vec::new()
            };
            Ok(Arc::new(FakeModule {
                name,
                version,
                capabilities,
                hooks,
            }))
        }

        fn probe(&self, path: &Path) -> Result<Option<SidecarMetadata>, LoadError> {
            LibloadingRuntime.probe(path)
        }
    }

    struct MemoryStore {
        blobs: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl PackageStore for MemoryStore {
        async fn fetch_archive(
            &self,
            container: &str,
            blob: &str,
        ) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(self.blobs.get(&format!("{container}/{blob}")).cloned())
        }
    }

    struct FailingCatalog;

    #[async_trait]
    impl CatalogReader for FailingCatalog {
        async fn descriptor(&self, _name: &str) -> Option<PluginDescriptor> {
            None
        }

        async fn association(
            &self,
            _workflow_id: &str,
            _plugin: &str,
        ) -> Option<WorkflowAssociation> {
            None
        }

        async fn associations_for(&self, _workflow_id: &str) -> Vec<WorkflowAssociation> {
            Vec::new()
        }

        async fn packages(&self) -> Result<Vec<(String, PackageDescriptor)>, CatalogError> {
            Err(CatalogError::Io {
                path: "remote".into(),
                source: std::io::Error::other("catalog offline"),
            })
        }
    }

    fn archive_with(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        let tarball = builder.into_inner().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tarball).unwrap();
        encoder.finish().unwrap()
    }

    fn render_pack_archive() -> Vec<u8> {
        archive_with(&[
            (module_file_name("aurora_core").as_str(), b"".as_slice()),
            (
                sidecar_file_name("aurora_core").as_str(),
                br#"{"name":"aurora_core","version":"2.0.0"}"#.as_slice(),
            ),
            (module_file_name("imaging").as_str(), b"".as_slice()),
            (
                sidecar_file_name("imaging").as_str(),
                br#"{"name":"imaging","version":"2.0.0"}"#.as_slice(),
            ),
        ])
    }

    fn catalog_with_render_pack() -> Arc<CatalogService> {
        let mut catalog = Catalog::default();
        catalog.packages.insert(
            "render-pack".to_string(),
            PackageDescriptor {
                description: String::new(),
                container: "plugins".to_string(),
                versions: vec![PluginVersion::new(2, 0, 0)],
            },
        );
        catalog.associations.push(WorkflowAssociation {
            workflow_id: "wf-render".to_string(),
            plugin: "render-pack".to_string(),
            pinned_version: Some(PluginVersion::new(2, 0, 0)),
            always_latest: false,
        });
        Arc::new(CatalogService::from_catalog(catalog))
    }

    fn store_with_render_pack() -> Arc<MemoryStore> {
        let mut blobs = HashMap::new();
        blobs.insert(
            "plugins/render-pack/render-pack-2.0.0.tar.gz".to_string(),
            render_pack_archive(),
        );
        Arc::new(MemoryStore { blobs })
    }

    fn loader_with(
        runtime: Arc<ScriptedRuntime>,
        staging_root: &Path,
    ) -> PackageLoader {
        PackageLoader::new(
            catalog_with_render_pack(),
            store_with_render_pack(),
            runtime,
            Arc::new(PluginRegistry::new()),
        )
        .with_staging(StagingLayout::with_root(staging_root))
    }

    fn aurora_runtime() -> Arc<ScriptedRuntime> {
        let mut runtime = ScriptedRuntime::default();
        runtime.declarations.insert(
            "aurora_core".to_string(),
            vec![(CAPABILITY_CONTRACT.to_string(), "Aurora".to_string())],
        );
        Arc::new(runtime)
    }

    #[tokio::test]
    async fn loads_packages_and_discovers_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader_with(aurora_runtime(), dir.path());

        loader.ensure_loaded().await;

        let package = loader
            .package("render-pack", &PluginVersion::new(2, 0, 0))
            .expect("package loaded");
        assert_eq!(package.capabilities.len(), 1);
        assert_eq!(package.capabilities[0].type_name, "Aurora");
        assert!(loader.registry().resolve("render-pack/Aurora").is_some());
        assert_eq!(
            loader.loaded_versions("render-pack"),
            vec![PluginVersion::new(2, 0, 0)]
        );
    }

    #[tokio::test]
    async fn newer_staged_sibling_is_resolved_from_the_package() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader_with(aurora_runtime(), dir.path());
        loader.host_modules().register(Arc::new(FakeModule {
            name: "imaging".to_string(),
            version: Some(PluginVersion::new(1, 0, 0)),
            capabilities: Vec::new(),
            hooks: Vec::new(),
        }));

        loader.ensure_loaded().await;

        let package = loader
            .package("render-pack", &PluginVersion::new(2, 0, 0))
            .unwrap();
        let resolved = package.context().resolve("imaging").unwrap();
        assert_eq!(resolved.source, context::ModuleSource::PluginDir);
        assert_eq!(
            resolved.module.version(),
            Some(&PluginVersion::new(2, 0, 0))
        );
    }

    #[tokio::test]
    async fn host_copy_wins_at_equal_or_higher_version() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader_with(aurora_runtime(), dir.path());
        loader.host_modules().register(Arc::new(FakeModule {
            name: "imaging".to_string(),
            version: Some(PluginVersion::new(3, 0, 0)),
            capabilities: Vec::new(),
            hooks: Vec::new(),
        }));

        loader.ensure_loaded().await;

        let package = loader
            .package("render-pack", &PluginVersion::new(2, 0, 0))
            .unwrap();
        let resolved = package.context().resolve("imaging").unwrap();
        assert_eq!(resolved.source, context::ModuleSource::Host);
        assert_eq!(
            resolved.module.version(),
            Some(&PluginVersion::new(3, 0, 0))
        );
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_load_pass() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = aurora_runtime();
        let loader = loader_with(runtime.clone(), dir.path());

        tokio::join!(loader.ensure_loaded(), loader.ensure_loaded());
        loader.ensure_loaded().await;

        // One primary plus one pre-warmed sibling, loaded exactly once.
        assert_eq!(runtime.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reloading_a_version_keeps_one_entry_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader_with(aurora_runtime(), dir.path());
        let descriptor = PackageDescriptor {
            description: String::new(),
            container: "plugins".to_string(),
            versions: vec![PluginVersion::new(2, 0, 0)],
        };

        let version = PluginVersion::new(2, 0, 0);
        loader
            .load_version("render-pack", &descriptor, version)
            .await
            .unwrap();
        loader
            .load_version("render-pack", &descriptor, version)
            .await
            .unwrap();

        assert_eq!(loader.loaded_versions("render-pack").len(), 1);
    }

    #[tokio::test]
    async fn renamespaced_contracts_are_still_discovered() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = ScriptedRuntime::default();
        runtime.declarations.insert(
            "aurora_core".to_string(),
            vec![("vendor.fork.Capability".to_string(), "Aurora".to_string())],
        );
        let loader = loader_with(Arc::new(runtime), dir.path());

        loader.ensure_loaded().await;

        let package = loader
            .package("render-pack", &PluginVersion::new(2, 0, 0))
            .unwrap();
        assert_eq!(package.capabilities.len(), 1);
    }

    #[tokio::test]
    async fn zero_matching_capabilities_still_records_the_package() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = ScriptedRuntime::default();
        runtime.declarations.insert(
            "aurora_core".to_string(),
            vec![("unrelated.Widget".to_string(), "W".to_string())],
        );
        let loader = loader_with(Arc::new(runtime), dir.path());

        loader.ensure_loaded().await;

        let package = loader
            .package("render-pack", &PluginVersion::new(2, 0, 0))
            .unwrap();
        assert!(package.capabilities.is_empty());
    }

    #[tokio::test]
    async fn registration_hooks_run_with_the_load_scope() {
        let dir = tempfile::tempdir().unwrap();
        let mut scripted = ScriptedRuntime::default();
        scripted.declarations.insert(
            "aurora_core".to_string(),
            vec![(CAPABILITY_CONTRACT.to_string(), "Aurora".to_string())],
        );
        scripted.hook_modules.insert("aurora_core".to_string());
        let loader = loader_with(Arc::new(scripted), dir.path());

        loader.ensure_loaded().await;

        assert!(
            loader
                .registry()
                .resolve("render-pack@2.0.0/marker")
                .is_some()
        );
    }

    #[tokio::test]
    async fn catalog_failure_completes_the_pass_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loader = PackageLoader::new(
            Arc::new(FailingCatalog),
            store_with_render_pack(),
            aurora_runtime(),
            Arc::new(PluginRegistry::new()),
        )
        .with_staging(StagingLayout::with_root(dir.path()));

        loader.ensure_loaded().await;
        assert!(loader.loaded_versions("render-pack").is_empty());
    }

    #[tokio::test]
    async fn missing_archive_skips_the_version() {
        let dir = tempfile::tempdir().unwrap();
        let loader = PackageLoader::new(
            catalog_with_render_pack(),
            Arc::new(MemoryStore {
                blobs: HashMap::new(),
            }),
            aurora_runtime(),
            Arc::new(PluginRegistry::new()),
        )
        .with_staging(StagingLayout::with_root(dir.path()));

        loader.ensure_loaded().await;
        assert!(
            loader
                .package("render-pack", &PluginVersion::new(2, 0, 0))
                .is_none()
        );
    }

    #[tokio::test]
    async fn workflow_capabilities_follow_pinned_associations() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader_with(aurora_runtime(), dir.path());

        let resolved = loader.capabilities_for_workflow("wf-render").await;
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].plugin, "render-pack");
        assert_eq!(resolved[0].version, PluginVersion::new(2, 0, 0));
        assert_eq!(resolved[0].decl.type_name, "Aurora");

        assert!(loader.capabilities_for_workflow("wf-unknown").await.is_empty());
    }
}
