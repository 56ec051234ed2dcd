//! Workflow-facing orchestration of MCP plugin instances.
//!
//! The manager turns catalog descriptors into running instances: it
//! resolves which version a workflow should see, stages remote archives,
//! and registers every built instance in the shared container. Failures
//! during resolution or staging degrade to a logged skip; a workflow never
//! fails outright because one of its plugins is broken.

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::catalog::{
    AuthKind, CatalogReader, PackageManifest, PluginDescriptor, SourceKind, VersionEntry,
    WorkflowAssociation,
};
use crate::client::auth::AuthContext;
use crate::client::{Connector, McpPluginInstance, SseConnector, StdioConnector};
use crate::container::McpServerContainer;
use crate::loader::extract::extract_archive;
use crate::loader::staging::{prepare_clean_dir, StagingLayout};
use crate::loader::store::{blob_name, PackageStore};
use crate::logging::{AuditEntry, AuditResult, LogManager};
use crate::types::{LoadError, LogLevel, PluginVersion, WorkflowContext};

/// What an uploaded archive declares about itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInspection {
    pub name: String,
    pub description: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: IndexMap<String, String>,
    /// True when the archive ships no command and the catalog entry must
    /// supply one before the plugin can launch.
    pub needs_command_override: bool,
}

/// Builds transport connectors for new instances.
///
/// The production factory wires real transports; tests substitute scripted
/// connectors to drive lifecycle paths without processes or sockets.
pub trait ConnectorFactory: Send + Sync {
    fn stdio(
        &self,
        plugin: &str,
        command: &str,
        args: Vec<String>,
        env: IndexMap<String, String>,
        working_dir: PathBuf,
    ) -> Arc<dyn Connector>;

    fn sse(
        &self,
        plugin: &str,
        url: &str,
        auth: AuthKind,
        headers: IndexMap<String, String>,
    ) -> Arc<dyn Connector>;
}

/// Factory producing the real child-process and HTTP transports.
pub struct DefaultConnectorFactory {
    log_manager: Arc<LogManager>,
    auth: AuthContext,
}

impl DefaultConnectorFactory {
    pub fn new(log_manager: Arc<LogManager>, auth: AuthContext) -> Self {
        Self { log_manager, auth }
    }
}

impl ConnectorFactory for DefaultConnectorFactory {
    fn stdio(
        &self,
        plugin: &str,
        command: &str,
        args: Vec<String>,
        env: IndexMap<String, String>,
        working_dir: PathBuf,
    ) -> Arc<dyn Connector> {
        Arc::new(StdioConnector::new(
            plugin,
            command,
            args,
            env,
            working_dir,
            Arc::clone(&self.log_manager),
        ))
    }

    fn sse(
        &self,
        plugin: &str,
        url: &str,
        auth: AuthKind,
        headers: IndexMap<String, String>,
    ) -> Arc<dyn Connector> {
        Arc::new(SseConnector::new(
            plugin,
            url,
            auth,
            self.auth.clone(),
            headers,
        ))
    }
}

/// Manages the lifecycle of MCP plugins for workflows.
pub struct McpPluginManager {
    catalog: Arc<dyn CatalogReader>,
    container: Arc<McpServerContainer>,
    store: Option<Arc<dyn PackageStore>>,
    staging: StagingLayout,
    log_manager: Arc<LogManager>,
    factory: Arc<dyn ConnectorFactory>,
}

impl McpPluginManager {
    pub fn new(
        catalog: Arc<dyn CatalogReader>,
        log_manager: Arc<LogManager>,
        auth: AuthContext,
    ) -> Self {
        let factory: Arc<dyn ConnectorFactory> = Arc::new(DefaultConnectorFactory::new(
            Arc::clone(&log_manager),
            auth,
        ));
        Self {
            catalog,
            container: Arc::new(McpServerContainer::new()),
            store: None,
            staging: StagingLayout::new(),
            log_manager,
            factory,
        }
    }

    /// Package store for staging remote archives. Without one, plugins
    /// with a `remoteArchive` source are skipped with a warning.
    pub fn with_store(mut self, store: Arc<dyn PackageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_staging(mut self, staging: StagingLayout) -> Self {
        self.staging = staging;
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn container(&self) -> &Arc<McpServerContainer> {
        &self.container
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log_manager
    }

    /// The instance a workflow should use for `name`, building and
    /// registering it on first use.
    pub async fn plugin_for_workflow(
        &self,
        workflow: &WorkflowContext,
        name: &str,
    ) -> Option<Arc<McpPluginInstance>> {
        let Some(descriptor) = self.catalog.descriptor(name).await else {
            warn!(
                plugin = %name,
                workflow = %workflow.workflow_id,
                "plugin is not in the catalog"
            );
            return None;
        };
        let association = self.catalog.association(&workflow.workflow_id, name).await;
        let Some(version) = resolved_version(&descriptor, association.as_ref()) else {
            warn!(plugin = %name, "plugin declares no versions");
            return None;
        };
        self.ensure_instance(name, &descriptor, version).await
    }

    /// Every plugin associated with the workflow, started and initialized.
    ///
    /// A plugin that cannot be built or fails to initialize is excluded
    /// and torn down; the remaining plugins are unaffected.
    pub async fn plugins_for_workflow(
        &self,
        workflow: &WorkflowContext,
    ) -> Vec<Arc<McpPluginInstance>> {
        let associations = self.catalog.associations_for(&workflow.workflow_id).await;
        let mut ready = Vec::with_capacity(associations.len());

        for association in associations {
            let Some(instance) = self.plugin_for_workflow(workflow, &association.plugin).await
            else {
                continue;
            };
            if let Err(err) = instance.initialize(workflow).await {
                warn!(
                    plugin = %association.plugin,
                    workflow = %workflow.workflow_id,
                    error = %err,
                    "plugin failed to initialize, excluding it from the workflow"
                );
                self.log_manager
                    .add_system(
                        &association.plugin,
                        LogLevel::Error,
                        format!("initialization failed: {err}"),
                    )
                    .await;
                let version = instance.version().to_string();
                self.stop_and_remove(&association.plugin, &version).await;
                continue;
            }
            ready.push(instance);
        }
        ready
    }

    /// Loads a plugin outside any workflow: an explicit version, or the
    /// latest the catalog declares.
    pub async fn load_plugin(
        &self,
        name: &str,
        version: Option<PluginVersion>,
    ) -> Option<Arc<McpPluginInstance>> {
        let Some(descriptor) = self.catalog.descriptor(name).await else {
            warn!(plugin = %name, "plugin is not in the catalog");
            return None;
        };
        let Some(version) = version.or_else(|| descriptor.latest_version()) else {
            warn!(plugin = %name, "plugin declares no versions");
            return None;
        };
        self.ensure_instance(name, &descriptor, version).await
    }

    /// Stops and unregisters one instance. Blank arguments are rejected
    /// with a warning rather than treated as wildcards.
    pub async fn stop_and_remove(&self, name: &str, version: &str) -> bool {
        if name.trim().is_empty() {
            warn!("cannot stop a plugin with a blank name");
            return false;
        }
        if version.trim().is_empty() {
            warn!(plugin = %name, "cannot stop a plugin with a blank version");
            return false;
        }

        let removed = self.container.remove_plugin(name, version).await;
        let result = if removed {
            AuditResult::Success
        } else {
            warn!(plugin = %name, version = %version, "plugin is not registered");
            AuditResult::Skipped
        };
        if let Err(err) = self
            .log_manager
            .log_audit(AuditEntry::plugin_stop(name, version, result))
            .await
        {
            warn!(plugin = %name, error = %err, "failed to record audit entry");
        }
        removed
    }

    /// Disposes every registered instance.
    pub async fn shutdown(&self) {
        self.container.dispose_all().await;
    }

    /// Extracts an uploaded archive into the inspection area and reports
    /// what its manifest declares.
    pub async fn inspect_upload(&self, archive: &[u8]) -> Result<PackageInspection, LoadError> {
        let dir = self.staging.upload_dir("inspect");
        prepare_clean_dir(&dir)?;
        extract_archive(archive, &dir)?;
        let manifest = PackageManifest::read_from_dir(&dir)
            .map_err(|err| LoadError::extract(format!("manifest unreadable: {err}")))?
            .unwrap_or_default();
        Ok(PackageInspection {
            needs_command_override: manifest.command.trim().is_empty(),
            name: manifest.name,
            description: manifest.description,
            command: manifest.command,
            args: manifest.arguments,
            env: manifest.environment_variables,
        })
    }

    /// Returns the registered instance for `(name, version)`, building it
    /// if absent. Building races are reconciled in favor of the instance
    /// already registered.
    async fn ensure_instance(
        &self,
        name: &str,
        descriptor: &PluginDescriptor,
        version: PluginVersion,
    ) -> Option<Arc<McpPluginInstance>> {
        let version_str = version.to_string();
        if let Some(existing) = self.container.get_plugin(name, &version_str) {
            debug!(plugin = %name, version = %version_str, "reusing registered instance");
            return Some(existing);
        }

        let Some(entry) = descriptor.version_entry(version) else {
            warn!(
                plugin = %name,
                version = %version_str,
                "catalog declares no entry for the resolved version"
            );
            return None;
        };

        let instance = match descriptor.source {
            SourceKind::RemoteArchive => {
                self.build_remote_archive(name, descriptor, entry, version).await?
            }
            SourceKind::CommandOnly => self.build_command_only(name, descriptor, entry, version)?,
            SourceKind::Sse => self.build_sse(name, descriptor, entry, version)?,
        };

        if let Some(existing) = self.container.get_plugin(name, &version_str) {
            // A concurrent caller registered first; ours never started.
            instance.dispose().await;
            return Some(existing);
        }
        self.container.add_plugin(Arc::clone(&instance)).await;
        Some(instance)
    }

    /// Stages the plugin's archive from the package store and builds a
    /// subprocess instance rooted in the staged directory.
    async fn build_remote_archive(
        &self,
        name: &str,
        descriptor: &PluginDescriptor,
        entry: &VersionEntry,
        version: PluginVersion,
    ) -> Option<Arc<McpPluginInstance>> {
        let Some(store) = &self.store else {
            warn!(plugin = %name, "no package store configured, cannot stage remote archive");
            return None;
        };
        let Some(container) = descriptor.container.as_deref() else {
            warn!(plugin = %name, "remote archive plugin names no store container");
            return None;
        };

        let staging_dir = self.staging.version_dir(name, &version);
        if let Err(err) = prepare_clean_dir(&staging_dir) {
            warn!(plugin = %name, error = %err, "failed to prepare staging directory");
            return None;
        }

        let blob = blob_name(name, &version);
        let bytes = match store.fetch_archive(container, &blob).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                warn!(
                    plugin = %name,
                    container,
                    blob = %blob,
                    "archive not found in package store"
                );
                return None;
            }
            Err(err) => {
                warn!(plugin = %name, error = %err, "failed to fetch archive");
                return None;
            }
        };
        if let Err(err) = extract_archive(&bytes, &staging_dir) {
            warn!(plugin = %name, error = %err, "failed to extract archive");
            return None;
        }

        let manifest = match PackageManifest::read_from_dir(&staging_dir) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(plugin = %name, error = %err, "failed to read package manifest");
                return None;
            }
        };
        let merged = PackageManifest::merged(manifest, name, &descriptor.description, entry);
        if !merged.is_launchable() {
            warn!(plugin = %name, "staged package has no launchable command");
            return None;
        }

        let version_str = version.to_string();
        if let Err(err) = self
            .log_manager
            .log_audit(AuditEntry::package_load(name, &version_str, AuditResult::Success))
            .await
        {
            warn!(plugin = %name, error = %err, "failed to record audit entry");
        }

        let connector = self.factory.stdio(
            name,
            &merged.command,
            merged.arguments,
            merged.environment_variables,
            staging_dir,
        );
        Some(Arc::new(McpPluginInstance::new(
            name,
            merged.description,
            version,
            SourceKind::RemoteArchive,
            connector,
        )))
    }

    /// Builds a subprocess instance for a command the machine already has.
    fn build_command_only(
        &self,
        name: &str,
        descriptor: &PluginDescriptor,
        entry: &VersionEntry,
        version: PluginVersion,
    ) -> Option<Arc<McpPluginInstance>> {
        let merged = PackageManifest::merged(None, name, &descriptor.description, entry);
        if merged.command.trim().is_empty() {
            warn!(plugin = %name, "command-only plugin has no command configured");
            return None;
        }

        let working_dir = self.staging.version_dir(name, &version);
        if let Err(err) = std::fs::create_dir_all(&working_dir) {
            warn!(
                plugin = %name,
                path = %working_dir.display(),
                error = %err,
                "cannot create working directory"
            );
            return None;
        }

        let connector = self.factory.stdio(
            name,
            &merged.command,
            merged.arguments,
            merged.environment_variables,
            working_dir,
        );
        Some(Arc::new(McpPluginInstance::new(
            name,
            merged.description,
            version,
            SourceKind::CommandOnly,
            connector,
        )))
    }

    /// Builds an instance for a remote MCP endpoint. The entry's key-value
    /// bag carries request headers rather than process environment.
    fn build_sse(
        &self,
        name: &str,
        descriptor: &PluginDescriptor,
        entry: &VersionEntry,
        version: PluginVersion,
    ) -> Option<Arc<McpPluginInstance>> {
        let merged = PackageManifest::merged(None, name, &descriptor.description, entry);
        if merged.url.trim().is_empty() {
            warn!(plugin = %name, "SSE plugin has no URL configured");
            return None;
        }

        let connector = self.factory.sse(
            name,
            &merged.url,
            merged.authentication.unwrap_or_default(),
            merged.environment_variables,
        );
        Some(Arc::new(McpPluginInstance::new(
            name,
            merged.description,
            version,
            SourceKind::Sse,
            connector,
        )))
    }
}

/// Which version an association selects: the pin, unless the association
/// tracks latest (explicitly or by carrying no pin at all).
fn resolved_version(
    descriptor: &PluginDescriptor,
    association: Option<&WorkflowAssociation>,
) -> Option<PluginVersion> {
    match association {
        Some(assoc) if !assoc.always_latest => {
            assoc.pinned_version.or_else(|| descriptor.latest_version())
        }
        _ => descriptor.latest_version(),
    }
}
