//! Catalog access used by the managers, plus association editing.

use crate::catalog::io::{load_catalog_from_path, save_catalog_to_path};
use crate::catalog::model::{
    Catalog, CatalogError, PackageDescriptor, PluginDescriptor, WorkflowAssociation,
};
use crate::types::version::PluginVersion;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Read access to the plugin/version catalog.
///
/// The managers consume the catalog only through this boundary so tests and
/// alternative backends can stand in for the file-backed store.
#[async_trait]
pub trait CatalogReader: Send + Sync {
    /// The descriptor for a named MCP plugin.
    async fn descriptor(&self, name: &str) -> Option<PluginDescriptor>;

    /// The association binding a workflow to a plugin, if any.
    async fn association(&self, workflow_id: &str, plugin: &str) -> Option<WorkflowAssociation>;

    /// All associations declared for a workflow.
    async fn associations_for(&self, workflow_id: &str) -> Vec<WorkflowAssociation>;

    /// Every native package descriptor, with its name. Fallible so remote
    /// catalog backends can surface read failures to the load pass.
    async fn packages(&self) -> Result<Vec<(String, PackageDescriptor)>, CatalogError>;
}

/// File-backed catalog with in-memory reads and explicit persistence.
pub struct CatalogService {
    path: PathBuf,
    catalog: RwLock<Catalog>,
}

impl CatalogService {
    /// Loads the catalog at `path`; a missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let catalog = load_catalog_from_path(&path)?;
        Ok(Self {
            path,
            catalog: RwLock::new(catalog),
        })
    }

    /// Wraps an already-built catalog without touching disk.
    pub fn from_catalog(catalog: Catalog) -> Self {
        Self {
            path: PathBuf::new(),
            catalog: RwLock::new(catalog),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the backing file, replacing the in-memory document.
    pub fn reload(&self) -> Result<(), CatalogError> {
        let fresh = load_catalog_from_path(&self.path)?;
        *self.catalog.write().expect("catalog lock poisoned") = fresh;
        Ok(())
    }

    /// Runs a closure against the current document.
    pub fn with_catalog<T>(&self, f: impl FnOnce(&Catalog) -> T) -> T {
        f(&self.catalog.read().expect("catalog lock poisoned"))
    }

    /// Adds or updates an association and persists the document.
    pub fn associate(
        &self,
        workflow_id: &str,
        plugin: &str,
        pinned_version: Option<PluginVersion>,
        always_latest: bool,
    ) -> Result<(), CatalogError> {
        let snapshot = {
            let mut catalog = self.catalog.write().expect("catalog lock poisoned");
            catalog.associate(workflow_id, plugin, pinned_version, always_latest)?;
            catalog.clone()
        };
        self.persist(&snapshot)
    }

    /// Removes an association (no-op when absent) and persists.
    pub fn disassociate(&self, workflow_id: &str, plugin: &str) -> Result<(), CatalogError> {
        let snapshot = {
            let mut catalog = self.catalog.write().expect("catalog lock poisoned");
            catalog.disassociate(workflow_id, plugin);
            catalog.clone()
        };
        self.persist(&snapshot)
    }

    fn persist(&self, catalog: &Catalog) -> Result<(), CatalogError> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        save_catalog_to_path(catalog, &self.path)
    }
}

#[async_trait]
impl CatalogReader for CatalogService {
    async fn descriptor(&self, name: &str) -> Option<PluginDescriptor> {
        self.with_catalog(|c| c.descriptor(name).cloned())
    }

    async fn association(&self, workflow_id: &str, plugin: &str) -> Option<WorkflowAssociation> {
        self.with_catalog(|c| c.association(workflow_id, plugin).cloned())
    }

    async fn associations_for(&self, workflow_id: &str) -> Vec<WorkflowAssociation> {
        self.with_catalog(|c| {
            c.associations_for(workflow_id)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    async fn packages(&self) -> Result<Vec<(String, PackageDescriptor)>, CatalogError> {
        Ok(self.with_catalog(|c| {
            c.packages
                .iter()
                .map(|(name, package)| (name.clone(), package.clone()))
                .collect()
        }))
    }
}
