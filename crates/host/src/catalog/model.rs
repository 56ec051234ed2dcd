//! Catalog document model.
//!
//! The catalog is the read model for everything loadable: MCP plugin
//! descriptors (keyed by their unique, case-sensitive name), native package
//! descriptors, and workflow associations. It is owned by operators and
//! consumed read-mostly by the managers; the only mutations this crate
//! performs are association edits.

use crate::catalog::validation::ValidationError;
use crate::types::version::PluginVersion;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from catalog loading, parsing, and lookups.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown plugin `{name}`")]
    UnknownPlugin { name: String },

    #[error("plugin `{name}` has no version {version}")]
    UnknownVersion { name: String, version: String },
}

/// How an MCP plugin's server is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceKind {
    /// A staged archive from the package store, launched as a subprocess.
    RemoteArchive,
    /// A locally available command, launched as a subprocess.
    CommandOnly,
    /// A remote endpoint reached over streamable HTTP or SSE.
    Sse,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::RemoteArchive => "remote-archive",
            Self::CommandOnly => "command-only",
            Self::Sse => "sse",
        };
        f.write_str(label)
    }
}

/// Authentication applied to outbound requests for SSE plugins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthKind {
    #[default]
    None,
    ManagedIdentity,
    UserBearerToken,
}

/// One available version of an MCP plugin, with per-version overrides.
///
/// Non-empty override fields win over the package manifest during merge
/// (see the manifest module).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VersionEntry {
    pub version: PluginVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_env_map")]
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthKind>,
}

impl VersionEntry {
    pub fn new(version: PluginVersion) -> Self {
        Self {
            version,
            command: None,
            args: Vec::new(),
            env: IndexMap::new(),
            url: None,
            authentication: None,
        }
    }

    /// Effective authentication kind; absent means none.
    pub fn auth_kind(&self) -> AuthKind {
        self.authentication.unwrap_or_default()
    }
}

/// An MCP plugin descriptor. The catalog key is the plugin's unique name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PluginDescriptor {
    #[serde(default)]
    pub description: String,
    pub source: SourceKind,
    /// Package-store container holding this plugin's archives.
    /// Required for `remoteArchive` sources, ignored otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<VersionEntry>,
}

impl PluginDescriptor {
    /// The highest version entry, if any exist.
    pub fn latest_version(&self) -> Option<PluginVersion> {
        self.versions.iter().map(|entry| entry.version).max()
    }

    /// The entry for an exact version.
    pub fn version_entry(&self, version: PluginVersion) -> Option<&VersionEntry> {
        self.versions.iter().find(|entry| entry.version == version)
    }
}

/// A native package descriptor: versioned shared-library archives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PackageDescriptor {
    #[serde(default)]
    pub description: String,
    /// Package-store container holding this package's archives.
    pub container: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<PluginVersion>,
}

impl PackageDescriptor {
    pub fn latest_version(&self) -> Option<PluginVersion> {
        self.versions.iter().copied().max()
    }
}

/// Binds a workflow to a plugin or package, pinned or tracking latest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkflowAssociation {
    pub workflow_id: String,
    pub plugin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_version: Option<PluginVersion>,
    #[serde(default)]
    pub always_latest: bool,
}

/// The whole catalog document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Catalog {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub plugins: IndexMap<String, PluginDescriptor>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub packages: IndexMap<String, PackageDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub associations: Vec<WorkflowAssociation>,
}

impl Catalog {
    pub fn descriptor(&self, name: &str) -> Option<&PluginDescriptor> {
        self.plugins.get(name)
    }

    pub fn package(&self, name: &str) -> Option<&PackageDescriptor> {
        self.packages.get(name)
    }

    pub fn association(&self, workflow_id: &str, plugin: &str) -> Option<&WorkflowAssociation> {
        self.associations
            .iter()
            .find(|a| a.workflow_id == workflow_id && a.plugin == plugin)
    }

    pub fn associations_for(&self, workflow_id: &str) -> Vec<&WorkflowAssociation> {
        self.associations
            .iter()
            .filter(|a| a.workflow_id == workflow_id)
            .collect()
    }

    /// Resolves which version an association selects for a plugin.
    ///
    /// Tracking latest (explicitly, or implicitly by carrying no pin) uses
    /// the descriptor's highest version; otherwise the pin wins. `None`
    /// means the plugin is unknown or has no versions at all.
    pub fn resolve_version(
        &self,
        plugin: &str,
        association: Option<&WorkflowAssociation>,
    ) -> Option<PluginVersion> {
        let descriptor = self.descriptor(plugin)?;
        match association {
            Some(assoc) if !assoc.always_latest => assoc
                .pinned_version
                .or_else(|| descriptor.latest_version()),
            _ => descriptor.latest_version(),
        }
    }

    /// Adds or updates a workflow association.
    ///
    /// The plugin must exist and a pinned version must be one of its
    /// declared versions. An existing association for the same
    /// (workflow, plugin) pair has its pin replaced in place.
    pub fn associate(
        &mut self,
        workflow_id: &str,
        plugin: &str,
        pinned_version: Option<PluginVersion>,
        always_latest: bool,
    ) -> Result<(), CatalogError> {
        let known_version = |version: PluginVersion| {
            self.plugins
                .get(plugin)
                .map(|d| d.version_entry(version).is_some())
                .or_else(|| {
                    self.packages
                        .get(plugin)
                        .map(|p| p.versions.contains(&version))
                })
        };

        if !self.plugins.contains_key(plugin) && !self.packages.contains_key(plugin) {
            return Err(CatalogError::UnknownPlugin {
                name: plugin.to_string(),
            });
        }
        if let Some(version) = pinned_version
            && known_version(version) != Some(true)
        {
            return Err(CatalogError::UnknownVersion {
                name: plugin.to_string(),
                version: version.to_string(),
            });
        }

        if let Some(existing) = self
            .associations
            .iter_mut()
            .find(|a| a.workflow_id == workflow_id && a.plugin == plugin)
        {
            existing.pinned_version = pinned_version;
            existing.always_latest = always_latest;
        } else {
            self.associations.push(WorkflowAssociation {
                workflow_id: workflow_id.to_string(),
                plugin: plugin.to_string(),
                pinned_version,
                always_latest,
            });
        }
        Ok(())
    }

    /// Removes a workflow association; absent associations are a no-op.
    pub fn disassociate(&mut self, workflow_id: &str, plugin: &str) {
        self.associations
            .retain(|a| !(a.workflow_id == workflow_id && a.plugin == plugin));
    }
}

/// Accepts an environment map either as a JSON object or as a list of
/// `KEY=VALUE` strings.
fn deserialize_env_map<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum EnvForm {
        Map(IndexMap<String, String>),
        List(Vec<String>),
    }

    match EnvForm::deserialize(deserializer)? {
        EnvForm::Map(map) => Ok(map),
        EnvForm::List(items) => {
            let mut map = IndexMap::with_capacity(items.len());
            for item in items {
                let (key, value) = item.split_once('=').ok_or_else(|| {
                    D::Error::custom(format!("env entry `{item}` is not KEY=VALUE"))
                })?;
                map.insert(key.to_string(), value.to_string());
            }
            Ok(map)
        }
    }
}
