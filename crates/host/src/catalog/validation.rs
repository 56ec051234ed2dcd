//! Catalog validation: names, environment keys, and referential checks.

use crate::catalog::model::{Catalog, SourceKind};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static PLUGIN_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9._-]+$").expect("plugin name regex must compile"));

static ENV_KEY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("env key regex must compile"));

/// A catalog document failed a structural or referential check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid plugin name `{name}`: use lowercase letters, digits, `.`, `_`, `-`")]
    InvalidPluginName { name: String },

    #[error("invalid environment key `{key}` for plugin `{plugin}`")]
    InvalidEnvKey { plugin: String, key: String },

    #[error("plugin `{name}` declares no versions")]
    NoVersions { name: String },

    #[error("plugin `{name}` uses a remote archive source but has no container")]
    MissingContainer { name: String },

    #[error("plugin `{name}` version {version} uses an sse source but has no url")]
    MissingUrl { name: String, version: String },

    #[error("association for workflow `{workflow}` references unknown plugin `{plugin}`")]
    UnknownAssociationPlugin { workflow: String, plugin: String },

    #[error(
        "association for workflow `{workflow}` pins `{plugin}` to missing version {version}"
    )]
    UnknownAssociationVersion {
        workflow: String,
        plugin: String,
        version: String,
    },
}

/// Checks a plugin or package name against the naming rule.
pub fn validate_plugin_name(name: &str) -> Result<(), ValidationError> {
    if PLUGIN_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::InvalidPluginName {
            name: name.to_string(),
        })
    }
}

/// Checks an environment variable key.
pub fn validate_env_key(plugin: &str, key: &str) -> Result<(), ValidationError> {
    if ENV_KEY_REGEX.is_match(key) {
        Ok(())
    } else {
        Err(ValidationError::InvalidEnvKey {
            plugin: plugin.to_string(),
            key: key.to_string(),
        })
    }
}

/// Validates a whole catalog document, failing on the first problem.
pub fn validate_catalog(catalog: &Catalog) -> Result<(), ValidationError> {
    for (name, descriptor) in &catalog.plugins {
        validate_plugin_name(name)?;
        if descriptor.versions.is_empty() {
            return Err(ValidationError::NoVersions { name: name.clone() });
        }
        if descriptor.source == SourceKind::RemoteArchive
            && descriptor
                .container
                .as_deref()
                .is_none_or(|c| c.trim().is_empty())
        {
            return Err(ValidationError::MissingContainer { name: name.clone() });
        }
        for entry in &descriptor.versions {
            for key in entry.env.keys() {
                validate_env_key(name, key)?;
            }
            if descriptor.source == SourceKind::Sse
                && entry.url.as_deref().is_none_or(|u| u.trim().is_empty())
            {
                return Err(ValidationError::MissingUrl {
                    name: name.clone(),
                    version: entry.version.to_string(),
                });
            }
        }
    }

    for (name, package) in &catalog.packages {
        validate_plugin_name(name)?;
        if package.versions.is_empty() {
            return Err(ValidationError::NoVersions { name: name.clone() });
        }
    }

    for assoc in &catalog.associations {
        let descriptor_versions: Option<Vec<_>> = catalog
            .descriptor(&assoc.plugin)
            .map(|d| d.versions.iter().map(|e| e.version).collect())
            .or_else(|| catalog.package(&assoc.plugin).map(|p| p.versions.clone()));

        let Some(versions) = descriptor_versions else {
            return Err(ValidationError::UnknownAssociationPlugin {
                workflow: assoc.workflow_id.clone(),
                plugin: assoc.plugin.clone(),
            });
        };
        if let Some(pin) = assoc.pinned_version
            && !versions.contains(&pin)
        {
            return Err(ValidationError::UnknownAssociationVersion {
                workflow: assoc.workflow_id.clone(),
                plugin: assoc.plugin.clone(),
                version: pin.to_string(),
            });
        }
    }

    Ok(())
}
