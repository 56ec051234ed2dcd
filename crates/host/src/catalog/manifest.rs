//! Package manifest (`manifest.json`) and its merge with catalog overrides.

use crate::catalog::model::{AuthKind, CatalogError, VersionEntry};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name looked up in an extracted archive's root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Self-description shipped inside a plugin archive.
///
/// Every field is optional in the file; merging with the catalog fills the
/// gaps and per-version overrides win where they are non-empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageManifest {
    pub name: String,
    pub description: String,
    pub command: String,
    pub arguments: Vec<String>,
    pub environment_variables: IndexMap<String, String>,
    pub url: String,
    pub authentication: Option<AuthKind>,
}

impl PackageManifest {
    /// Reads `manifest.json` from an extracted archive directory.
    ///
    /// A missing file is not an error; the caller synthesizes the manifest
    /// from catalog fields instead.
    pub fn read_from_dir(dir: &Path) -> Result<Option<Self>, CatalogError> {
        let path = dir.join(MANIFEST_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CatalogError::Io { path, source: err }),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Merges catalog data over a manifest read from an archive.
    ///
    /// Precedence: an empty manifest name or description falls back to the
    /// catalog; a non-empty per-version command or argument list replaces the
    /// manifest's; per-version environment entries overwrite same-named
    /// manifest entries; per-version URL and authentication, when present,
    /// replace the manifest's.
    pub fn merged(
        manifest: Option<Self>,
        plugin_name: &str,
        plugin_description: &str,
        entry: &VersionEntry,
    ) -> Self {
        let mut merged = manifest.unwrap_or_default();

        if merged.name.trim().is_empty() {
            merged.name = plugin_name.to_string();
        }
        if merged.description.trim().is_empty() {
            merged.description = plugin_description.to_string();
        }
        if let Some(command) = &entry.command
            && !command.trim().is_empty()
        {
            merged.command = command.clone();
        }
        if !entry.args.is_empty() {
            merged.arguments = entry.args.clone();
        }
        for (key, value) in &entry.env {
            merged
                .environment_variables
                .insert(key.clone(), value.clone());
        }
        if let Some(url) = &entry.url
            && !url.trim().is_empty()
        {
            merged.url = url.clone();
        }
        if entry.authentication.is_some() {
            merged.authentication = entry.authentication;
        }

        merged
    }

    /// True when the merged result can launch a subprocess plugin.
    pub fn is_launchable(&self) -> bool {
        !self.name.trim().is_empty() && !self.command.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::version::PluginVersion;

    fn entry_with(
        command: Option<&str>,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> VersionEntry {
        let mut entry = VersionEntry::new(PluginVersion::new(1, 0, 0));
        entry.command = command.map(str::to_string);
        entry.args = args.iter().map(|a| a.to_string()).collect();
        entry.env = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        entry
    }

    #[test]
    fn merge_fills_empty_fields_from_catalog() {
        let manifest = PackageManifest {
            command: "server".into(),
            ..Default::default()
        };
        let merged = PackageManifest::merged(
            Some(manifest),
            "weather",
            "Weather lookups",
            &entry_with(None, &[], &[]),
        );
        assert_eq!(merged.name, "weather");
        assert_eq!(merged.description, "Weather lookups");
        assert_eq!(merged.command, "server");
        assert!(merged.is_launchable());
    }

    #[test]
    fn per_version_overrides_win_when_non_empty() {
        let manifest = PackageManifest {
            name: "shipped-name".into(),
            command: "shipped-cmd".into(),
            arguments: vec!["--shipped".into()],
            environment_variables: [("MODE".to_string(), "a".to_string())].into_iter().collect(),
            ..Default::default()
        };
        let entry = entry_with(Some("pinned-cmd"), &["--pinned"], &[("MODE", "b"), ("EXTRA", "1")]);
        let merged = PackageManifest::merged(Some(manifest), "weather", "", &entry);

        assert_eq!(merged.name, "shipped-name");
        assert_eq!(merged.command, "pinned-cmd");
        assert_eq!(merged.arguments, vec!["--pinned".to_string()]);
        assert_eq!(merged.environment_variables.get("MODE").unwrap(), "b");
        assert_eq!(merged.environment_variables.get("EXTRA").unwrap(), "1");
    }

    #[test]
    fn blank_override_does_not_erase_manifest_command() {
        let manifest = PackageManifest {
            command: "shipped-cmd".into(),
            ..Default::default()
        };
        let merged = PackageManifest::merged(
            Some(manifest),
            "weather",
            "",
            &entry_with(Some("   "), &[], &[]),
        );
        assert_eq!(merged.command, "shipped-cmd");
    }

    #[test]
    fn missing_manifest_synthesizes_from_catalog() {
        let merged = PackageManifest::merged(
            None,
            "notes",
            "Notes",
            &entry_with(Some("npx"), &["-y", "notes-mcp"], &[]),
        );
        assert_eq!(merged.name, "notes");
        assert_eq!(merged.command, "npx");
        assert!(merged.is_launchable());

        let unusable = PackageManifest::merged(None, "notes", "Notes", &entry_with(None, &[], &[]));
        assert!(!unusable.is_launchable());
    }

    #[test]
    fn read_from_dir_distinguishes_missing_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PackageManifest::read_from_dir(dir.path()).unwrap().is_none());

        std::fs::write(dir.path().join(MANIFEST_FILE), "{not json").unwrap();
        assert!(PackageManifest::read_from_dir(dir.path()).is_err());

        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"name": "weather", "command": "server", "arguments": ["--port", "0"]}"#,
        )
        .unwrap();
        let manifest = PackageManifest::read_from_dir(dir.path()).unwrap().unwrap();
        assert_eq!(manifest.name, "weather");
        assert_eq!(manifest.arguments.len(), 2);
    }
}
