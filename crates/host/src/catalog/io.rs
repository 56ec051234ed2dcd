//! Catalog file location and load/save.

use crate::catalog::model::{Catalog, CatalogError};
use crate::catalog::validation::validate_catalog;
use std::path::{Path, PathBuf};

/// Environment variable overriding the catalog path.
pub const CATALOG_ENV_VAR: &str = "BERTH_CATALOG";

const CATALOG_FILE: &str = "catalog.json";

/// Resolves the catalog path: `BERTH_CATALOG` (with `~` expansion) wins,
/// otherwise `<config dir>/berth/catalog.json`.
pub fn default_catalog_path() -> PathBuf {
    if let Ok(custom) = std::env::var(CATALOG_ENV_VAR)
        && !custom.trim().is_empty()
    {
        return expand_tilde(&custom);
    }
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("berth")
        .join(CATALOG_FILE)
}

fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/")
        && let Some(home) = dirs_next::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(raw)
}

/// Loads and validates a catalog; a missing file yields an empty catalog.
pub fn load_catalog_from_path(path: &Path) -> Result<Catalog, CatalogError> {
    if !path.exists() {
        return Ok(Catalog::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let catalog: Catalog = serde_json::from_str(&raw)?;
    validate_catalog(&catalog)?;
    Ok(catalog)
}

/// Writes a catalog back to disk, creating parent directories as needed.
pub fn save_catalog_to_path(catalog: &Catalog, path: &Path) -> Result<(), CatalogError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| CatalogError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let raw = serde_json::to_string_pretty(catalog)?;
    std::fs::write(path, raw).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_overrides_default_path() {
        temp_env::with_var(CATALOG_ENV_VAR, Some("/tmp/custom-catalog.json"), || {
            assert_eq!(
                default_catalog_path(),
                PathBuf::from("/tmp/custom-catalog.json")
            );
        });
    }

    #[test]
    fn blank_env_var_falls_back_to_default() {
        temp_env::with_var(CATALOG_ENV_VAR, Some("   "), || {
            let path = default_catalog_path();
            assert!(path.ends_with(Path::new("berth").join(CATALOG_FILE)));
        });
    }

    #[test]
    fn missing_file_loads_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = load_catalog_from_path(&dir.path().join("absent.json")).unwrap();
        assert!(catalog.plugins.is_empty());
        assert!(catalog.associations.is_empty());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CATALOG_FILE);

        let mut catalog = Catalog::default();
        catalog.plugins.insert(
            "notes".into(),
            crate::catalog::model::PluginDescriptor {
                description: "Notes".into(),
                source: crate::catalog::model::SourceKind::CommandOnly,
                container: None,
                versions: vec![{
                    let mut entry = crate::catalog::model::VersionEntry::new(
                        crate::types::version::PluginVersion::new(1, 0, 0),
                    );
                    entry.command = Some("notes-server".into());
                    entry
                }],
            },
        );

        save_catalog_to_path(&catalog, &path).unwrap();
        let loaded = load_catalog_from_path(&path).unwrap();
        assert_eq!(loaded.plugins.len(), 1);
        assert!(loaded.descriptor("notes").is_some());
    }

    #[test]
    fn invalid_documents_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CATALOG_FILE);
        // Uppercase plugin names violate the naming rule.
        std::fs::write(
            &path,
            r#"{"plugins": {"BadName": {"source": "commandOnly", "versions": [{"version": "1.0.0"}]}}}"#,
        )
        .unwrap();
        assert!(matches!(
            load_catalog_from_path(&path),
            Err(CatalogError::Validation(_))
        ));
    }
}
