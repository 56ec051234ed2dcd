//! Staging directory layout for extracted plugin packages.
//!
//! Paths embed the machine, process name, and pid so concurrent hosts on a
//! shared temp volume never trample each other's extractions.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::types::{LoadError, PluginVersion};

/// Fixed top-level directory all staged packages live under.
pub const STAGING_NAMESPACE: &str = "berth-plugins";

/// Computes per-plugin, per-version staging paths.
#[derive(Debug, Clone)]
pub struct StagingLayout {
    root: PathBuf,
    machine: String,
    process_name: String,
    pid: u32,
}

impl StagingLayout {
    pub fn new() -> Self {
        Self::with_root(std::env::temp_dir())
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            machine: machine_name(),
            process_name: process_name(),
            pid: std::process::id(),
        }
    }

    fn base(&self) -> PathBuf {
        self.root
            .join(STAGING_NAMESPACE)
            .join(&self.machine)
            .join(&self.process_name)
            .join(format!("process-{}", self.pid))
    }

    /// Directory one plugin version is extracted into.
    pub fn version_dir(&self, plugin: &str, version: &PluginVersion) -> PathBuf {
        self.base().join(plugin).join(version.to_string())
    }

    /// Directory an uploaded archive is inspected in.
    pub fn upload_dir(&self, name: &str) -> PathBuf {
        self.base().join("uploads").join(name)
    }
}

impl Default for StagingLayout {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates `dir` if needed and removes whatever it already contains.
///
/// Removal is best-effort per entry: an entry that cannot be deleted is
/// logged and skipped so one stuck handle does not fail the whole load.
pub fn prepare_clean_dir(dir: &Path) -> Result<(), LoadError> {
    std::fs::create_dir_all(dir).map_err(|source| LoadError::Staging {
        path: dir.to_path_buf(),
        source,
    })?;
    let entries = std::fs::read_dir(dir).map_err(|source| LoadError::Staging {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(err) = removed {
            warn!(path = %path.display(), error = %err, "failed to remove stale staging entry");
        }
    }
    Ok(())
}

fn machine_name() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..end])
                && !name.is_empty()
            {
                return name.to_string();
            }
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "host".to_string())
}
