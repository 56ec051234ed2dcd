//! Native module runtime built on the platform dynamic loader.
//!
//! [`LibloadingRuntime`] opens a module file, locates its declaration
//! symbol, checks the ABI revision, and runs the registration function.
//! [`ModuleRuntime`] is a trait so resolution and pipeline logic can be
//! exercised without compiling real shared objects.

use std::path::Path;
use std::sync::Arc;

use libloading::Library;
use serde::Deserialize;
use tracing::debug;

use crate::types::{LoadError, PluginVersion};

use super::abi::{
    ABI_VERSION, CapabilityDecl, DECLARATION_SYMBOL, DECLARATION_SYMBOL_VERSIONED,
    DeclarationCollector, ModuleDeclaration, RegistrationHook,
};

/// File name a module named `name` is stored under on this platform.
pub fn module_file_name(name: &str) -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        name,
        std::env::consts::DLL_SUFFIX
    )
}

/// Sidecar metadata file written next to a module file.
pub fn sidecar_file_name(name: &str) -> String {
    format!("{name}.module.json")
}

/// Module name for a path in a plugin directory, if it names a module file.
pub fn module_name_from_path(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let stem = file_name.strip_suffix(std::env::consts::DLL_SUFFIX)?;
    let stem = stem
        .strip_prefix(std::env::consts::DLL_PREFIX)
        .unwrap_or(stem);
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

/// Metadata a package build writes next to each module file.
///
/// Carrying the version here lets resolution compare a plugin's copy
/// against the host's without loading the module first.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarMetadata {
    pub name: String,
    #[serde(default)]
    pub version: Option<PluginVersion>,
}

/// A module the runtime has loaded and registered.
pub trait LoadedModule: Send + Sync {
    fn name(&self) -> &str;

    /// Version recorded in the module's sidecar, when one was present.
    fn version(&self) -> Option<&PluginVersion>;

    /// Capabilities the module declared during registration.
    fn capabilities(&self) -> &[CapabilityDecl];

    /// Host-level hooks the module declared during registration.
    fn hooks(&self) -> &[RegistrationHook];
}

/// Loads and probes module files.
pub trait ModuleRuntime: Send + Sync {
    /// Loads the module at `path` and runs its registration function.
    fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, LoadError>;

    /// Reads the metadata next to `path` without loading the module.
    fn probe(&self, path: &Path) -> Result<Option<SidecarMetadata>, LoadError>;
}

/// Production runtime backed by `libloading`.
#[derive(Debug, Default)]
pub struct LibloadingRuntime;

struct NativeModule {
    name: String,
    version: Option<PluginVersion>,
    capabilities: Vec<CapabilityDecl>,
    hooks: Vec<RegistrationHook>,
    // Declared last so it drops last: the capability constructors and hooks
    // above point into this library's code.
    _library: Library,
}

impl LoadedModule for NativeModule {
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

impl ModuleRuntime for LibloadingRuntime {
    fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, LoadError> {
        let library =
            unsafe { Library::new(path) }.map_err(|err| LoadError::runtime(path, err.to_string()))?;

        let declaration: &ModuleDeclaration = unsafe {
            match library.get::<*const ModuleDeclaration>(DECLARATION_SYMBOL_VERSIONED) {
                Ok(symbol) => &**symbol,
                Err(_) => match library.get::<*const ModuleDeclaration>(DECLARATION_SYMBOL) {
                    Ok(symbol) => &**symbol,
                    Err(_) => {
                        return Err(LoadError::DeclarationMissing {
                            path: path.to_path_buf(),
                        });
                    }
                },
            }
        };

        if declaration.abi_version != ABI_VERSION {
            return Err(LoadError::AbiMismatch {
                path: path.to_path_buf(),
                found: declaration.abi_version,
                expected: ABI_VERSION,
            });
        }

        let mut collector = DeclarationCollector::default();
        unsafe { (declaration.register)(&mut collector) };

        let (name, version) = match self.probe(path)? {
            Some(meta) => (meta.name, meta.version),
            None => {
                let name = module_name_from_path(path)
                    .ok_or_else(|| LoadError::runtime(path, "path does not name a module file"))?;
                (name, None)
            }
        };

        debug!(
            module = %name,
            capabilities = collector.capabilities.len(),
            hooks = collector.hooks.len(),
            "loaded native module"
        );

        Ok(Arc::new(NativeModule {
            name,
            version,
            capabilities: collector.capabilities,
            hooks: collector.hooks,
            _library: library,
        }))
    }

    fn probe(&self, path: &Path) -> Result<Option<SidecarMetadata>, LoadError> {
        let Some(name) = module_name_from_path(path) else {
            return Ok(None);
        };
        let sidecar_path = path.with_file_name(sidecar_file_name(&name));
        let raw = match std::fs::read_to_string(&sidecar_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(LoadError::Sidecar {
                    path: sidecar_path,
                    reason: err.to_string(),
                });
            }
        };
        let metadata: SidecarMetadata =
            serde_json::from_str(&raw).map_err(|err| LoadError::Sidecar {
                path: sidecar_path.clone(),
                reason: err.to_string(),
            })?;
        Ok(Some(metadata))
    }
}
