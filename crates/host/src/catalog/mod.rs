//! File-backed catalog: descriptors, versions, associations, manifests.

pub mod io;
pub mod manifest;
pub mod model;
pub mod service;
pub mod validation;

pub use io::{default_catalog_path, load_catalog_from_path, save_catalog_to_path, CATALOG_ENV_VAR};
pub use manifest::{PackageManifest, MANIFEST_FILE};
pub use model::{
    AuthKind, Catalog, CatalogError, PackageDescriptor, PluginDescriptor, SourceKind,
    VersionEntry, WorkflowAssociation,
};
pub use service::{CatalogReader, CatalogService};
pub use validation::{validate_catalog, validate_plugin_name, ValidationError};
