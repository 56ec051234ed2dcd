//! Plugin host infrastructure: versioned native packages and MCP tool servers.
//!
//! This crate provides the two plugin families a host embeds: dynamically
//! loaded native packages (catalog-driven staging, version-aware module
//! resolution, capability discovery and registration) and MCP plugin
//! clients (subprocess and HTTP/SSE transports, workflow-scoped lifecycle,
//! tool discovery), plus the catalog, logging, and warm-start plumbing
//! shared between them.

pub mod catalog;
pub mod client;
pub mod container;
pub mod loader;
pub mod logging;
pub mod manager;
pub mod registry;
pub mod startup;
pub mod types;

pub use catalog::{Catalog, CatalogReader, CatalogService, SourceKind};
pub use client::{McpPluginInstance, ToolFunction};
pub use container::McpServerContainer;
pub use loader::PackageLoader;
pub use logging::LogManager;
pub use manager::{McpPluginManager, PackageInspection};
pub use startup::{InitializerJob, PluginInitializer, StartupReport};
pub use types::{
    CallerContext, ClientError, HealthStatus, InstancePhase, LoadError, PluginVersion,
    ToolDescriptor, WorkflowContext,
};
