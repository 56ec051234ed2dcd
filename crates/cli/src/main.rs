use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use berth_host::catalog::{default_catalog_path, Catalog, CatalogService};
use berth_host::client::AuthContext;
use berth_host::loader::runtime::LibloadingRuntime;
use berth_host::loader::store::FsPackageStore;
use berth_host::loader::PackageLoader;
use berth_host::logging::LogManager;
use berth_host::registry::PluginRegistry;
use berth_host::startup::{standard_jobs, PluginInitializer};
use berth_host::{McpPluginManager, WorkflowContext};
use tracing::debug;

#[derive(Parser)]
#[command(name = "berth", version, about = "Plugin host catalog and tooling")]
struct Cli {
    /// Catalog file; defaults to the user config directory.
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List catalog plugins, packages, and workflow associations.
    List,
    /// Check that the catalog file parses and validates.
    Validate,
    /// Start a plugin, print its tools, and stop it.
    Tools {
        plugin: String,
        /// Workflow identity to initialize the plugin against.
        #[arg(long, default_value = "cli")]
        workflow: String,
    },
    /// Load every native package the catalog declares and report.
    Load {
        /// Package store root holding container directories.
        #[arg(long)]
        store: PathBuf,
    },
    /// Show what an uploaded plugin archive declares.
    Inspect { archive: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let catalog_path = cli.catalog.clone().unwrap_or_else(default_catalog_path);
    debug!(catalog = %catalog_path.display(), "using catalog");

    match cli.command {
        Command::List => list(&catalog_path),
        Command::Validate => validate(&catalog_path),
        Command::Tools { plugin, workflow } => tools(&catalog_path, &plugin, &workflow).await,
        Command::Load { store } => load(&catalog_path, &store).await,
        Command::Inspect { archive } => inspect(&archive).await,
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn open_catalog(path: &Path) -> Result<CatalogService> {
    CatalogService::open(path)
        .with_context(|| format!("failed to open catalog {}", path.display()))
}

fn list(path: &Path) -> Result<()> {
    let service = open_catalog(path)?;
    service.with_catalog(|catalog| {
        if catalog.plugins.is_empty() && catalog.packages.is_empty() {
            println!("catalog is empty");
            return;
        }
        if !catalog.plugins.is_empty() {
            println!("plugins:");
            for (name, descriptor) in &catalog.plugins {
                let versions: Vec<String> = descriptor
                    .versions
                    .iter()
                    .map(|entry| entry.version.to_string())
                    .collect();
                println!("  {name} [{}] {}", descriptor.source, versions.join(", "));
            }
        }
        if !catalog.packages.is_empty() {
            println!("packages:");
            for (name, package) in &catalog.packages {
                let versions: Vec<String> =
                    package.versions.iter().map(|v| v.to_string()).collect();
                println!(
                    "  {name} (container {}) {}",
                    package.container,
                    versions.join(", ")
                );
            }
        }
        if !catalog.associations.is_empty() {
            println!("associations:");
            for association in &catalog.associations {
                let pin = match association.pinned_version {
                    Some(version) if !association.always_latest => version.to_string(),
                    _ => "latest".to_string(),
                };
                println!("  {} -> {} @ {pin}", association.workflow_id, association.plugin);
            }
        }
    });
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    let service = open_catalog(path)?;
    let (plugins, packages, associations) = service.with_catalog(|catalog| {
        (
            catalog.plugins.len(),
            catalog.packages.len(),
            catalog.associations.len(),
        )
    });
    println!(
        "{}: OK ({plugins} plugins, {packages} packages, {associations} associations)",
        path.display()
    );
    Ok(())
}

async fn tools(path: &Path, plugin: &str, workflow_id: &str) -> Result<()> {
    let catalog = Arc::new(open_catalog(path)?);
    let log_manager = Arc::new(LogManager::new().context("failed to open the audit log")?);
    let manager = McpPluginManager::new(catalog, log_manager, AuthContext::default());

    let workflow = WorkflowContext::new(workflow_id);
    let instance = manager
        .plugin_for_workflow(&workflow, plugin)
        .await
        .with_context(|| format!("plugin `{plugin}` could not be loaded"))?;

    let tools = instance.list_tools(&workflow).await;
    if tools.is_empty() {
        println!("no tools exposed");
    } else {
        for tool in &tools {
            match &tool.descriptor.description {
                Some(description) => println!("{}  {description}", tool.name()),
                None => println!("{}", tool.name()),
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

async fn load(path: &Path, store_root: &Path) -> Result<()> {
    let catalog = Arc::new(open_catalog(path)?);
    let loader = Arc::new(PackageLoader::new(
        Arc::clone(&catalog) as _,
        Arc::new(FsPackageStore::new(store_root)),
        Arc::new(LibloadingRuntime),
        Arc::new(PluginRegistry::new()),
    ));

    let report = PluginInitializer::new(standard_jobs(Arc::clone(&loader), Arc::clone(&catalog)))
        .run()
        .await;
    // One-shot invocation; report failures instead of retrying in the
    // background.
    report.abort_retries();
    for name in &report.failed {
        eprintln!("startup job `{name}` failed, see log output");
    }

    let packages = catalog.with_catalog(|c| c.packages.clone());
    if packages.is_empty() {
        println!("catalog declares no native packages");
        return Ok(());
    }
    for (name, descriptor) in &packages {
        let loaded: Vec<String> = loader
            .loaded_versions(name)
            .iter()
            .map(|v| v.to_string())
            .collect();
        let declared = descriptor.versions.len();
        if loaded.is_empty() {
            println!("{name}: none of {declared} declared versions loaded");
        } else {
            println!(
                "{name}: loaded {} of {declared} declared versions ({})",
                loaded.len(),
                loaded.join(", ")
            );
        }
    }
    Ok(())
}

async fn inspect(archive: &Path) -> Result<()> {
    let bytes = tokio::fs::read(archive)
        .await
        .with_context(|| format!("failed to read {}", archive.display()))?;

    let log_manager = Arc::new(LogManager::new().context("failed to open the audit log")?);
    let manager = McpPluginManager::new(
        Arc::new(CatalogService::from_catalog(Catalog::default())),
        log_manager,
        AuthContext::default(),
    );

    let inspection = manager.inspect_upload(&bytes).await?;
    println!("{}", serde_json::to_string_pretty(&inspection)?);
    if inspection.needs_command_override {
        eprintln!("note: the archive declares no command; the catalog entry must set one");
    }
    Ok(())
}
