//! Error taxonomy shared across the host.
//!
//! Configuration problems propagate to the caller; transient transport
//! problems degrade at the call site; operating on a disposed instance is
//! its own variant so callers can tell a programming error from an outage.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by MCP client instances and their transports.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The descriptor has no launch command to spawn.
    #[error("plugin `{plugin}` has no command configured")]
    MissingCommand { plugin: String },

    /// The descriptor has no endpoint URL to connect to.
    #[error("plugin `{plugin}` has no URL configured")]
    MissingUrl { plugin: String },

    /// The endpoint URL could not be parsed or extended.
    #[error("plugin `{plugin}` has an invalid URL `{url}`: {reason}")]
    InvalidUrl {
        plugin: String,
        url: String,
        reason: String,
    },

    /// The instance was disposed; no further operations are possible.
    #[error("plugin `{plugin}` has been disposed")]
    Disposed { plugin: String },

    /// Connecting the transport failed.
    #[error("failed to connect plugin `{plugin}`: {reason}")]
    ConnectFailed { plugin: String, reason: String },

    /// Listing tools from a connected client failed.
    #[error("failed to list tools for plugin `{plugin}`: {reason}")]
    ToolListFailed { plugin: String, reason: String },

    /// Invoking a tool failed or the client behind it is gone.
    #[error("tool `{tool}` invocation failed: {reason}")]
    ToolCallFailed { tool: String, reason: String },

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },
}

impl ClientError {
    pub fn missing_command(plugin: impl Into<String>) -> Self {
        Self::MissingCommand {
            plugin: plugin.into(),
        }
    }

    pub fn missing_url(plugin: impl Into<String>) -> Self {
        Self::MissingUrl {
            plugin: plugin.into(),
        }
    }

    pub fn disposed(plugin: impl Into<String>) -> Self {
        Self::Disposed {
            plugin: plugin.into(),
        }
    }

    pub fn connect_failed(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    pub fn tool_list_failed(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolListFailed {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    pub fn tool_call_failed(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolCallFailed {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// True when the error means "this instance can never work again".
    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed { .. })
    }
}

/// Errors raised while loading native plugin packages.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Creating or cleaning a staging directory failed.
    #[error("staging failed at {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The archive could not be unpacked.
    #[error("archive extraction failed: {reason}")]
    Extract { reason: String },

    /// The archive tried to write outside the staging directory.
    #[error("archive entry escapes staging directory: {path}")]
    PathTraversal { path: String },

    /// The archive contained a symlink, device node, or other unsafe entry.
    #[error("unsafe archive entry type {entry_type} at {path}")]
    UnsafeEntry { entry_type: String, path: String },

    /// No loadable primary module was found after extraction.
    #[error("no primary module found for `{plugin}` version {version}")]
    MissingPrimaryModule { plugin: String, version: String },

    /// The module runtime failed to load a module file.
    #[error("failed to load module {path}: {reason}")]
    Runtime { path: PathBuf, reason: String },

    /// A module omitted both the versioned and unversioned declaration symbol.
    #[error("module {path} exports no plugin declaration")]
    DeclarationMissing { path: PathBuf },

    /// The module was built against an incompatible host ABI revision.
    #[error("module {path} declares ABI {found}, host expects {expected}")]
    AbiMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    /// A sidecar metadata file existed but could not be read or parsed.
    #[error("invalid sidecar metadata {path}: {reason}")]
    Sidecar { path: PathBuf, reason: String },

    /// A module name could not be resolved by any candidate source.
    #[error("module `{name}` not found in host table or plugin directory")]
    ModuleNotFound { name: String },

    /// Fetching the package archive from the store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LoadError {
    pub fn extract(reason: impl Into<String>) -> Self {
        Self::Extract {
            reason: reason.into(),
        }
    }

    pub fn runtime(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Runtime {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_primary(plugin: impl Into<String>, version: impl Into<String>) -> Self {
        Self::MissingPrimaryModule {
            plugin: plugin.into(),
            version: version.into(),
        }
    }
}

/// Errors from the package store boundary.
///
/// A missing archive is not an error; stores report it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("package store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("package store request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("package store returned status {status} for {url}")]
    Status { url: String, status: u16 },
}

/// Errors from bearer-token resolution.
///
/// Callers treat every variant as non-fatal: the connection proceeds
/// without an authorization header.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("managed identity auth requested but no audience is configured")]
    MissingAudience,

    #[error("managed identity auth requested but no credential provider is available")]
    ProviderUnavailable,

    #[error("credential provider failed: {reason}")]
    Credential { reason: String },

    #[error("token store lookup failed: {reason}")]
    TokenStore { reason: String },
}

/// Errors from the audit log sink.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
