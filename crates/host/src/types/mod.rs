//! Shared domain types: versions, lifecycle status, contexts, tools, errors.

pub mod context;
pub mod errors;
pub mod log;
pub mod status;
pub mod tools;
pub mod version;

pub use context::{CallerContext, WorkflowContext};
pub use errors::{AuthError, ClientError, LoadError, LogError, StoreError};
pub use log::{LogEntry, LogLevel, LogSource};
pub use status::{HealthStatus, InstancePhase};
pub use tools::{sanitize_tool_name, ToolDescriptor};
pub use version::{PluginVersion, VersionParseError};
