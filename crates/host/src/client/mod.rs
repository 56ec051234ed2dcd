//! MCP client transports, authentication, and instance lifecycle.

pub mod auth;
pub mod instance;
pub mod sse;
pub mod stdio;

pub use auth::{AuthContext, CredentialProvider, KeyringTokenStore, TokenStore};
pub use instance::{
    ClientHandle, Connector, McpPluginInstance, RmcpHandle, ToolFunction, TOOL_INVOCATION_TIMEOUT,
};
pub use sse::{endpoint_candidates, SseConnector};
pub use stdio::{resolve_command_path, StdioConnector};
