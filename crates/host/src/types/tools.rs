//! Tool metadata surfaced by MCP servers, with host-safe name sanitization.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static UNSAFE_NAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_]").expect("sanitize regex must compile"));

/// Replaces every character outside `[A-Za-z0-9_]` with `_`.
///
/// The host's function-naming rules are stricter than the protocol's, so
/// server-provided tool names are normalized before they become invocable
/// function names.
pub fn sanitize_tool_name(raw: &str) -> String {
    UNSAFE_NAME_CHARS.replace_all(raw, "_").into_owned()
}

/// Metadata for one tool exposed by an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// The name exactly as the server reported it.
    pub name: String,
    /// The host-safe function name derived from `name`.
    pub sanitized_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the tool's arguments.
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: Option<String>, input_schema: Value) -> Self {
        let name = name.into();
        Self {
            sanitized_name: sanitize_tool_name(&name),
            name,
            description,
            input_schema,
        }
    }

    /// Converts an `rmcp` tool definition into host metadata.
    pub fn from_rmcp(tool: &rmcp::model::Tool) -> Self {
        Self::new(
            tool.name.to_string(),
            tool.description.as_ref().map(|d| d.to_string()),
            Value::Object(tool.input_schema.as_ref().clone()),
        )
    }
}
