//! MCP protocol types and data structures.

use super::error::{McpError, McpResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// MCP revision spoken during the handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Status of an MCP server connection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Not connected
    #[default]
    Disconnected,
    /// Currently attempting to connect
    Connecting,
    /// Successfully connected
    Connected,
    /// Connection failed with error message
    Failed(String),
}

impl ConnectionStatus {
    /// Check if connected
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Get display string
    pub fn display(&self) -> &str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::Failed(_) => "Failed",
        }
    }
}

/// Tool definition from MCP server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpToolDef {
    /// Tool name
    pub name: String,
    /// Tool description
    #[serde(default)]
    pub description: String,
    /// JSON Schema for input parameters
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// Result of a tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolResult {
    /// Content returned by the tool
    #[serde(default)]
    pub content: Vec<McpContent>,
    /// Whether the call resulted in an error
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

/// Content item in MCP responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum McpContent {
    /// Text content
    #[serde(rename = "text")]
    Text { text: String },
    /// Image content (base64)
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Resource reference
    #[serde(rename = "resource")]
    Resource { resource: Value },
}

impl McpToolResult {
    /// Convert to string representation
    pub fn to_text(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                McpContent::Text { text } => text.clone(),
                McpContent::Image { .. } => "[Image]".to_string(),
                McpContent::Resource { resource } => {
                    let uri = resource
                        .get("uri")
                        .and_then(|u| u.as_str())
                        .unwrap_or("unknown");
                    format!("[Resource: {}]", uri)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Server capabilities returned during initialization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Whether server supports tools
    #[serde(default)]
    pub tools: Option<ToolsCapability>,
}

/// Tools capability details
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsCapability {
    /// Whether tool list can change
    #[serde(default, rename = "listChanged")]
    pub list_changed: bool,
}

/// Name and version the server reports about itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// One page of a `tools/list` response
#[derive(Debug, Clone)]
pub struct ToolPage {
    pub tools: Vec<McpToolDef>,
    pub next_cursor: Option<String>,
}

/// Parse a `tools/list` result, rejecting anything that is not a usable listing
pub fn parse_tool_list(result: &Value) -> McpResult<ToolPage> {
    let entries = result
        .get("tools")
        .and_then(|t| t.as_array())
        .ok_or_else(|| McpError::Protocol("tools/list result has no `tools` array".into()))?;

    let mut tools = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let tool: McpToolDef = serde_json::from_value(entry.clone())
            .map_err(|e| McpError::Protocol(format!("tool descriptor #{} is malformed: {}", idx, e)))?;
        if tool.name.trim().is_empty() {
            return Err(McpError::Protocol(format!(
                "tool descriptor #{} has an empty name",
                idx
            )));
        }
        tools.push(tool);
    }

    let next_cursor = result
        .get("nextCursor")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(String::from);

    Ok(ToolPage { tools, next_cursor })
}

/// Reject listings where one server advertises the same name twice
pub fn ensure_unique_names(tools: &[McpToolDef]) -> McpResult<()> {
    let mut seen = HashSet::new();
    for tool in tools {
        if !seen.insert(tool.name.as_str()) {
            return Err(McpError::Protocol(format!(
                "tool `{}` is listed more than once",
                tool.name
            )));
        }
    }
    Ok(())
}
