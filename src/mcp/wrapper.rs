//! Wrapper that adapts MCP tools to relay's Tool trait.

use super::client::McpClient;
use super::types::McpToolDef;
use crate::tools::{Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Wraps an MCP tool to implement relay's Tool trait
pub struct McpToolWrapper {
    /// Server ID this tool belongs to
    server_id: String,
    /// Tool definition from MCP server
    tool_def: McpToolDef,
    client: Arc<McpClient>,
    /// Timeout for one `tools/call`
    timeout: Duration,
}

impl McpToolWrapper {
    pub fn new(
        server_id: String,
        tool_def: McpToolDef,
        client: Arc<McpClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            server_id,
            tool_def,
            client,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for McpToolWrapper {
    fn name(&self) -> &str {
        &self.tool_def.name
    }

    fn description(&self) -> &str {
        &self.tool_def.description
    }

    fn parameters(&self) -> Value {
        if self.tool_def.input_schema.is_null() {
            serde_json::json!({"type": "object", "properties": {}})
        } else {
            self.tool_def.input_schema.clone()
        }
    }

    fn source(&self) -> &str {
        &self.server_id
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        Ok(self
            .client
            .invoke(&self.tool_def.name, params, self.timeout)
            .await)
    }
}
