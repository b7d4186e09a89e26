//! Agent tools
//!
//! Every tool the agent can call lives in one [`ToolRegistry`], no matter
//! which server provides it. Names are unique across the whole registry.

mod validation;

pub use validation::{detect_truncation, validate_arguments, ArgumentError};

use crate::llm::ToolDefinition;
use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Result of executing a tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
        }
    }
}

/// Trait for agent tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name
    fn name(&self) -> &str;

    /// Get the tool description
    fn description(&self) -> &str;

    /// Get the JSON schema for parameters
    fn parameters(&self) -> Value;

    /// Where the tool comes from (server id for MCP tools)
    fn source(&self) -> &str {
        "local"
    }

    /// Execute the tool with given parameters
    async fn execute(&self, params: Value) -> Result<ToolResult>;

    /// Convert to LLM tool definition
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tool `{name}` is provided by both `{existing}` and `{incoming}`")]
    DuplicateTool {
        name: String,
        existing: String,
        incoming: String,
    },
}

/// Registry of available tools
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    tool_timeout_secs: u64,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            tool_timeout_secs: 60,
        }
    }

    /// Add a tool; a name that is already taken is rejected
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        if let Some(existing) = self.tools.get(tool.name()) {
            return Err(RegistryError::DuplicateTool {
                name: tool.name().to_string(),
                existing: existing.source().to_string(),
                incoming: tool.source().to_string(),
            });
        }
        tracing::debug!("Registered tool {} from {}", tool.name(), tool.source());
        self.tools.insert(tool.name().to_string(), tool);
        Ok(())
    }

    /// Move every tool of `other` into this registry
    pub fn merge(&mut self, other: ToolRegistry) -> Result<(), RegistryError> {
        for tool in other.tools.into_values() {
            self.register(tool)?;
        }
        Ok(())
    }

    pub fn set_tool_timeout_secs(&mut self, secs: u64) {
        self.tool_timeout_secs = secs.max(1);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool names in sorted order
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Definitions handed to the model
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// Run a tool, turning errors, panics and timeouts into error results
    pub async fn execute(&self, name: &str, params: Value) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::error(format!("Unknown tool: {}", name));
        };

        let timeout_duration = Duration::from_secs(self.tool_timeout_secs);

        // Wrap tool execution with timeout + panic recovery to prevent crashes
        match timeout(
            timeout_duration,
            AssertUnwindSafe(tool.execute(params)).catch_unwind(),
        )
        .await
        {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => ToolResult::error(format!("Tool '{}' failed: {:#}", name, e)),
            Ok(Err(panic_info)) => {
                let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                tracing::error!("Tool '{}' panicked: {}", name, panic_msg);
                ToolResult::error(format!("Tool '{}' crashed: {}", name, panic_msg))
            }
            Err(_) => ToolResult::error(format!(
                "Tool '{}' timed out after {} seconds",
                name, self.tool_timeout_secs
            )),
        }
    }
}
