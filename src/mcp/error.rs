//! Errors raised while talking to MCP servers

use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpError {
    /// The server could not be reached or the handshake did not complete
    #[error("Failed to connect to MCP server at {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// The server answered with something that is not valid MCP
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("MCP request `{method}` timed out after {secs}s")]
    Timeout { method: String, secs: u64 },

    /// JSON-RPC error object returned by the server
    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The transport has shut down; no further responses will arrive
    #[error("MCP connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    pub fn connection(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        McpError::Connection {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }
}

pub type McpResult<T> = std::result::Result<T, McpError>;
