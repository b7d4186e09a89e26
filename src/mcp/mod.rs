//! MCP (Model Context Protocol) client implementation.
//!
//! Connects relay to external MCP servers, over HTTP+SSE or stdio, and
//! exposes their tools through the [`crate::tools::Tool`] trait.

pub mod client;
pub mod error;
pub mod sse;
pub mod transport;
pub mod types;
pub mod wrapper;

// Re-export main types
pub use client::{McpClient, McpServerManager, EMPTY_RESULT_TEXT};
pub use error::{McpError, McpResult};
pub use sse::{SseDecoder, SseEvent, SseTransport};
pub use transport::{McpTransport, StdioTransport};
pub use types::{ConnectionStatus, McpContent, McpToolDef, McpToolResult, ServerCapabilities};
pub use wrapper::McpToolWrapper;
