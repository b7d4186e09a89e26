//! relay: a chat agent that drives a local Ollama model against MCP servers
//!
//! This library provides:
//! - MCP clients over HTTP+SSE and stdio, merged into one tool registry
//! - An Ollama backend that decides between answering and calling tools
//! - The agent loop and session that tie the two together
//! - The terminal read/print loop used by the `relay` binary

pub mod agent;
pub mod config;
pub mod llm;
pub mod mcp;
pub mod tools;
pub mod transport;

pub use agent::{AgentEvent, Session, StopReason};
pub use config::Config;
