//! Chat agent with tool execution

mod agent_loop;
mod context;
mod events;
mod session;

pub use agent_loop::{AgentLoop, AgentResponse, LoopConfig, LoopPhase, ToolCallLog};
pub use context::ConversationContext;
pub use events::{truncate_preview, AgentEvent, StopReason};
pub use session::Session;
