//! One interactive conversation
//!
//! A session owns the conversation, the merged tool registry and the loop
//! limits. It lives from the first prompt until the user exits.

use super::agent_loop::{AgentLoop, AgentResponse, LoopConfig, LoopPhase};
use super::events::AgentEvent;
use super::ConversationContext;
use crate::llm::LlmProvider;
use crate::tools::ToolRegistry;
use anyhow::Result;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

pub struct Session {
    id: Uuid,
    agent: AgentLoop,
    messages_handled: usize,
}

impl Session {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        system_prompt: &str,
        config: LoopConfig,
    ) -> Self {
        let id = Uuid::new_v4();
        tracing::info!(
            session = %id,
            model = llm.model(),
            tools = tools.len(),
            "Session started"
        );
        Self {
            id,
            agent: AgentLoop::new(llm, tools, ConversationContext::new(system_prompt), config),
            messages_handled: 0,
        }
    }

    /// Run one agent cycle for a user message
    pub async fn handle_message<F>(&mut self, text: &str, on_event: F) -> Result<AgentResponse>
    where
        F: FnMut(&AgentEvent),
    {
        let span = tracing::info_span!("session", id = %self.id, turn = self.messages_handled + 1);
        let response = self.agent.run(text, on_event).instrument(span).await;
        self.messages_handled += 1;
        if let Ok(r) = &response {
            tracing::debug!(
                tool_calls = r.tool_calls_made,
                input_tokens = r.usage.input_tokens,
                output_tokens = r.usage.output_tokens,
                stop = ?r.stop,
                "Message handled"
            );
        }
        response
    }

    pub fn conversation(&self) -> &ConversationContext {
        self.agent.context()
    }

    pub fn tools(&self) -> &ToolRegistry {
        self.agent.tools()
    }

    pub fn phase(&self) -> LoopPhase {
        self.agent.phase()
    }

    pub fn messages_handled(&self) -> usize {
        self.messages_handled
    }

    /// End the session; returns how many messages it handled
    pub fn close(self) -> usize {
        tracing::info!(
            session = %self.id,
            messages = self.messages_handled,
            "Session closed"
        );
        self.messages_handled
    }
}
