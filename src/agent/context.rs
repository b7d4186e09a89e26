//! Conversation context management

use crate::llm::{Message, ToolCall};

/// Max tokens for a single tool result (keeps one large listing from flooding the model)
const MAX_TOOL_RESULT_TOKENS: usize = 8_000;

/// The ordered turns of one session
///
/// Append-only: turns are never edited, removed or reordered once added.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    messages: Vec<Message>,
}

impl ConversationContext {
    /// Start a conversation with the given system instruction
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let system_prompt = system_prompt.into();
        let messages = if system_prompt.trim().is_empty() {
            Vec::new()
        } else {
            vec![Message::system(system_prompt)]
        };
        Self { messages }
    }

    /// Add a user message
    pub fn add_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    /// Add an assistant message
    pub fn add_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    /// Add an assistant message with tool calls (must precede their results)
    pub fn add_assistant_tool_calls(&mut self, tool_calls: &[ToolCall]) {
        self.messages.push(Message::assistant_tool_calls(tool_calls));
    }

    /// Add a tool result (auto-truncates if too large)
    pub fn add_tool_result(&mut self, tool_call_id: impl Into<String>, result: impl Into<String>) {
        let result_str = result.into();
        let truncated = Self::truncate_if_needed(&result_str, MAX_TOOL_RESULT_TOKENS);
        self.messages
            .push(Message::tool_result(tool_call_id, truncated));
    }

    /// Truncate text if it exceeds token limit
    fn truncate_if_needed(text: &str, max_tokens: usize) -> String {
        let estimated_tokens = Self::estimate_tokens(text);
        if estimated_tokens <= max_tokens {
            return text.to_string();
        }

        // ~4 chars per token is a rough estimate
        let max_chars = max_tokens * 4;
        let truncated: String = text.chars().take(max_chars).collect();

        format!(
            "{}\n\n... [TRUNCATED: result exceeded {} tokens. Ask for a narrower query.]",
            truncated, max_tokens
        )
    }

    /// Estimate tokens in text (~4 chars per token for English)
    pub fn estimate_tokens(text: &str) -> usize {
        text.len().div_ceil(4)
    }

    /// Get all messages
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use serde_json::json;

    #[test]
    fn starts_with_system_prompt() {
        let ctx = ConversationContext::new("You are helpful");
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.messages()[0].role, Role::System);

        assert!(ConversationContext::new("  ").is_empty());
    }

    #[test]
    fn turns_are_appended_in_order() {
        let mut ctx = ConversationContext::new("sys");
        ctx.add_user("add Momo");
        let call = ToolCall {
            id: "c1".to_string(),
            name: "add_data".to_string(),
            arguments: json!({"query": "INSERT ..."}),
        };
        ctx.add_assistant_tool_calls(std::slice::from_ref(&call));
        ctx.add_tool_result("c1", "1 row inserted");
        ctx.add_assistant("Added Momo.");

        let roles: Vec<_> = ctx.messages().iter().map(|m| m.role.clone()).collect();
        assert_eq!(
            roles,
            vec![
                Role::System,
                Role::User,
                Role::Assistant,
                Role::Tool,
                Role::Assistant
            ]
        );
        assert_eq!(ctx.messages()[2].tool_calls(), vec![call]);
    }

    #[test]
    fn large_tool_results_are_truncated() {
        let mut ctx = ConversationContext::new("sys");
        let huge = "x".repeat(MAX_TOOL_RESULT_TOKENS * 4 + 100);
        ctx.add_tool_result("c1", huge);

        let stored = ctx.messages()[1].content.as_text().unwrap();
        assert!(stored.contains("[TRUNCATED"));
        assert!(stored.len() < MAX_TOOL_RESULT_TOKENS * 4 + 100);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(ConversationContext::estimate_tokens(""), 0);
        assert_eq!(ConversationContext::estimate_tokens("abcde"), 2);
    }
}
