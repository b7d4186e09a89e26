//! Model backend handle
//!
//! A provider turns the conversation so far plus the candidate tools into a
//! [`Decision`]. Providers keep no conversation state of their own; everything
//! the model sees is passed in on every call.

use crate::config::LlmConfig;

mod error;
mod ollama;
mod types;

pub use error::LlmError;
pub use ollama::OllamaProvider;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;

/// Trait for LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &str;

    /// Model identifier sent with each request
    fn model(&self) -> &str;

    /// Check that the backend is reachable and serving the configured model
    ///
    /// Default assumes the backend is available.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Send a chat completion request (non-streaming)
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse>;

    /// Ask the model whether to answer or to invoke tools
    async fn decide(&self, messages: &[Message], tools: &[ToolDefinition]) -> Result<Decision> {
        self.decide_with_usage(messages, tools)
            .await
            .map(|(decision, _)| decision)
    }

    /// Like [`decide`](Self::decide), also returning reported token usage
    async fn decide_with_usage(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<(Decision, Option<TokenUsage>)> {
        let tools = if tools.is_empty() { None } else { Some(tools) };
        let response = self.chat(messages, tools).await?;

        let usage = response.usage().cloned();
        if let Some(usage) = &usage {
            tracing::debug!(
                provider = self.name(),
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Model usage"
            );
        }

        Ok((Decision::from(response), usage))
    }
}

/// Create an LLM provider from configuration
pub fn create_provider(config: &LlmConfig) -> Result<Box<dyn LlmProvider>> {
    match config.provider.to_lowercase().as_str() {
        "ollama" | "local" => Ok(Box::new(OllamaProvider::from_config(config)?)),
        other => anyhow::bail!("Unknown LLM provider: {}. Supported: ollama", other),
    }
}
