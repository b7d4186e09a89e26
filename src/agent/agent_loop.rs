//! The agentic loop for one user message
//!
//! ```text
//! AwaitingUserInput -> ModelDeciding -> (ToolExecuting -> ModelDeciding)* -> EmittingFinalAnswer
//! ```
//!
//! Guards against runaway cycles:
//! - an iteration cap per user message
//! - a per-turn cap on proposed tool calls
//! - early stop when the same call keeps failing with the same output

use super::events::{truncate_preview, AgentEvent, StopReason};
use super::ConversationContext;
use crate::config::AgentConfig;
use crate::llm::{Decision, LlmProvider, TokenUsage, ToolCall};
use crate::tools::{validate_arguments, ToolRegistry, ToolResult};
use anyhow::Result;
use std::sync::Arc;

/// Limits for one cycle
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Model round-trips allowed per user message
    pub max_iterations: usize,
    /// Maximum tools the model can call per single response
    pub max_tools_per_turn: usize,
    /// Identical failing calls tolerated in a row (0 disables the check)
    pub max_consecutive_duplicates: usize,
    /// Length of the result previews kept in the call log
    pub result_preview_chars: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            max_tools_per_turn: 5,
            max_consecutive_duplicates: 2,
            result_preview_chars: 200,
        }
    }
}

impl From<&AgentConfig> for LoopConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_iterations: config.max_iterations.max(1),
            max_tools_per_turn: config.max_tools_per_turn.max(1),
            max_consecutive_duplicates: config.max_consecutive_duplicates,
            result_preview_chars: config.result_preview_chars,
        }
    }
}

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    AwaitingUserInput,
    ModelDeciding,
    ToolExecuting,
    EmittingFinalAnswer,
}

/// One executed tool call, for display after the fact
#[derive(Debug, Clone)]
pub struct ToolCallLog {
    pub tool: String,
    pub args: serde_json::Value,
    pub result_preview: String,
    pub success: bool,
}

/// Outcome of one cycle
#[derive(Debug)]
pub struct AgentResponse {
    pub text: String,
    pub stop: StopReason,
    pub tool_calls_made: usize,
    pub tool_call_log: Vec<ToolCallLog>,
    pub usage: TokenUsage,
}

/// Drives the model and the tools for one conversation
pub struct AgentLoop {
    llm: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    context: ConversationContext,
    config: LoopConfig,
    phase: LoopPhase,
}

impl AgentLoop {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        context: ConversationContext,
        config: LoopConfig,
    ) -> Self {
        Self {
            llm,
            tools,
            context,
            config,
            phase: LoopPhase::AwaitingUserInput,
        }
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Handle one user message until the model answers or a guard trips
    ///
    /// `on_event` sees every `Invoked`/`Returned` pair in execution order,
    /// then exactly one `FinalAnswer`. A model backend failure is returned as
    /// `Err` and leaves the conversation usable for the next message.
    pub async fn run<F>(&mut self, user_message: &str, mut on_event: F) -> Result<AgentResponse>
    where
        F: FnMut(&AgentEvent),
    {
        self.context.add_user(user_message);
        self.phase = LoopPhase::ModelDeciding;

        let definitions = self.tools.definitions();
        let mut state = LoopState::default();

        let (text, stop) = loop {
            if state.iterations >= self.config.max_iterations {
                tracing::warn!(
                    "Stopping after {} iterations without a final answer",
                    state.iterations
                );
                break (
                    format!(
                        "I stopped after {} steps without reaching an answer, so no result is \
                         reported. Try a more specific request.",
                        self.config.max_iterations
                    ),
                    StopReason::LoopLimitExceeded,
                );
            }

            self.phase = LoopPhase::ModelDeciding;
            let (decision, usage) = match self
                .llm
                .decide_with_usage(self.context.messages(), &definitions)
                .await
            {
                Ok(d) => d,
                Err(e) => {
                    self.phase = LoopPhase::AwaitingUserInput;
                    return Err(e);
                }
            };
            state.iterations += 1;
            state.add_usage(usage.as_ref());

            match decision {
                Decision::FinalAnswer(text) => {
                    let text = if text.trim().is_empty() {
                        "The model returned an empty response.".to_string()
                    } else {
                        text
                    };
                    break (text, StopReason::Answered);
                }
                Decision::Invoke(calls) => {
                    self.phase = LoopPhase::ToolExecuting;
                    if let Some(report) =
                        self.handle_tool_calls(&calls, &mut state, &mut on_event).await
                    {
                        break (report, StopReason::RepeatedToolFailure);
                    }
                }
            }
        };

        self.phase = LoopPhase::EmittingFinalAnswer;
        self.context.add_assistant(text.as_str());
        on_event(&AgentEvent::FinalAnswer {
            text: text.clone(),
            stop,
        });
        self.phase = LoopPhase::AwaitingUserInput;

        Ok(AgentResponse {
            text,
            stop,
            tool_calls_made: state.tool_calls_made,
            tool_call_log: state.tool_log,
            usage: state.usage,
        })
    }

    /// Run the proposed calls in order
    ///
    /// Returns a failure report when the repeated-failure guard trips.
    async fn handle_tool_calls<F>(
        &mut self,
        calls: &[ToolCall],
        state: &mut LoopState,
        on_event: &mut F,
    ) -> Option<String>
    where
        F: FnMut(&AgentEvent),
    {
        let limited_calls = self.limit_tool_calls(calls);

        // Add to context before execution so the model sees what it requested
        self.context.add_assistant_tool_calls(limited_calls);

        for (i, call) in limited_calls.iter().enumerate() {
            on_event(&AgentEvent::Invoked {
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
            });

            let result = self.execute_call(call).await;

            on_event(&AgentEvent::Returned {
                tool: call.name.clone(),
                success: result.success,
                output: result.output.clone(),
            });

            self.context.add_tool_result(&call.id, &result.output);
            state.log_tool_call(
                call,
                &result,
                truncate_preview(&result.output, self.config.result_preview_chars),
            );

            let streak = state.track_failure(call, &result);
            let limit = self.config.max_consecutive_duplicates;
            if limit > 0 && streak >= limit {
                tracing::warn!(
                    "Tool '{}' failed identically {} times in a row, stopping",
                    call.name,
                    streak
                );
                // Every requested call still gets a result
                for skipped in &limited_calls[i + 1..] {
                    self.context.add_tool_result(
                        &skipped.id,
                        format!("Skipped: not run because '{}' kept failing", call.name),
                    );
                }
                return Some(format!(
                    "Stopped: tool '{}' failed {} times in a row with the same error: {}",
                    call.name, streak, result.output
                ));
            }
        }

        None
    }

    /// Look up, validate and run one call; never fails
    async fn execute_call(&self, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.tools.get(&call.name) else {
            tracing::warn!("Model requested unknown tool '{}'", call.name);
            return ToolResult::error(format!(
                "Unknown tool '{}'. Available tools: {}",
                call.name,
                self.tools.names().join(", ")
            ));
        };

        let arguments = match validate_arguments(&tool.parameters(), call.arguments.clone()) {
            Ok(args) => args,
            Err(e) => {
                tracing::debug!("Rejected arguments for '{}': {}", call.name, e);
                return ToolResult::error(format!("Invalid arguments for '{}': {}", call.name, e));
            }
        };

        self.tools.execute(&call.name, arguments).await
    }

    /// Apply per-turn tool call limit
    fn limit_tool_calls<'a>(&self, calls: &'a [ToolCall]) -> &'a [ToolCall] {
        if calls.len() > self.config.max_tools_per_turn {
            tracing::warn!(
                "Limiting {} tool calls to {}",
                calls.len(),
                self.config.max_tools_per_turn
            );
            &calls[..self.config.max_tools_per_turn]
        } else {
            calls
        }
    }
}

/// Bookkeeping for one cycle
#[derive(Default)]
struct LoopState {
    iterations: usize,
    tool_calls_made: usize,
    tool_log: Vec<ToolCallLog>,
    usage: TokenUsage,
    /// `name:args` and output of the most recent failure
    last_failure: Option<(String, String)>,
    failure_streak: usize,
}

impl LoopState {
    /// Update the failure streak and return its length
    fn track_failure(&mut self, call: &ToolCall, result: &ToolResult) -> usize {
        if result.success {
            self.last_failure = None;
            self.failure_streak = 0;
            return 0;
        }

        let key = format!(
            "{}:{}",
            call.name,
            serde_json::to_string(&call.arguments).unwrap_or_default()
        );
        let same = self
            .last_failure
            .as_ref()
            .is_some_and(|(k, out)| *k == key && *out == result.output);

        if same {
            self.failure_streak += 1;
        } else {
            self.failure_streak = 1;
            self.last_failure = Some((key, result.output.clone()));
        }
        self.failure_streak
    }

    fn add_usage(&mut self, usage: Option<&TokenUsage>) {
        if let Some(u) = usage {
            self.usage.input_tokens += u.input_tokens;
            self.usage.output_tokens += u.output_tokens;
            self.usage.total_tokens += u.total_tokens;
        }
    }

    fn log_tool_call(&mut self, call: &ToolCall, result: &ToolResult, preview: String) {
        self.tool_calls_made += 1;
        self.tool_log.push(ToolCallLog {
            tool: call.name.clone(),
            args: call.arguments.clone(),
            result_preview: preview,
            success: result.success,
        });
    }
}
