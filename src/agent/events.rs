//! Observable progress of one agent cycle

use serde_json::Value;

/// Emitted while the agent works on a user message, in order
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A tool is about to run
    Invoked { tool: String, arguments: Value },
    /// A tool finished; `success` is false for every kind of failure
    Returned {
        tool: String,
        success: bool,
        output: String,
    },
    /// The cycle is over; always the last event
    FinalAnswer { text: String, stop: StopReason },
}

/// Why a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model answered
    Answered,
    /// The per-message iteration cap was hit
    LoopLimitExceeded,
    /// The same call kept failing the same way
    RepeatedToolFailure,
}

/// Truncate preview text to `max_len` bytes, on a char boundary
pub fn truncate_preview(text: &str, max_len: usize) -> String {
    if text.len() > max_len {
        format!("{}...", truncate_at_char_boundary(text, max_len))
    } else {
        text.to_string()
    }
}

/// Truncate at UTF-8 character boundary
fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> &str {
    if max_bytes >= s.len() {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
