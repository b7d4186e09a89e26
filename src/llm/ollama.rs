//! Ollama LLM provider implementation (local models)

use super::{LlmError, LlmProvider, LlmResponse, Message, Role, TokenUsage, ToolCall, ToolDefinition};
use crate::config::LlmConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2";
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Generate a unique tool call ID for Ollama tool calls
///
/// Ollama does not assign ids of its own.
fn generate_tool_call_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ollama_call_{}", id)
}

pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

/// Model info returned from Ollama's /api/tags endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

impl OllamaProvider {
    /// Create a provider against the default local endpoint
    pub fn new() -> Result<Self> {
        Self::with_timeout(
            DEFAULT_OLLAMA_URL,
            DEFAULT_MODEL,
            Duration::from_secs(120),
        )
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Self::with_timeout(
            &config.base_url,
            &config.model,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn with_timeout(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check if Ollama is running and reachable
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// List available models from Ollama's /api/tags endpoint
    pub async fn list_models(&self) -> Result<Vec<OllamaModelInfo>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(LlmError::from_network_error)
            .context("Failed to connect to Ollama - is it running? Try: ollama serve")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_http_status(status, error_text).into());
        }

        #[derive(Deserialize)]
        struct TagsResponse {
            #[serde(default)]
            models: Vec<OllamaModelInfo>,
        }

        let resp: TagsResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        Ok(resp.models)
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<OllamaMessage> {
        // Tool results reference calls by id; Ollama wants the tool name instead
        let mut call_names: HashMap<String, String> = HashMap::new();

        messages
            .iter()
            .map(|msg| match msg.role {
                Role::System | Role::User => OllamaMessage {
                    role: match msg.role {
                        Role::System => "system".to_string(),
                        _ => "user".to_string(),
                    },
                    content: msg.content.as_text().unwrap_or("").to_string(),
                    tool_calls: None,
                    tool_name: None,
                },
                Role::Assistant => {
                    let calls = msg.tool_calls();
                    let tool_calls = if calls.is_empty() {
                        None
                    } else {
                        Some(
                            calls
                                .into_iter()
                                .map(|tc| {
                                    call_names.insert(tc.id, tc.name.clone());
                                    OllamaToolCall {
                                        function: OllamaToolCallFunction {
                                            name: tc.name,
                                            arguments: tc.arguments,
                                        },
                                    }
                                })
                                .collect(),
                        )
                    };
                    OllamaMessage {
                        role: "assistant".to_string(),
                        content: msg.content.as_text().unwrap_or("").to_string(),
                        tool_calls,
                        tool_name: None,
                    }
                }
                Role::Tool => OllamaMessage {
                    role: "tool".to_string(),
                    content: msg.content.as_text().unwrap_or("").to_string(),
                    tool_calls: None,
                    tool_name: msg
                        .tool_call_id
                        .as_ref()
                        .and_then(|id| call_names.get(id).cloned()),
                },
            })
            .collect()
    }

    /// Convert ToolDefinition to native Ollama tool format
    fn convert_tools(tools: &[ToolDefinition]) -> Vec<OllamaTool> {
        tools
            .iter()
            .map(|t| OllamaTool {
                type_field: "function".to_string(),
                function: OllamaFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    async fn send_request(&self, request: OllamaRequest) -> Result<OllamaResponse> {
        let url = format!("{}/api/chat", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(LlmError::from_network_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_http_status(status, error_text).into());
        }

        response
            .json::<OllamaResponse>()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()).into())
    }

    /// Recover a tool call that the model wrote as plain JSON text
    ///
    /// Smaller models sometimes answer `{"name": ..., "parameters": ...}`
    /// instead of using native tool calls. Only names from `tools` are
    /// accepted so ordinary JSON answers are left alone.
    fn parse_tool_call(content: &str, tools: &[ToolDefinition]) -> Option<ToolCall> {
        let content = content.trim();

        let start = content.find('{')?;
        let end = content.rfind('}')?;
        if end < start {
            return None;
        }
        let json_str = &content[start..=end];

        let value: serde_json::Value = serde_json::from_str(json_str).ok()?;
        let obj = value.as_object()?;

        let name = obj
            .get("name")
            .or_else(|| obj.get("tool"))
            .and_then(|v| v.as_str())?;
        let arguments = obj
            .get("parameters")
            .or_else(|| obj.get("arguments"))
            .or_else(|| obj.get("args"))
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        if !tools.iter().any(|t| t.name == name) {
            return None;
        }

        Some(ToolCall {
            id: generate_tool_call_id(),
            name: name.to_string(),
            arguments,
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn health_check(&self) -> Result<()> {
        if !self.is_available().await {
            return Err(LlmError::Unreachable(format!(
                "no Ollama server at {}. Is `ollama serve` running?",
                self.base_url
            ))
            .into());
        }
        let models = self.list_models().await?;
        let installed = models.iter().any(|m| {
            m.name == self.model || m.name.split(':').next() == Some(self.model.as_str())
        });
        if !installed {
            return Err(LlmError::ModelNotFound(format!(
                "{} is not installed. Try: ollama pull {}",
                self.model, self.model
            ))
            .into());
        }
        Ok(())
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse> {
        let ollama_messages = self.convert_messages(messages);

        // Convert tools to native Ollama format
        let ollama_tools = tools.filter(|t| !t.is_empty()).map(Self::convert_tools);

        let request = OllamaRequest {
            model: self.model.clone(),
            messages: ollama_messages,
            stream: false,
            tools: ollama_tools,
        };

        let response = self.send_request(request).await?;
        let usage = response.usage();

        // Check if model returned tool calls (native tool calling)
        if let Some(tool_calls) = response.message.tool_calls {
            if !tool_calls.is_empty() {
                let calls = tool_calls
                    .into_iter()
                    .map(|tc| ToolCall {
                        id: generate_tool_call_id(),
                        name: tc.function.name,
                        arguments: tc.function.arguments,
                    })
                    .collect();

                let text = Some(response.message.content).filter(|t| !t.trim().is_empty());
                return Ok(match text {
                    Some(text) => LlmResponse::Mixed {
                        text: Some(text),
                        tool_calls: calls,
                        usage,
                    },
                    None => LlmResponse::ToolCalls { calls, usage },
                });
            }
        }

        // Fallback: try to parse tool call from text (for models that output JSON)
        let content = &response.message.content;
        if let Some(tool_call) = tools.and_then(|t| Self::parse_tool_call(content, t)) {
            tracing::debug!("Recovered text-encoded tool call: {}", tool_call.name);
            return Ok(LlmResponse::ToolCalls {
                calls: vec![tool_call],
                usage,
            });
        }

        Ok(LlmResponse::Text {
            text: response.message.content,
            usage,
        })
    }
}

// Ollama API types

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OllamaTool>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

impl OllamaResponse {
    fn usage(&self) -> Option<TokenUsage> {
        if self.prompt_eval_count.is_none() && self.eval_count.is_none() {
            return None;
        }
        let input_tokens = self.prompt_eval_count.unwrap_or(0);
        let output_tokens = self.eval_count.unwrap_or(0);
        Some(TokenUsage {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        })
    }
}

// Native tool calling types
#[derive(Debug, Clone, Serialize)]
struct OllamaTool {
    #[serde(rename = "type")]
    type_field: String,
    function: OllamaFunction,
}

#[derive(Debug, Clone, Serialize)]
struct OllamaFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaToolCallFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        }
    }

    #[test]
    fn tool_results_carry_the_tool_name() {
        let provider = OllamaProvider::new().unwrap();
        let call = ToolCall {
            id: "ollama_call_7".to_string(),
            name: "get_alerts".to_string(),
            arguments: json!({"state": "CA"}),
        };
        let messages = vec![
            Message::system("sys"),
            Message::user("alerts in CA?"),
            Message::assistant_tool_calls(std::slice::from_ref(&call)),
            Message::tool_result("ollama_call_7", "No active alerts"),
        ];

        let converted = provider.convert_messages(&messages);
        assert_eq!(converted.len(), 4);
        assert_eq!(converted[0].role, "system");

        let assistant = serde_json::to_value(&converted[2]).unwrap();
        assert_eq!(
            assistant["tool_calls"][0]["function"]["name"],
            json!("get_alerts")
        );
        assert_eq!(
            assistant["tool_calls"][0]["function"]["arguments"]["state"],
            json!("CA")
        );

        assert_eq!(converted[3].role, "tool");
        assert_eq!(converted[3].tool_name.as_deref(), Some("get_alerts"));
        assert_eq!(converted[3].content, "No active alerts");
    }

    #[test]
    fn plain_messages_omit_tool_fields() {
        let provider = OllamaProvider::new().unwrap();
        let converted = provider.convert_messages(&[Message::user("hi")]);
        let value = serde_json::to_value(&converted[0]).unwrap();
        assert!(value.get("tool_calls").is_none());
        assert!(value.get("tool_name").is_none());
    }

    #[test]
    fn parses_text_encoded_tool_call_for_known_tool() {
        let tools = vec![tool("read_data")];
        let call = OllamaProvider::parse_tool_call(
            r#"{"name": "read_data", "parameters": {"query": "SELECT * FROM people"}}"#,
            &tools,
        )
        .unwrap();
        assert_eq!(call.name, "read_data");
        assert_eq!(call.arguments["query"], json!("SELECT * FROM people"));
    }

    #[test]
    fn ignores_json_naming_unknown_tool() {
        let tools = vec![tool("read_data")];
        assert!(OllamaProvider::parse_tool_call(r#"{"name": "Alice", "age": 30}"#, &tools).is_none());
        assert!(OllamaProvider::parse_tool_call("no json here", &tools).is_none());
    }

    #[test]
    fn usage_from_eval_counts() {
        let response: OllamaResponse = serde_json::from_value(json!({
            "message": {"role": "assistant", "content": "hi"},
            "prompt_eval_count": 26,
            "eval_count": 7
        }))
        .unwrap();
        let usage = response.usage().unwrap();
        assert_eq!(usage.total_tokens, 33);

        let response: OllamaResponse = serde_json::from_value(json!({
            "message": {"role": "assistant", "content": "hi"}
        }))
        .unwrap();
        assert!(response.usage().is_none());
    }

    #[test]
    fn builder_trims_trailing_slash() {
        let provider = OllamaProvider::new()
            .unwrap()
            .with_base_url("http://gpu-box:11434/")
            .with_model("qwen2.5");
        assert_eq!(provider.base_url(), "http://gpu-box:11434");
        assert_eq!(provider.model(), "qwen2.5");
    }
}
