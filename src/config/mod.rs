//! Configuration management for relay
//!
//! Everything is read once at startup: the TOML file, then `OLLAMA_*`
//! environment overrides, then command-line flags. Nothing is reconfigured
//! while a session is running.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// System instruction handed to the model at the start of every session
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an AI assistant with access to both weather information and database operations.

Available capabilities:
- Database operations: Add and read people data (name, age, profession)
- Weather information: Get weather alerts and forecasts for US locations

Tools available:
- add_data(query): Add people to database using SQL INSERT
- read_data(query): Query people database using SQL SELECT
- get_alerts(state): Get weather alerts for US states (use 2-letter codes like \"CA\", \"NY\")
- get_forecast(latitude, longitude): Get weather forecast for coordinates

Only report data that a tool actually returned. If a tool fails, say so instead of guessing.
You can help with database management, weather queries, or both!
";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model backend kind (only "ollama" is built in)
    pub provider: String,
    pub base_url: String,
    pub model: String,
    /// Upper bound for a single model request, in seconds
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub system_prompt: String,
    /// Model round-trips allowed per user message
    pub max_iterations: usize,
    /// Tool calls honoured from a single model response
    pub max_tools_per_turn: usize,
    /// Identical failing calls tolerated before the cycle is abandoned
    pub max_consecutive_duplicates: usize,
    /// Characters of tool output shown in the trace
    pub result_preview_chars: usize,
    /// Print tool calls and results while the agent works
    pub verbose: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_iterations: 8,
            max_tools_per_turn: 5,
            max_consecutive_duplicates: 2,
            result_preview_chars: 200,
            verbose: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub connect_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub servers: BTreeMap<String, McpServerConfig>,
}

impl Default for McpConfig {
    fn default() -> Self {
        let mut servers = BTreeMap::new();
        servers.insert(
            "database".to_string(),
            McpServerConfig::sse("http://127.0.0.1:8000/sse"),
        );
        servers.insert(
            "weather".to_string(),
            McpServerConfig::sse("http://127.0.0.1:8001/sse"),
        );

        Self {
            connect_timeout_secs: 10,
            call_timeout_secs: 30,
            servers,
        }
    }
}

/// One MCP server entry. Either `url` (HTTP+SSE) or `command` (stdio) is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment for spawned servers; `${VAR}` references are expanded
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Where and how to reach a server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEndpoint {
    Sse(String),
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
}

impl McpServerConfig {
    pub fn sse(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            enabled: true,
        }
    }

    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            url: None,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            enabled: true,
        }
    }

    /// Resolve the transport for this entry
    pub fn endpoint(&self) -> Result<ServerEndpoint> {
        match (&self.url, &self.command) {
            (Some(url), None) => Ok(ServerEndpoint::Sse(url.clone())),
            (None, Some(command)) => Ok(ServerEndpoint::Stdio {
                command: command.clone(),
                args: self.args.clone(),
                env: self.env.clone(),
            }),
            (Some(_), Some(_)) => anyhow::bail!("set either `url` or `command`, not both"),
            (None, None) => anyhow::bail!("one of `url` or `command` is required"),
        }
    }

    /// Human-readable location used in logs and startup hints
    pub fn display_target(&self) -> String {
        match (&self.url, &self.command) {
            (Some(url), _) => url.clone(),
            (None, Some(command)) if self.args.is_empty() => command.clone(),
            (None, Some(command)) => format!("{} {}", command, self.args.join(" ")),
            (None, None) => "(unconfigured)".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location when `None`
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            tracing::debug!("No config at {}, using defaults", config_path.display());
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "relay") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Ok(PathBuf::from("config.toml"))
        }
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Apply `OLLAMA_BASE_URL` / `OLLAMA_MODEL` when set
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("OLLAMA_BASE_URL").filter(|v| !v.is_empty()) {
            self.llm.base_url = url;
        }
        if let Some(model) = lookup("OLLAMA_MODEL").filter(|v| !v.is_empty()) {
            self.llm.model = model;
        }
    }

    /// Point server `name` at an SSE url, replacing any existing entry
    pub fn set_server_url(&mut self, name: &str, url: &str) {
        self.mcp
            .servers
            .insert(name.to_string(), McpServerConfig::sse(url));
    }

    /// Enabled servers in a stable order
    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &McpServerConfig)> {
        self.mcp.servers.iter().filter(|(_, s)| s.enabled)
    }

    pub fn validate(&self) -> Result<()> {
        if self.llm.request_timeout_secs == 0 {
            anyhow::bail!("llm.request_timeout_secs must be greater than zero");
        }
        if self.agent.max_iterations == 0 {
            anyhow::bail!("agent.max_iterations must be greater than zero");
        }
        for (name, server) in &self.mcp.servers {
            server
                .endpoint()
                .with_context(|| format!("Invalid MCP server `{}`", name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_services() {
        let config = Config::default();
        assert_eq!(config.llm.model, "llama3.2");
        assert_eq!(config.llm.request_timeout_secs, 120);
        assert_eq!(config.mcp.servers.len(), 2);
        assert_eq!(
            config.mcp.servers["database"].url.as_deref(),
            Some("http://127.0.0.1:8000/sse")
        );
        assert_eq!(
            config.mcp.servers["weather"].url.as_deref(),
            Some("http://127.0.0.1:8001/sse")
        );
        assert!(config.agent.system_prompt.contains("add_data(query)"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [llm]
            model = "qwen2.5"

            [agent]
            max_iterations = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.llm.model, "qwen2.5");
        assert_eq!(config.llm.base_url, "http://localhost:11434");
        assert_eq!(config.agent.max_iterations, 3);
        assert_eq!(config.agent.result_preview_chars, 200);
        assert_eq!(config.mcp.servers.len(), 2);
    }

    #[test]
    fn stdio_server_entry_parses() {
        let config: Config = toml::from_str(
            r#"
            [mcp.servers.weather]
            command = "python"
            args = ["weather_server.py"]
            env = { API_KEY = "${WEATHER_KEY}" }
            "#,
        )
        .unwrap();

        let weather = &config.mcp.servers["weather"];
        assert_eq!(
            weather.endpoint().unwrap(),
            ServerEndpoint::Stdio {
                command: "python".to_string(),
                args: vec!["weather_server.py".to_string()],
                env: HashMap::from([("API_KEY".to_string(), "${WEATHER_KEY}".to_string())]),
            }
        );
        assert_eq!(weather.display_target(), "python weather_server.py");
        // Only the weather entry is replaced; the table is not merged with defaults
        assert_eq!(config.mcp.servers.len(), 1);
    }

    #[test]
    fn server_with_both_url_and_command_is_rejected() {
        let mut config = Config::default();
        config.mcp.servers.insert(
            "broken".to_string(),
            McpServerConfig {
                command: Some("python".to_string()),
                ..McpServerConfig::sse("http://localhost:9000/sse")
            },
        );
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("broken"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        config.apply_overrides_from(|key| match key {
            "OLLAMA_BASE_URL" => Some("http://gpu-box:11434".to_string()),
            "OLLAMA_MODEL" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.llm.base_url, "http://gpu-box:11434");
        // Empty values are ignored
        assert_eq!(config.llm.model, "llama3.2");
    }

    #[test]
    fn disabled_servers_are_skipped() {
        let mut config = Config::default();
        if let Some(weather) = config.mcp.servers.get_mut("weather") {
            weather.enabled = false;
        }
        let names: Vec<_> = config.enabled_servers().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["database"]);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.set_server_url("database", "http://10.0.0.5:8000/sse");
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(Some(&path)).unwrap();
        assert_eq!(
            loaded.mcp.servers["database"].url.as_deref(),
            Some("http://10.0.0.5:8000/sse")
        );
        assert_eq!(loaded.agent.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.llm.provider, "ollama");
    }
}
