//! MCP transport implementations.
//!
//! Supports:
//! - STDIO: Spawn a child process and communicate via stdin/stdout (async)
//! - HTTP/SSE: see [`super::sse`]

use super::error::{McpError, McpResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// A bidirectional JSON-RPC channel to one MCP server
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for its response
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value>;

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()>;

    /// Release the connection; later requests fail with [`McpError::Closed`]
    async fn close(&self) -> McpResult<()>;

    /// Where this transport points, for logs and errors
    fn describe(&self) -> String;
}

/// JSON-RPC request
#[derive(Debug, Clone, Serialize)]
pub(crate) struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC notification
#[derive(Debug, Clone, Serialize)]
pub(crate) struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        }
    }
}

/// Any JSON-RPC message coming from the server
///
/// Server-initiated requests and notifications carry `method`; responses
/// carry `id` plus `result` or `error`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    /// Id of the request this message answers, if it is a response
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        self.id.as_ref().and_then(|id| match id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    pub fn into_result(self) -> McpResult<Value> {
        if let Some(error) = self.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        self.result
            .ok_or_else(|| McpError::Protocol("response has neither result nor error".into()))
    }
}

/// STDIO transport for MCP servers (async)
pub struct StdioTransport {
    command: String,
    /// Child process
    child: Arc<Mutex<Child>>,
    /// Request ID counter
    next_id: AtomicU64,
    /// Stdin writer
    stdin: Arc<Mutex<tokio::process::ChildStdin>>,
    /// Stdout reader
    stdout: Arc<Mutex<BufReader<tokio::process::ChildStdout>>>,
}

impl StdioTransport {
    /// Spawn a new MCP server process (async)
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> McpResult<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // Set environment variables (expand ${VAR} references)
        for (key, value) in env {
            cmd.env(key, expand_env_vars(value));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::connection(command, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::connection(command, "failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::connection(command, "failed to get stdout"))?;

        tracing::debug!("Spawned MCP server: {} {}", command, args.join(" "));

        Ok(Self {
            command: command.to_string(),
            child: Arc::new(Mutex::new(child)),
            next_id: AtomicU64::new(1),
            stdin: Arc::new(Mutex::new(stdin)),
            stdout: Arc::new(Mutex::new(BufReader::new(stdout))),
        })
    }

    async fn write_line(&self, line: &str) -> McpResult<()> {
        let mut stdin = self.stdin.lock().await;
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write.await.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe => McpError::Closed,
            _ => McpError::Io(e),
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request_str = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        tracing::debug!("MCP request: {}", request_str);

        // Hold the reader across the write so responses pair with their request
        let mut stdout = self.stdout.lock().await;
        self.write_line(&request_str).await?;

        loop {
            let mut line = String::new();
            if stdout.read_line(&mut line).await? == 0 {
                return Err(McpError::Closed);
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            tracing::debug!("MCP response: {}", line);

            let message: JsonRpcResponse = match serde_json::from_str(line) {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!("Skipping non JSON-RPC line from {}: {}", self.command, e);
                    continue;
                }
            };
            match message.response_id() {
                Some(rid) if rid == id => return message.into_result(),
                _ => continue,
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let notification_str = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        tracing::debug!("MCP notification: {}", notification_str);
        self.write_line(&notification_str).await
    }

    async fn close(&self) -> McpResult<()> {
        let mut child = self.child.lock().await;
        if child.try_wait()?.is_none() {
            child.kill().await?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.command.clone()
    }
}

/// Expand environment variable references like ${VAR} in a string
pub(crate) fn expand_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };

    re.replace_all(input, |cap: &regex::Captures| {
        std::env::var(&cap[1]).unwrap_or_else(|_| cap[0].to_string())
    })
    .into_owned()
}
