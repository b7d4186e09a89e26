//! MCP client for connecting to external MCP servers (async).

use super::error::{McpError, McpResult};
use super::sse::SseTransport;
use super::transport::{McpTransport, StdioTransport};
use super::types::{
    ensure_unique_names, parse_tool_list, ConnectionStatus, McpToolDef, McpToolResult,
    ServerCapabilities, ServerInfo, PROTOCOL_VERSION,
};
use super::wrapper::McpToolWrapper;
use crate::config::{McpConfig, McpServerConfig, ServerEndpoint};
use crate::tools::{RegistryError, ToolRegistry, ToolResult};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Reported instead of an empty result so the model cannot invent rows
pub const EMPTY_RESULT_TEXT: &str = "No entries found.";

/// Upper bound on `tools/list` pages from one server
const MAX_LIST_PAGES: usize = 64;

/// A live, initialized connection to one MCP server
pub struct McpClient {
    server_id: String,
    transport: Arc<dyn McpTransport>,
    server_info: ServerInfo,
    /// Parsed `capabilities`, or why the block could not be read
    capabilities: Result<ServerCapabilities, String>,
    request_timeout: Duration,
}

impl McpClient {
    /// Open the configured transport and perform the MCP handshake
    pub async fn connect(
        server_id: &str,
        config: &McpServerConfig,
        connect_timeout: Duration,
    ) -> McpResult<Self> {
        let endpoint = config
            .endpoint()
            .map_err(|e| McpError::connection(config.display_target(), e))?;

        let transport: Arc<dyn McpTransport> = match endpoint {
            ServerEndpoint::Sse(url) => Arc::new(SseTransport::connect(&url, connect_timeout).await?),
            ServerEndpoint::Stdio { command, args, env } => {
                Arc::new(StdioTransport::spawn(&command, &args, &env).await?)
            }
        };

        Self::handshake(server_id, transport, connect_timeout).await
    }

    /// Run `initialize` + `notifications/initialized` over an open transport
    ///
    /// Any failure here means the server is not usable and is reported as
    /// [`McpError::Connection`].
    pub async fn handshake(
        server_id: &str,
        transport: Arc<dyn McpTransport>,
        timeout: Duration,
    ) -> McpResult<Self> {
        let target = transport.describe();
        let init = async {
            let result = with_timeout(
                "initialize",
                timeout,
                transport.request(
                    "initialize",
                    Some(json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {},
                        "clientInfo": {
                            "name": "relay",
                            "version": env!("CARGO_PKG_VERSION")
                        }
                    })),
                ),
            )
            .await?;
            transport.notify("notifications/initialized", None).await?;
            Ok::<_, McpError>(result)
        };

        let result = match init.await {
            Ok(result) => result,
            Err(e) => {
                let _ = transport.close().await;
                return Err(match e {
                    McpError::Connection { .. } => e,
                    other => McpError::connection(target, other),
                });
            }
        };

        if let Some(version) = result.get("protocolVersion").and_then(|v| v.as_str()) {
            if version != PROTOCOL_VERSION {
                tracing::debug!(
                    "MCP server {} negotiated protocol {} (requested {})",
                    server_id,
                    version,
                    PROTOCOL_VERSION
                );
            }
        }

        let capabilities = match result.get("capabilities") {
            None | Some(Value::Null) => Ok(ServerCapabilities::default()),
            Some(raw) => serde_json::from_value::<ServerCapabilities>(raw.clone())
                .map_err(|e| format!("malformed capabilities from {}: {}", server_id, e)),
        };
        if let Err(reason) = &capabilities {
            tracing::warn!("{}", reason);
        }
        let server_info: ServerInfo = result
            .get("serverInfo")
            .cloned()
            .and_then(|s| serde_json::from_value(s).ok())
            .unwrap_or_default();

        tracing::info!(
            "Connected to MCP server {} ({} {}) at {}",
            server_id,
            server_info.name,
            server_info.version,
            target
        );

        Ok(Self {
            server_id: server_id.to_string(),
            transport,
            server_info,
            capabilities,
            request_timeout: timeout,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Fetch every tool the server advertises
    pub async fn list_tools(&self) -> McpResult<Vec<McpToolDef>> {
        let capabilities = self
            .capabilities
            .as_ref()
            .map_err(|reason| McpError::Protocol(reason.clone()))?;
        if capabilities.tools.is_none() {
            tracing::debug!("MCP server {} does not advertise tools", self.server_id);
            return Ok(Vec::new());
        }

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = with_timeout(
                "tools/list",
                self.request_timeout,
                self.transport.request("tools/list", params),
            )
            .await?;

            let page = parse_tool_list(&result)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    ensure_unique_names(&tools)?;
                    return Ok(tools);
                }
            }
        }

        Err(McpError::Protocol(format!(
            "tools/list from {} did not finish after {} pages",
            self.server_id, MAX_LIST_PAGES
        )))
    }

    /// Raw `tools/call`
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> McpResult<McpToolResult> {
        let result = with_timeout(
            "tools/call",
            timeout,
            self.transport.request(
                "tools/call",
                Some(json!({
                    "name": name,
                    "arguments": arguments
                })),
            ),
        )
        .await?;

        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("malformed tools/call result: {}", e)))
    }

    /// Invoke a tool, folding every failure into an error result
    ///
    /// Never retries.
    pub async fn invoke(&self, name: &str, arguments: Value, timeout: Duration) -> ToolResult {
        match self.call_tool(name, arguments, timeout).await {
            Ok(result) if result.is_error => {
                let text = result.to_text();
                if text.trim().is_empty() {
                    ToolResult::error(format!("Tool '{}' reported an error", name))
                } else {
                    ToolResult::error(text)
                }
            }
            Ok(result) => {
                let text = result.to_text();
                if is_empty_output(&text) {
                    ToolResult::success(EMPTY_RESULT_TEXT)
                } else {
                    ToolResult::success(text)
                }
            }
            Err(McpError::Timeout { secs, .. }) => ToolResult::error(format!(
                "MCP call to '{}' on server '{}' timed out after {}s. \
                 The external server may be unresponsive.",
                name, self.server_id, secs
            )),
            Err(e) => ToolResult::error(format!("MCP call failed: {}", e)),
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.transport.close().await {
            tracing::debug!("Error closing MCP server {}: {}", self.server_id, e);
        }
    }
}

fn is_empty_output(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || trimmed == "[]" || trimmed == "{}" || trimmed == "null"
}

async fn with_timeout<F>(method: &str, timeout: Duration, fut: F) -> McpResult<Value>
where
    F: std::future::Future<Output = McpResult<Value>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| {
            Err(McpError::Timeout {
                method: method.to_string(),
                secs: timeout.as_secs(),
            })
        })
}

/// Information about a configured MCP server
pub struct McpServerConnection {
    /// Server configuration (absent for attached clients)
    pub config: Option<McpServerConfig>,
    /// Connection status
    pub status: ConnectionStatus,
    client: Option<Arc<McpClient>>,
    /// Discovered tools
    pub tools: Vec<McpToolDef>,
}

impl McpServerConnection {
    fn new(config: Option<McpServerConfig>) -> Self {
        Self {
            config,
            status: ConnectionStatus::Disconnected,
            client: None,
            tools: Vec::new(),
        }
    }
}

/// Manages connections to multiple MCP servers (async)
pub struct McpServerManager {
    /// Server connections by ID, in a stable order
    connections: RwLock<BTreeMap<String, McpServerConnection>>,
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl McpServerManager {
    /// Create a manager for the enabled servers in `config`
    pub fn new(config: &McpConfig) -> Self {
        let connections = config
            .servers
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(id, s)| (id.clone(), McpServerConnection::new(Some(s.clone()))))
            .collect();

        Self {
            connections: RwLock::new(connections),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }

    /// Create an empty manager, for clients added with [`Self::attach`]
    pub fn empty(connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            connect_timeout,
            call_timeout,
        }
    }

    /// Get list of configured server IDs
    pub async fn server_ids(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Get connection status for a server
    pub async fn status(&self, server_id: &str) -> Option<ConnectionStatus> {
        self.connections
            .read()
            .await
            .get(server_id)
            .map(|c| c.status.clone())
    }

    /// Human-readable location of a configured server
    pub async fn target(&self, server_id: &str) -> Option<String> {
        self.connections
            .read()
            .await
            .get(server_id)
            .and_then(|c| c.config.as_ref().map(|cfg| cfg.display_target()))
    }

    /// Get all tools from a connected server
    pub async fn tools(&self, server_id: &str) -> Vec<McpToolDef> {
        self.connections
            .read()
            .await
            .get(server_id)
            .map(|c| c.tools.clone())
            .unwrap_or_default()
    }

    /// Check if a server is connected
    pub async fn is_connected(&self, server_id: &str) -> bool {
        self.connections
            .read()
            .await
            .get(server_id)
            .map(|c| c.status.is_connected())
            .unwrap_or(false)
    }

    async fn set_status(&self, server_id: &str, status: ConnectionStatus) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(server_id) {
            conn.status = status;
        }
    }

    /// Connect to one configured server and discover its tools
    ///
    /// Unreachable servers fail with [`McpError::Connection`]. A listing the
    /// server rejects or that cannot be read only degrades this server: it is
    /// marked failed, its tools are dropped and `Ok` is returned.
    pub async fn connect(&self, server_id: &str) -> McpResult<()> {
        let config = {
            let connections = self.connections.read().await;
            connections
                .get(server_id)
                .and_then(|c| c.config.clone())
                .ok_or_else(|| McpError::connection(server_id, "unknown server"))?
        };

        self.set_status(server_id, ConnectionStatus::Connecting).await;

        let client = match McpClient::connect(server_id, &config, self.connect_timeout).await {
            Ok(client) => client,
            Err(e) => {
                self.set_status(server_id, ConnectionStatus::Failed(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        self.attach(server_id, client).await
    }

    /// Register an already connected client and discover its tools
    pub async fn attach(&self, server_id: &str, client: McpClient) -> McpResult<()> {
        let client = Arc::new(client);

        let (status, tools) = match client.list_tools().await {
            Ok(tools) => {
                tracing::info!("MCP server {} provides {} tools", server_id, tools.len());
                (ConnectionStatus::Connected, tools)
            }
            Err(e @ (McpError::Protocol(_) | McpError::Rpc { .. } | McpError::Json(_))) => {
                tracing::warn!("Ignoring tools from MCP server {}: {}", server_id, e);
                client.close().await;
                (ConnectionStatus::Failed(e.to_string()), Vec::new())
            }
            Err(e) => {
                client.close().await;
                self.set_status(server_id, ConnectionStatus::Failed(e.to_string()))
                    .await;
                return Err(McpError::connection(server_id, e));
            }
        };

        let connected = status.is_connected();
        let mut connections = self.connections.write().await;
        let conn = connections
            .entry(server_id.to_string())
            .or_insert_with(|| McpServerConnection::new(None));
        conn.status = status;
        conn.tools = tools;
        conn.client = if connected { Some(client) } else { None };
        Ok(())
    }

    /// Connect every configured server in order, stopping at the first unreachable one
    pub async fn connect_all(&self) -> McpResult<()> {
        for id in self.server_ids().await {
            self.connect(&id).await?;
        }
        Ok(())
    }

    /// Build one registry holding the tools of every connected server
    ///
    /// Two servers advertising the same tool name is a configuration error.
    pub async fn merged_registry(&self) -> Result<ToolRegistry, RegistryError> {
        let connections = self.connections.read().await;
        let mut registry = ToolRegistry::new();

        for (server_id, conn) in connections.iter() {
            let Some(client) = conn.client.as_ref() else {
                continue;
            };
            for tool_def in &conn.tools {
                registry.register(Arc::new(McpToolWrapper::new(
                    server_id.clone(),
                    tool_def.clone(),
                    client.clone(),
                    self.call_timeout,
                )))?;
            }
        }

        Ok(registry)
    }

    /// Disconnect from a server (async)
    pub async fn disconnect(&self, server_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(server_id) {
            if let Some(client) = conn.client.take() {
                client.close().await;
            }
            conn.status = ConnectionStatus::Disconnected;
            conn.tools.clear();
            tracing::info!("Disconnected from MCP server: {}", server_id);
        }
    }

    /// Disconnect all servers (async) - for cleanup
    pub async fn disconnect_all(&self) {
        for id in self.server_ids().await {
            self.disconnect(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers from a fixed table keyed by method
    struct ScriptedTransport {
        responses: Mutex<BTreeMap<String, Vec<McpResult<Value>>>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<(&str, McpResult<Value>)>) -> Arc<Self> {
            let mut responses: BTreeMap<String, Vec<McpResult<Value>>> = BTreeMap::new();
            for (method, response) in script.into_iter().rev() {
                responses.entry(method.to_string()).or_default().push(response);
            }
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl McpTransport for ScriptedTransport {
        async fn request(&self, method: &str, _params: Option<Value>) -> McpResult<Value> {
            self.responses
                .lock()
                .unwrap()
                .get_mut(method)
                .and_then(|queue| queue.pop())
                .unwrap_or(Err(McpError::Closed))
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> McpResult<()> {
            Ok(())
        }

        async fn close(&self) -> McpResult<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    /// Completes the handshake, then never answers
    struct StallingTransport;

    #[async_trait]
    impl McpTransport for StallingTransport {
        async fn request(&self, method: &str, _params: Option<Value>) -> McpResult<Value> {
            if method == "initialize" {
                return init_ok().1;
            }
            std::future::pending().await
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> McpResult<()> {
            Ok(())
        }

        async fn close(&self) -> McpResult<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            "stalling".to_string()
        }
    }

    fn init_ok() -> (&'static str, McpResult<Value>) {
        (
            "initialize",
            Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "people-db", "version": "1.0"}
            })),
        )
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn handshake_reads_server_info() {
        let transport = ScriptedTransport::new(vec![init_ok()]);
        let client = McpClient::handshake("database", transport, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(client.server_info().name, "people-db");
    }

    #[tokio::test]
    async fn failed_handshake_is_connection_error() {
        let transport = ScriptedTransport::new(vec![]);
        let err = McpClient::handshake("database", transport, TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::Connection { .. }));
    }

    #[tokio::test]
    async fn list_tools_follows_cursor() {
        let transport = ScriptedTransport::new(vec![
            init_ok(),
            (
                "tools/list",
                Ok(json!({"tools": [{"name": "add_data"}], "nextCursor": "2"})),
            ),
            ("tools/list", Ok(json!({"tools": [{"name": "read_data"}]}))),
        ]);
        let client = McpClient::handshake("database", transport, TIMEOUT)
            .await
            .unwrap();
        let names: Vec<_> = client
            .list_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["add_data", "read_data"]);
    }

    #[tokio::test]
    async fn invoke_folds_failures_into_results() {
        let transport = ScriptedTransport::new(vec![
            init_ok(),
            (
                "tools/call",
                Ok(json!({"content": [{"type": "text", "text": "no such table"}], "isError": true})),
            ),
            ("tools/call", Ok(json!({"content": []}))),
            ("tools/call", Err(McpError::Closed)),
            (
                "tools/call",
                Ok(json!({"content": [{"type": "text", "text": "(1, 'Momo', 25, 'Designer')"}]})),
            ),
        ]);
        let client = McpClient::handshake("database", transport, TIMEOUT)
            .await
            .unwrap();

        let failed = client.invoke("read_data", json!({}), TIMEOUT).await;
        assert!(!failed.success);
        assert_eq!(failed.output, "no such table");

        let empty = client.invoke("read_data", json!({}), TIMEOUT).await;
        assert!(empty.success);
        assert_eq!(empty.output, EMPTY_RESULT_TEXT);

        let closed = client.invoke("read_data", json!({}), TIMEOUT).await;
        assert!(!closed.success);
        assert!(closed.output.contains("connection closed"));

        let rows = client.invoke("read_data", json!({}), TIMEOUT).await;
        assert!(rows.success);
        assert!(rows.output.contains("Momo"));
    }

    #[tokio::test]
    async fn invoke_reports_timeouts_as_error_results() {
        let transport = Arc::new(StallingTransport);
        let client = McpClient::handshake("weather", transport, TIMEOUT)
            .await
            .unwrap();

        let result = client
            .invoke(
                "get_forecast",
                json!({"latitude": 40.7, "longitude": -74.0}),
                Duration::from_millis(50),
            )
            .await;
        assert!(!result.success);
        assert!(result.output.contains("timed out"), "{}", result.output);
        assert!(result.output.contains("get_forecast"));
    }

    #[tokio::test]
    async fn unreadable_capabilities_degrade_the_server() {
        let transport = ScriptedTransport::new(vec![
            (
                "initialize",
                Ok(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {"listChanged": null}},
                    "serverInfo": {"name": "people-db", "version": "1.0"}
                })),
            ),
            ("tools/list", Ok(json!({"tools": [{"name": "read_data"}]}))),
        ]);
        let client = McpClient::handshake("database", transport, TIMEOUT)
            .await
            .unwrap();
        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, McpError::Protocol(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn rejected_listing_degrades_only_that_server() {
        let manager = McpServerManager::empty(TIMEOUT, TIMEOUT);
        let transport = ScriptedTransport::new(vec![
            init_ok(),
            (
                "tools/list",
                Err(McpError::Rpc {
                    code: -32603,
                    message: "internal".to_string(),
                }),
            ),
        ]);
        let client = McpClient::handshake("database", transport, TIMEOUT)
            .await
            .unwrap();

        manager.attach("database", client).await.unwrap();
        match manager.status("database").await {
            Some(ConnectionStatus::Failed(reason)) => assert!(reason.contains("-32603")),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(manager.merged_registry().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_listing_degrades_only_that_server() {
        let manager = McpServerManager::empty(TIMEOUT, TIMEOUT);

        let good = ScriptedTransport::new(vec![
            init_ok(),
            (
                "tools/list",
                Ok(json!({"tools": [{"name": "get_alerts"}, {"name": "get_forecast"}]})),
            ),
        ]);
        let bad = ScriptedTransport::new(vec![init_ok(), ("tools/list", Ok(json!({"oops": 1})))]);

        let weather = McpClient::handshake("weather", good, TIMEOUT).await.unwrap();
        let database = McpClient::handshake("database", bad, TIMEOUT).await.unwrap();
        manager.attach("weather", weather).await.unwrap();
        manager.attach("database", database).await.unwrap();

        assert!(manager.is_connected("weather").await);
        assert!(matches!(
            manager.status("database").await,
            Some(ConnectionStatus::Failed(_))
        ));
        assert!(manager.tools("database").await.is_empty());

        let registry = manager.merged_registry().await.unwrap();
        assert_eq!(registry.names(), vec!["get_alerts", "get_forecast"]);
    }

    #[tokio::test]
    async fn colliding_servers_are_rejected_at_merge() {
        let manager = McpServerManager::empty(TIMEOUT, TIMEOUT);
        for id in ["a", "b"] {
            let transport = ScriptedTransport::new(vec![
                init_ok(),
                ("tools/list", Ok(json!({"tools": [{"name": "read_data"}]}))),
            ]);
            let client = McpClient::handshake(id, transport, TIMEOUT).await.unwrap();
            manager.attach(id, client).await.unwrap();
        }

        match manager.merged_registry().await {
            Err(RegistryError::DuplicateTool {
                name,
                existing,
                incoming,
            }) => {
                assert_eq!(name, "read_data");
                assert_eq!(existing, "a");
                assert_eq!(incoming, "b");
            }
            other => panic!("expected DuplicateTool, got {:?}", other.map(|r| r.len())),
        }
    }
}
