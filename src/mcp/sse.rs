//! MCP over HTTP + Server-Sent Events
//!
//! The client opens a long-lived `GET` on the server's SSE url. The first
//! `endpoint` event names the url that JSON-RPC messages are `POST`ed to;
//! every response then comes back on the event stream as a `message` event
//! and is routed to its waiting request by id.

use super::error::{McpError, McpResult};
use super::transport::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpTransport};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

/// A decoded Server-Sent Event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the server sent none
    pub event: String,
    /// `data:` lines joined with `\n`
    pub data: String,
}

/// Incremental SSE parser
///
/// Bytes can arrive split anywhere, including inside a UTF-8 sequence, so
/// lines are only decoded once complete.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every event completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a final event that was not terminated by a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r').to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        // Comment / keep-alive
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes a pending entry when its request is dropped (timeout, error)
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

/// SSE transport for MCP servers
pub struct SseTransport {
    sse_url: String,
    post_url: Url,
    client: reqwest::Client,
    next_id: AtomicU64,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its endpoint
    pub async fn connect(sse_url: &str, timeout: Duration) -> McpResult<Self> {
        let base = Url::parse(sse_url).map_err(|e| McpError::connection(sse_url, e))?;
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| McpError::connection(sse_url, e))?;

        let handshake = async {
            let response = client
                .get(base.clone())
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send()
                .await
                .map_err(|e| McpError::connection(sse_url, e))?;

            if !response.status().is_success() {
                return Err(McpError::connection(
                    sse_url,
                    format!("HTTP {}", response.status()),
                ));
            }

            let mut stream = Box::pin(response.bytes_stream());
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| McpError::connection(sse_url, e))?;
                let mut events = decoder.push(&chunk).into_iter();
                while let Some(event) = events.next() {
                    if event.event != "endpoint" {
                        tracing::debug!("Ignoring `{}` event before endpoint", event.event);
                        continue;
                    }
                    let post_url = base.join(event.data.trim()).map_err(|e| {
                        McpError::Protocol(format!("bad endpoint `{}`: {}", event.data, e))
                    })?;
                    return Ok::<_, McpError>((
                        stream,
                        decoder,
                        post_url,
                        events.collect::<Vec<_>>(),
                    ));
                }
            }
            Err(McpError::connection(
                sse_url,
                "stream ended before the endpoint event",
            ))
        };

        let (stream, decoder, post_url, backlog) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| {
                McpError::connection(
                    sse_url,
                    format!("no endpoint event within {}s", timeout.as_secs()),
                )
            })??;

        tracing::debug!("MCP SSE endpoint for {}: {}", sse_url, post_url);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_events(
            stream,
            decoder,
            backlog,
            pending.clone(),
            closed.clone(),
            sse_url.to_string(),
        ));

        Ok(Self {
            sse_url: sse_url.to_string(),
            post_url,
            client,
            next_id: AtomicU64::new(1),
            pending,
            closed,
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn post(&self, body: String) -> McpResult<()> {
        let response = self
            .client
            .post(self.post_url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::Protocol(format!(
                "POST {} returned {}: {}",
                self.post_url, status, text
            )));
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        // Dropping the senders wakes every waiter with Closed
        lock_pending(&self.pending).clear();
    }
}

async fn read_events<S, B>(
    mut stream: S,
    mut decoder: SseDecoder,
    backlog: Vec<SseEvent>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    sse_url: String,
) where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin + Send + 'static,
    B: AsRef<[u8]>,
{
    for event in backlog {
        route_event(&event, &pending);
    }

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                for event in decoder.push(bytes.as_ref()) {
                    route_event(&event, &pending);
                }
            }
            Err(e) => {
                tracing::warn!("MCP event stream from {} failed: {}", sse_url, e);
                break;
            }
        }
    }
    if let Some(event) = decoder.finish() {
        route_event(&event, &pending);
    }

    tracing::debug!("MCP event stream from {} ended", sse_url);
    closed.store(true, Ordering::SeqCst);
    lock_pending(&pending).clear();
}

fn route_event(event: &SseEvent, pending: &PendingMap) {
    if event.event != "message" {
        tracing::debug!("Ignoring SSE event `{}`", event.event);
        return;
    }

    let message: JsonRpcResponse = match serde_json::from_str(&event.data) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("Dropping malformed MCP message: {}", e);
            return;
        }
    };
    tracing::debug!("MCP response: {}", event.data);

    let Some(id) = message.response_id() else {
        return;
    };
    match lock_pending(pending).remove(&id) {
        Some(tx) => {
            let _ = tx.send(message);
        }
        None => tracing::debug!("No pending request for MCP response id {}", id),
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        tracing::debug!("MCP request: {}", body);

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.post(body).await?;

        match rx.await {
            Ok(response) => response.into_result(),
            Err(_) => Err(McpError::Closed),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }
        let body = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        tracing::debug!("MCP notification: {}", body);
        self.post(body).await
    }

    async fn close(&self) -> McpResult<()> {
        self.shutdown();
        Ok(())
    }

    fn describe(&self) -> String {
        self.sse_url.clone()
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
