use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::llm::truncate_text;
use crate::relay::{RelayError, RelayErrorKind};

const MCP_ACCEPT: &str = "application/json, text/event-stream";
const SESSION_HEADER: &str = "Mcp-Session-Id";
const CLIENT_NAME: &str = "scenario-relay-rs";
const PROTOCOL_VERSION: &str = "1.0";

/// Session token issued by the tool server's `initialize` handshake.
/// Write-once at startup, read-only for the process lifetime.
#[derive(Debug, Clone)]
pub struct McpSession {
    token: String,
}

impl McpSession {
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Session-bound JSON-RPC client for the tool server. Every `tools/call`
/// after the handshake carries the session token.
#[derive(Debug, Clone)]
pub struct McpClient {
    http: Client,
    url: String,
    timeout: Duration,
    session: McpSession,
}

impl McpClient {
    /// Performs the `initialize` handshake and captures the session token
    /// from the `mcp-session-id` response header. Any failure here is
    /// startup-fatal for the relay; the caller must not serve requests
    /// without a session, and no retry is attempted.
    pub async fn connect(http: Client, url: String, timeout_ms: u64) -> Result<Self> {
        let timeout = Duration::from_millis(timeout_ms.max(1_000));
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": "init-001",
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": CLIENT_NAME,
                    "version": env!("CARGO_PKG_VERSION")
                }
            }
        });
        let response = http
            .post(&url)
            .timeout(timeout)
            .header("Accept", MCP_ACCEPT)
            .json(&envelope)
            .send()
            .await
            .with_context(|| format!("mcp initialize request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "mcp initialize rejected with status {}: {}",
                status.as_u16(),
                truncate_text(&body, 240)
            );
        }
        let token = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .context("mcp initialize response is missing the mcp-session-id header")?
            .to_owned();
        info!("acquired mcp session {token}");
        Ok(Self {
            http,
            url,
            timeout,
            session: McpSession { token },
        })
    }

    pub fn session(&self) -> &McpSession {
        &self.session
    }

    /// Executes one `tools/call` with a correlation id derived from the
    /// call's position in the batch, and normalizes the response body into a
    /// list of envelope entries. Any failure aborts the whole batch.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: &Map<String, Value>,
        seq: usize,
    ) -> Result<Vec<Value>, RelayError> {
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": format!("req-{seq}"),
            "method": "tools/call",
            "params": {
                "name": tool,
                "arguments": arguments
            }
        });
        debug!("dispatching {tool} as req-{seq}");
        let response = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .header("Accept", MCP_ACCEPT)
            .header(SESSION_HEADER, self.session.token())
            .json(&envelope)
            .send()
            .await
            .map_err(|err| {
                RelayError::new(
                    RelayErrorKind::McpTransport,
                    format!("tool call {tool} (req-{seq}) failed: {err}"),
                )
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|err| {
            RelayError::new(
                RelayErrorKind::McpTransport,
                format!("failed reading tool call {tool} response body: {err}"),
            )
        })?;
        if !status.is_success() {
            return Err(RelayError::new(
                RelayErrorKind::McpTransport,
                format!(
                    "tool call {tool} (req-{seq}) rejected with status {}: {}",
                    status.as_u16(),
                    truncate_text(&body, 240)
                ),
            ));
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            RelayError::new(
                RelayErrorKind::McpProtocol,
                format!("tool call {tool} (req-{seq}) returned invalid JSON: {err}"),
            )
        })?;
        match parsed {
            Value::Array(entries) => Ok(entries),
            envelope @ Value::Object(_) => Ok(vec![envelope]),
            other => Err(RelayError::new(
                RelayErrorKind::McpProtocol,
                format!("tool call {tool} (req-{seq}) returned an unexpected shape: {other}"),
            )),
        }
    }
}
