//! MCP tool bridge (spec §4.D): one persistent session per configured
//! server, reconnect-once-then-error, dynamic tool wrapping from JSON
//! Schema. Grounded on the teacher's `McpToolSource`/session-under-mutex
//! pattern (`loom/src/tool_source/mcp/mod.rs`), transported over Streamable
//! HTTP since that is the transport the gateway's own OAuth2.1 flow assumes.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::WardenError;

use super::{ToolCallContext, ToolCallable, ToolRegistry, ToolSchema, ToolSpec};

/// `auth.client_id`/`client_secret`, when configured (spec §4.D).
#[derive(Clone, Debug)]
pub struct McpAuth {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

struct McpSessionState {
    client: Client,
    url: String,
    auth: Option<McpAuth>,
    bearer: Option<String>,
}

impl McpSessionState {
    async fn ensure_bearer(&mut self) -> Result<(), WardenError> {
        let Some(auth) = &self.auth else { return Ok(()) };
        if self.bearer.is_some() {
            return Ok(());
        }
        let resp = self
            .client
            .post(&auth.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", &auth.client_id),
                ("client_secret", &auth.client_secret),
            ])
            .send()
            .await
            .map_err(|e| WardenError::BackendError(format!("mcp oauth request failed: {e}")))?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| WardenError::FormatMismatch(format!("invalid mcp oauth response: {e}")))?;
        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| WardenError::FormatMismatch("mcp oauth response missing access_token".into()))?;
        self.bearer = Some(token.to_string());
        Ok(())
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, WardenError> {
        self.ensure_bearer().await?;
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
        let mut req = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.bearer {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| WardenError::BackendError(format!("mcp request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(WardenError::BackendError(format!("mcp server returned {}", resp.status())));
        }
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| WardenError::FormatMismatch(format!("invalid mcp response: {e}")))?;
        if let Some(err) = payload.get("error") {
            return Err(WardenError::BackendError(format!("mcp error: {err}")));
        }
        payload
            .get("result")
            .cloned()
            .ok_or_else(|| WardenError::FormatMismatch("mcp response missing result".into()))
    }

    /// Re-establishes the session by forgetting any cached bearer token so the
    /// next request re-authenticates.
    fn reconnect(&mut self) {
        self.bearer = None;
    }
}

/// One server's persistent session, guarded by a lock so a reconnect can't
/// race a concurrent call (spec §5: "if the session is busy and reconnect is
/// requested, the second caller waits").
pub struct McpSession {
    server_name: String,
    state: Mutex<McpSessionState>,
}

impl McpSession {
    pub fn new(server_name: impl Into<String>, url: impl Into<String>, auth: Option<McpAuth>) -> Self {
        Self {
            server_name: server_name.into(),
            state: Mutex::new(McpSessionState { client: Client::new(), url: url.into(), auth, bearer: None }),
        }
    }

    /// `tools/list`, mapped into one [`ToolSpec`] per tool, named
    /// `mcp_<server>_<tool>` (spec §4.D).
    pub async fn list_tools(self: &Arc<Self>) -> Result<Vec<ToolSpec>, WardenError> {
        let mut guard = self.state.lock().await;
        let result = guard.request("tools/list", json!({})).await?;
        drop(guard);

        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| WardenError::FormatMismatch("tools/list missing tools array".into()))?;

        let mut specs = Vec::with_capacity(tools.len());
        for tool in tools {
            let name = tool
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| WardenError::FormatMismatch("mcp tool missing name".into()))?
                .to_string();
            let description = tool.get("description").and_then(Value::as_str).unwrap_or("").to_string();
            let parameters = tool.get("inputSchema").cloned().unwrap_or_else(|| json!({"type": "object"}));
            let qualified = format!("mcp_{}_{}", self.server_name, name);
            specs.push(ToolSpec {
                schema: ToolSchema { name: qualified, description, parameters },
                callable: Arc::new(McpToolCallable { session: self.clone(), remote_name: name }),
            });
        }
        Ok(specs)
    }

    /// Calls `tools/call`. On failure, reconnects once and retries; a second
    /// failure returns an error (spec §4.D).
    async fn call_tool(&self, remote_name: &str, arguments: Value) -> Result<Value, WardenError> {
        let params = json!({"name": remote_name, "arguments": arguments});
        let mut guard = self.state.lock().await;
        match guard.request("tools/call", params.clone()).await {
            Ok(v) => Ok(v),
            Err(first_err) => {
                warn!(server = %self.server_name, tool = %remote_name, "mcp call failed, reconnecting once: {first_err}");
                guard.reconnect();
                guard.request("tools/call", params).await.map_err(|second_err| {
                    WardenError::BackendError(format!(
                        "mcp tool '{remote_name}' failed after reconnect: {second_err}"
                    ))
                })
            }
        }
    }
}

struct McpToolCallable {
    session: Arc<McpSession>,
    remote_name: String,
}

#[async_trait]
impl ToolCallable for McpToolCallable {
    async fn call(&self, _ctx: &ToolCallContext, args: Value) -> Result<Value, WardenError> {
        self.session.call_tool(&self.remote_name, args).await
    }
}

/// Owns one session per configured server and the registry their tools land
/// in. Shutdown closes sessions in reverse insertion order (spec §4.D).
#[derive(Default)]
pub struct McpBridge {
    sessions: Vec<(String, Arc<McpSession>)>,
}

impl McpBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session for `server_name`, fetches its tool list, and registers
    /// every tool under its qualified name. Registration failures (names not
    /// resolvable against an existing ACL, etc.) are the caller's concern —
    /// this just returns what the server advertised.
    pub async fn connect_server(
        &mut self,
        server_name: impl Into<String>,
        url: impl Into<String>,
        auth: Option<McpAuth>,
        registry: &ToolRegistry,
    ) -> Result<usize, WardenError> {
        let server_name = server_name.into();
        let session = Arc::new(McpSession::new(server_name.clone(), url, auth));
        let specs = session.list_tools().await?;
        let count = specs.len();
        for spec in specs {
            registry.register(spec);
        }
        self.sessions.push((server_name, session));
        Ok(count)
    }

    /// Closes sessions in reverse insertion order. Sessions here are stateless
    /// HTTP clients with no persistent connection to tear down; this drops
    /// them so callers can't keep calling tools through a bridge mid-shutdown.
    pub fn shutdown(&mut self) {
        while let Some((name, _session)) = self.sessions.pop() {
            tracing::info!(server = %name, "closed mcp session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn connect_server_registers_tools_under_qualified_names() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"tools": [{"name": "search", "description": "searches", "inputSchema": {"type": "object"}}]}
            })))
            .mount(&server)
            .await;

        let registry = ToolRegistry::new();
        let mut bridge = McpBridge::new();
        let count = bridge.connect_server("exa", server.uri(), None, &registry).await.unwrap();
        assert_eq!(count, 1);
        assert!(registry.get("mcp_exa_search").is_some());
    }

    #[tokio::test]
    async fn shutdown_closes_sessions_without_panicking() {
        let mut bridge = McpBridge::new();
        bridge.sessions.push(("a".into(), Arc::new(McpSession::new("a", "http://localhost", None))));
        bridge.sessions.push(("b".into(), Arc::new(McpSession::new("b", "http://localhost", None))));
        bridge.shutdown();
        assert!(bridge.sessions.is_empty());
    }
}
