//! Anthropic Messages dialect backend (spec §4.C). POSTs to
//! `{base_url}/v1/messages`; the system prompt is a top-level field, not a
//! message in the array.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::error::WardenError;
use crate::message::{Dialect, Message, ToolCallRequest};

use super::{LlmClient, LlmRequest, LlmResponse, ToolChoiceMode};

const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicMessagesClient {
    http: Client,
    base_url: String,
    api_key: String,
    anthropic_version: String,
}

impl AnthropicMessagesClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            anthropic_version: "2023-06-01".to_string(),
        }
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_body(&self, request: &LlmRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| !matches!(m, Message::System { .. }))
            .map(|m| m.to_backend_format(Dialect::AnthropicMessages))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if let Some(sys) = &request.system_prompt {
            body["system"] = json!(sys);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| json!({"name": t.schema.name, "description": t.schema.description, "input_schema": t.schema.parameters}))
                .collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = match request.tool_choice {
                ToolChoiceMode::Auto => json!({"type": "auto"}),
                ToolChoiceMode::None => json!({"type": "none"}),
                ToolChoiceMode::Required => json!({"type": "any"}),
            };
        }
        body
    }
}

fn parse_content_blocks(content: &Value) -> Result<LlmResponse, WardenError> {
    let blocks = content
        .as_array()
        .ok_or_else(|| WardenError::FormatMismatch("content is not a block array".into()))?;
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => text.push_str(block.get("text").and_then(Value::as_str).unwrap_or("")),
            Some("tool_use") => {
                let id = block.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let name = block.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                let args = block.get("input").cloned().unwrap_or(Value::Null);
                tool_calls.push(ToolCallRequest { id, name, args });
            }
            _ => {}
        }
    }
    if text.is_empty() && tool_calls.is_empty() {
        return Err(WardenError::FormatMismatch("response had neither text nor tool_use blocks".into()));
    }
    Ok(LlmResponse { content: text, tool_calls })
}

#[async_trait]
impl LlmClient for AnthropicMessagesClient {
    async fn invoke_native(&self, request: &LlmRequest) -> Option<Result<LlmResponse, WardenError>> {
        Some(self.invoke_impl(request).await)
    }
}

impl AnthropicMessagesClient {
    async fn invoke_impl(&self, request: &LlmRequest) -> Result<LlmResponse, WardenError> {
        let body = self.build_body(request);
        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.anthropic_version)
            .json(&body)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { WardenError::Timeout(e.to_string()) } else { WardenError::BackendError(e.to_string()) })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WardenError::LlmError { status: status.as_u16(), body });
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| WardenError::FormatMismatch(format!("invalid JSON response: {e}")))?;

        let content = payload
            .get("content")
            .ok_or_else(|| WardenError::FormatMismatch("missing content field".into()))?;
        parse_content_blocks(content)
    }
}
