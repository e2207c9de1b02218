//! OpenAI-chat dialect backend (spec §4.C): OpenAI, LiteLLM, vLLM, and
//! Ollama-via-`/v1` all speak this wire shape. POSTs to
//! `{base_url}/chat/completions`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::error::WardenError;
use crate::message::{Dialect, Message, ToolCallRequest};

use super::{LlmClient, LlmRequest, LlmResponse, ToolChoiceMode};

pub struct OpenAiChatClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiChatClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self { http: Client::new(), base_url: base_url.into(), api_key }
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_body(&self, request: &LlmRequest) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(sys) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": sys}));
        }
        for m in &request.messages {
            messages.push(m.to_backend_format(Dialect::OpenAiChat));
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.schema.name,
                            "description": t.schema.description,
                            "parameters": t.schema.parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = match request.tool_choice {
                ToolChoiceMode::Auto => json!("auto"),
                ToolChoiceMode::None => json!("none"),
                ToolChoiceMode::Required => json!("required"),
            };
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

/// Parses `choices[0].message` into an [`LlmResponse`]. Malformed tool-call
/// argument JSON is stored as `{_raw: string}` rather than failing the whole
/// response (spec §4.C).
fn parse_message(message: &Value) -> Result<LlmResponse, WardenError> {
    let content = message.get("content").and_then(Value::as_str).unwrap_or("").to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let raw_args = func.get("arguments")?.as_str()?;
                    let args = serde_json::from_str(raw_args).unwrap_or_else(|_| json!({"_raw": raw_args}));
                    Some(ToolCallRequest { id, name, args })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(LlmResponse { content, tool_calls })
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn invoke_native(&self, request: &LlmRequest) -> Option<Result<LlmResponse, WardenError>> {
        Some(self.invoke_impl(request).await)
    }
}

impl OpenAiChatClient {
    async fn invoke_impl(&self, request: &LlmRequest) -> Result<LlmResponse, WardenError> {
        let body = self.build_body(request);
        let mut req = self.http.post(format!("{}/chat/completions", self.base_url)).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
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

        let message = payload
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| WardenError::FormatMismatch("missing choices[0].message".into()))?;

        parse_message(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolSpec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn invoke_parses_plain_text_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "OK"}}]
            })))
            .mount(&server)
            .await;

        let client = OpenAiChatClient::new(server.uri(), None);
        let req = LlmRequest::new("gpt-test", vec![Message::user("hi")]);
        let resp = client.invoke(&req).await.unwrap();
        assert_eq!(resp.content, "OK");
        assert!(resp.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn invoke_parses_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{
                        "id": "t1",
                        "type": "function",
                        "function": {"name": "add", "arguments": "{\"a\":2,\"b\":3}"}
                    }]
                }}]
            })))
            .mount(&server)
            .await;

        let client = OpenAiChatClient::new(server.uri(), None);
        let req = LlmRequest::new("gpt-test", vec![Message::user("add 2 and 3")]);
        let resp = client.invoke(&req).await.unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].args, json!({"a": 2, "b": 3}));
    }

    #[tokio::test]
    async fn invoke_stores_malformed_tool_call_json_as_raw() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{
                        "id": "t1",
                        "type": "function",
                        "function": {"name": "add", "arguments": "{not json"}
                    }]
                }}]
            })))
            .mount(&server)
            .await;

        let client = OpenAiChatClient::new(server.uri(), None);
        let req = LlmRequest::new("gpt-test", vec![Message::user("hi")]);
        let resp = client.invoke(&req).await.unwrap();
        assert_eq!(resp.tool_calls[0].args, json!({"_raw": "{not json"}));
    }

    #[tokio::test]
    async fn invoke_surfaces_non_2xx_as_llm_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
            .mount(&server)
            .await;

        let client = OpenAiChatClient::new(server.uri(), None);
        let req = LlmRequest::new("gpt-test", vec![Message::user("hi")]);
        let err = client.invoke(&req).await.unwrap_err();
        assert!(matches!(err, WardenError::LlmError { status: 500, .. }));
    }

    struct NoopTool;

    #[async_trait]
    impl crate::tools::ToolCallable for NoopTool {
        async fn call(&self, _ctx: &crate::tools::ToolCallContext, args: Value) -> Result<Value, WardenError> {
            Ok(args)
        }
    }

    #[test]
    fn build_body_includes_tools_and_tool_choice_when_present() {
        let client = OpenAiChatClient::new("http://x", None);
        let mut req = LlmRequest::new("gpt-test", vec![Message::user("hi")]);
        req.tools = vec![ToolSpec::new("add", "adds two numbers", json!({"type": "object"}), std::sync::Arc::new(NoopTool))];
        req.tool_choice = ToolChoiceMode::Required;
        let body = client.build_body(&req);
        assert_eq!(body["tool_choice"], json!("required"));
        assert_eq!(body["tools"][0]["function"]["name"], "add");
    }
}
