//! Proxy backend (spec §4.C): forwards the entire request to a user-supplied
//! HTTP callback. Used when a model is defined in SDK code rather than
//! configured via strings — the callback owns request/response translation
//! entirely, so this client just ships `LlmRequest` as JSON and parses back
//! an `LlmResponse` shape.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::error::WardenError;
use crate::message::{Dialect, ToolCallRequest};

use super::{LlmClient, LlmRequest, LlmResponse};

pub struct ProxyClient {
    http: Client,
    callback_url: String,
}

impl ProxyClient {
    pub fn new(callback_url: impl Into<String>) -> Self {
        Self { http: Client::new(), callback_url: callback_url.into() }
    }

    fn call_url(&self, model_name: &str) -> String {
        format!("{}/llm/{}/call", self.callback_url.trim_end_matches('/'), model_name)
    }

    fn request_body(&self, request: &LlmRequest) -> Value {
        json!({
            "model": request.model,
            "messages": request.messages.iter().map(|m| m.to_backend_format(Dialect::OpenAiChat)).collect::<Vec<_>>(),
            "system_prompt": request.system_prompt,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        })
    }
}

fn parse_response(payload: &Value) -> Result<LlmResponse, WardenError> {
    let content = payload
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| WardenError::FormatMismatch("proxy response missing content".into()))?
        .to_string();
    let tool_calls = payload
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    Some(ToolCallRequest {
                        id: tc.get("id")?.as_str()?.to_string(),
                        name: tc.get("name")?.as_str()?.to_string(),
                        args: tc.get("args").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(LlmResponse { content, tool_calls })
}

#[async_trait]
impl LlmClient for ProxyClient {
    async fn invoke_native(&self, request: &LlmRequest) -> Option<Result<LlmResponse, WardenError>> {
        let url = self.call_url(&request.model);
        let body = self.request_body(request);
        let result = async {
            let resp = self
                .http
                .post(&url)
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
            parse_response(&payload)
        }
        .await;
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn invoke_posts_to_callback_url_with_model_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/llm/custom-model/call"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": "hi back"})))
            .mount(&server)
            .await;

        let client = ProxyClient::new(server.uri());
        let req = LlmRequest::new("custom-model", vec![Message::user("hi")]);
        let resp = client.invoke(&req).await.unwrap();
        assert_eq!(resp.content, "hi back");
    }
}
