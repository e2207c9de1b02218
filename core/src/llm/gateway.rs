//! Custom gateway backend (spec §4.C): same wire as OpenAI-chat or Anthropic
//! Messages, but with a pluggable bearer-token source and a retry on
//! transient gateway errors.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::WardenError;

use super::anthropic::AnthropicMessagesClient;
use super::openai_chat::OpenAiChatClient;
use super::{LlmClient, LlmRequest, LlmResponse};

/// Refresh this many seconds before actual expiry (grounded in
/// `token_manager.py`'s `_REFRESH_BUFFER_SECONDS = 60`).
const REFRESH_BUFFER_SECONDS: u64 = 60;
/// Default token lifetime assumed when a token response omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECONDS: u64 = 1800;

fn now_epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

struct CachedToken {
    access_token: Option<String>,
    expires_at: u64,
}

/// OAuth2 client_credentials token cache with double-checked-locking refresh
/// (spec §4.C, grounded in `token_manager.py::GatewayTokenManager`).
pub struct OAuthTokenManager {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    cached: Mutex<CachedToken>,
}

impl OAuthTokenManager {
    pub fn new(token_url: impl Into<String>, client_id: impl Into<String>, client_secret: impl Into<String>, scopes: Vec<String>) -> Self {
        Self {
            http: Client::new(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scopes,
            cached: Mutex::new(CachedToken { access_token: None, expires_at: 0 }),
        }
    }

    fn is_valid(token: &CachedToken) -> bool {
        token.access_token.is_some() && now_epoch_secs() < token.expires_at.saturating_sub(REFRESH_BUFFER_SECONDS)
    }

    /// Returns a valid token, refreshing at most once even under concurrent
    /// callers (double-checked locking: check outside the lock, re-check
    /// after acquiring it, only then hit the network).
    pub async fn get_token(&self) -> Result<String, WardenError> {
        {
            let guard = self.cached.lock().await;
            if Self::is_valid(&guard) {
                return Ok(guard.access_token.clone().unwrap());
            }
        }

        let mut guard = self.cached.lock().await;
        if Self::is_valid(&guard) {
            return Ok(guard.access_token.clone().unwrap());
        }

        info!(token_url = %self.token_url, "refreshing OAuth2 gateway token");
        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
        ];
        if !self.scopes.is_empty() {
            form.push(("scope", self.scopes.join(" ")));
        }

        let resp = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| WardenError::BackendError(format!("oauth token request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(WardenError::LlmError { status, body });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| WardenError::FormatMismatch(format!("invalid oauth token response: {e}")))?;
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| WardenError::FormatMismatch("oauth response missing access_token".into()))?
            .to_string();
        let expires_in = body.get("expires_in").and_then(Value::as_u64).unwrap_or(DEFAULT_EXPIRES_IN_SECONDS);

        guard.expires_at = now_epoch_secs() + expires_in;
        guard.access_token = Some(access_token.clone());
        Ok(access_token)
    }
}

/// Precedence order for resolving a bearer token on each request (spec §4.C):
/// a per-request override, then a static token, then the OAuth2 manager.
pub enum BearerSource {
    PerRequest(Box<dyn Fn() -> Option<String> + Send + Sync>),
    Static(String),
    OAuth(Arc<OAuthTokenManager>),
}

/// Wire dialect the gateway speaks underneath (same request/response shapes
/// as the two standalone backends, reused here rather than duplicated).
enum Wire {
    OpenAiChat(OpenAiChatClient),
    Anthropic(AnthropicMessagesClient),
}

pub struct CustomGatewayClient {
    wire: Wire,
    bearer: BearerSource,
    /// Retries once on HTTP 429/503 with a short backoff (spec §9 supplement,
    /// grounded in `gateway/chat_model.py`'s four revisions all doing this).
    pub retry_on_transient: bool,
}

impl CustomGatewayClient {
    pub fn openai_chat(base_url: impl Into<String>, bearer: BearerSource) -> Self {
        Self { wire: Wire::OpenAiChat(OpenAiChatClient::new(base_url, None)), bearer, retry_on_transient: true }
    }

    pub fn anthropic_messages(base_url: impl Into<String>, bearer: BearerSource) -> Self {
        Self {
            wire: Wire::Anthropic(AnthropicMessagesClient::new(base_url, String::new())),
            bearer,
            retry_on_transient: true,
        }
    }

    async fn resolve_bearer(&self) -> Result<Option<String>, WardenError> {
        match &self.bearer {
            BearerSource::PerRequest(f) => Ok(f()),
            BearerSource::Static(token) => Ok(Some(token.clone())),
            BearerSource::OAuth(manager) => manager.get_token().await.map(Some),
        }
    }

    async fn call_once(&self, request: &LlmRequest, bearer: Option<&str>) -> Result<LlmResponse, WardenError> {
        match &self.wire {
            Wire::OpenAiChat(client) => {
                let client = OpenAiChatClient::new(client.base_url(), bearer.map(str::to_string));
                client.invoke(request).await
            }
            Wire::Anthropic(client) => {
                let client = AnthropicMessagesClient::new(client.base_url(), bearer.unwrap_or_default());
                client.invoke(request).await
            }
        }
    }

    fn is_transient(err: &WardenError) -> bool {
        matches!(err, WardenError::LlmError { status: 429, .. } | WardenError::LlmError { status: 503, .. })
    }
}

#[async_trait]
impl LlmClient for CustomGatewayClient {
    async fn invoke_native(&self, request: &LlmRequest) -> Option<Result<LlmResponse, WardenError>> {
        let bearer = match self.resolve_bearer().await {
            Ok(b) => b,
            Err(e) => return Some(Err(e)),
        };
        let first = self.call_once(request, bearer.as_deref()).await;
        match first {
            Err(ref e) if self.retry_on_transient && Self::is_transient(e) => {
                tokio::time::sleep(Duration::from_millis(250)).await;
                Some(self.call_once(request, bearer.as_deref()).await)
            }
            other => Some(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn oauth_manager_caches_token_within_validity_window() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "abc", "expires_in": 1800})))
            .expect(1)
            .mount(&server)
            .await;

        let manager = OAuthTokenManager::new(format!("{}/token", server.uri()), "id", "secret", vec![]);
        let t1 = manager.get_token().await.unwrap();
        let t2 = manager.get_token().await.unwrap();
        assert_eq!(t1, "abc");
        assert_eq!(t2, "abc");
    }

    #[tokio::test]
    async fn oauth_manager_refreshes_once_for_concurrent_callers_after_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "fresh", "expires_in": 1800})))
            .mount(&server)
            .await;

        let manager = Arc::new(OAuthTokenManager::new(format!("{}/token", server.uri()), "id", "secret", vec![]));
        let (a, b) = tokio::join!(manager.get_token(), manager.get_token());
        assert_eq!(a.unwrap(), "fresh");
        assert_eq!(b.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn gateway_retries_once_on_transient_503() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "recovered"}}]
            })))
            .mount(&server)
            .await;

        let client = CustomGatewayClient::openai_chat(server.uri(), BearerSource::Static("tok".into()));
        let req = LlmRequest::new("gpt-test", vec![Message::user("hi")]);
        let resp = client.invoke(&req).await.unwrap();
        assert_eq!(resp.content, "recovered");
    }
}
