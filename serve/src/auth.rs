//! Gateway auth (spec §6 "Auth"): when a gateway URL is configured, every
//! request must carry a bearer token validated against `/auth/me`, and tool
//! ACLs are fetched from `/api/tools`. Grounded on
//! `warden::llm::gateway::OAuthTokenManager`'s reqwest-client-plus-cache shape.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::StatusCode;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::state::AppState;

/// `None` when no `WARDEN_GATEWAY_URL` is configured — every request is then
/// treated as already authenticated, scoped to the `anonymous` user.
pub struct GatewayAuth {
    http: Client,
    base_url: String,
    /// Cached per-token ACL, refreshed on each request's first lookup; small
    /// enough processes that a full re-fetch per request would be wasteful
    /// under load, so this mirrors the OAuth manager's cache-then-fetch shape.
    acl_cache: RwLock<Option<(String, HashSet<String>)>>,
}

#[derive(Deserialize)]
struct AuthMeResponse {
    username: String,
}

#[derive(Deserialize)]
struct ToolsAclResponse {
    #[serde(default)]
    tools: Vec<String>,
}

impl GatewayAuth {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            acl_cache: RwLock::new(None),
        }
    }

    async fn validate(&self, token: &str) -> Result<String, StatusCode> {
        let resp = self
            .http
            .get(format!("{}/auth/me", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|_| StatusCode::UNAUTHORIZED)?;
        if !resp.status().is_success() {
            return Err(StatusCode::UNAUTHORIZED);
        }
        let body: AuthMeResponse = resp.json().await.map_err(|_| StatusCode::UNAUTHORIZED)?;
        Ok(body.username)
    }

    /// Fetches and caches the bearer's tool ACL. `None` means "no ACL
    /// configured for this gateway", i.e. allow every tool.
    pub async fn tool_acl(&self, token: &str) -> Option<HashSet<String>> {
        if let Some((cached_token, acl)) = self.acl_cache.read().await.as_ref() {
            if cached_token == token {
                return Some(acl.clone());
            }
        }
        let resp = self.http.get(format!("{}/api/tools", self.base_url)).bearer_auth(token).send().await.ok()?;
        let body: ToolsAclResponse = resp.json().await.ok()?;
        let acl: HashSet<String> = body.tools.into_iter().collect();
        *self.acl_cache.write().await = Some((token.to_string(), acl.clone()));
        Some(acl)
    }
}

/// `mcp_<server>_<tool>` names check the bare tool name against an ACL;
/// non-MCP tools are always allowed (spec §6).
pub fn tool_allowed(acl: Option<&HashSet<String>>, tool_name: &str) -> bool {
    let Some(acl) = acl else { return true };
    match tool_name.strip_prefix("mcp_").and_then(|rest| rest.split_once('_')) {
        Some((_server, bare)) => acl.contains(bare),
        None => true,
    }
}

/// The authenticated caller: a username plus an optional tool ACL (spec §6).
pub struct Caller {
    pub username: String,
    pub tool_acl: Option<HashSet<String>>,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_from_header(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    Arc<AppState>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = StatusCode;

    /// Headers can't be set on SSE/WebSocket clients in the browser, so a
    /// `?token=` query param is accepted as a fallback (spec §6).
    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = Arc::<AppState>::from_ref(state);

        let Some(gateway) = &app_state.gateway else {
            return Ok(Caller { username: "anonymous".to_string(), tool_acl: None });
        };

        let token = bearer_from_header(parts).or_else(|| {
            Query::<TokenQuery>::try_from_uri(&parts.uri).ok().and_then(|q| q.0.token)
        });
        let token = token.ok_or(StatusCode::UNAUTHORIZED)?;

        let username = gateway.validate(&token).await?;
        let tool_acl = gateway.tool_acl(&token).await;
        Ok(Caller { username, tool_acl })
    }
}
