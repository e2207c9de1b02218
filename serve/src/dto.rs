//! Wire shapes for the `/agents` HTTP surface (spec §6). Conversions to/from
//! `warden::instance` types live alongside the shapes they convert.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use warden::instance::{AgentTemplate, BackendConfig, InterruptRule, SubAgentSpec};
use warden::message::{Message, ToolCallRequest};
use warden::sandbox::docker::ContainerStatus;

#[derive(Debug, Deserialize)]
pub struct SubagentDto {
    pub name: String,
    pub agent_id: String,
    #[serde(default)]
    pub tool_subset: Option<Vec<String>>,
}

impl From<SubagentDto> for SubAgentSpec {
    fn from(d: SubagentDto) -> Self {
        SubAgentSpec { name: d.name, agent_id: d.agent_id, tool_subset: d.tool_subset }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendDto {
    Local {
        #[serde(default)]
        root: Option<String>,
    },
    Docker {
        image: String,
        #[serde(default)]
        docker_host: Option<String>,
    },
}

impl BackendDto {
    pub fn into_backend_config(self, agent_id: &str, username: &str) -> BackendConfig {
        match self {
            BackendDto::Local { root } => BackendConfig::Local { root: root.unwrap_or_else(|| "/tmp/warden-sandboxes".to_string()) },
            BackendDto::Docker { image, docker_host } => BackendConfig::Docker {
                container_name: format!("warden-{agent_id}-{username}"),
                workdir: "/workspace".to_string(),
                docker_host,
                image,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InterruptDto {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_decisions: Vec<String>,
}

impl From<InterruptDto> for InterruptRule {
    fn from(d: InterruptDto) -> Self {
        InterruptRule { enabled: d.enabled, allowed_decisions: d.allowed_decisions }
    }
}

/// `AgentCreateRequest` (spec §6, mirrored by the YAML seed's `AgentSeed`).
#[derive(Debug, Deserialize)]
pub struct AgentCreateRequest {
    pub agent_id: String,
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub middleware: Vec<String>,
    #[serde(default)]
    pub subagents: Vec<SubagentDto>,
    #[serde(default)]
    pub backend: Option<BackendDto>,
    #[serde(default)]
    pub interrupt_on: HashMap<String, InterruptDto>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub context_window_tokens: Option<u32>,
    #[serde(default)]
    pub debug: bool,
}

impl AgentCreateRequest {
    pub fn into_template(self, default_max_iterations: u32, sandbox_root: &str) -> AgentTemplate {
        let now = chrono::Utc::now();
        let backend_cfg = self
            .backend
            .map(|b| b.into_backend_config(&self.agent_id, "template"))
            .unwrap_or_else(|| BackendConfig::Local { root: sandbox_root.to_string() });
        AgentTemplate {
            agent_id: self.agent_id,
            name: self.name,
            model: self.model,
            system_prompt: self.system_prompt,
            tool_names: self.tools,
            middleware_names: self.middleware,
            subagents: self.subagents.into_iter().map(Into::into).collect(),
            backend_cfg,
            interrupt_on: self.interrupt_on.into_iter().map(|(k, v)| (k, v.into())).collect(),
            max_iterations: self.max_iterations.unwrap_or(default_max_iterations),
            context_window_tokens: self.context_window_tokens.unwrap_or(8000) as usize,
            debug: self.debug,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Response for `POST /agents/`, `GET /agents/`, `GET /agents/{id}` (spec §6).
#[derive(Debug, Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub name: String,
    pub model: String,
    pub tools: Vec<String>,
    pub backend_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_status: Option<ContainerStatus>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl TryFrom<WireMessage> for Message {
    type Error = warden::WardenError;

    fn try_from(m: WireMessage) -> Result<Self, Self::Error> {
        Ok(match m.role.as_str() {
            "system" => Message::system(m.content),
            "user" => Message::user(m.content),
            "assistant" => Message::assistant(m.content, m.tool_calls),
            "tool" => Message::tool(
                m.tool_call_id.ok_or_else(|| warden::WardenError::BadRequest("tool message missing tool_call_id".into()))?,
                m.name.unwrap_or_default(),
                m.content,
            ),
            other => return Err(warden::WardenError::BadRequest(format!("unknown message role: {other}"))),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub trace: bool,
    /// Only used by the id-less `/agents/invoke` route.
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvokeResponse {
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub interrupted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_decisions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<warden_stream::TraceEvent>>,
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub thread_id: String,
    pub decision: String,
    #[serde(default)]
    pub edit_args: Option<serde_json::Value>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ToolsPatchRequest {
    pub tools: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ToolsPatchResponse {
    pub agent_id: String,
    pub tools: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BackendPatchRequest {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub sandbox_url: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BackendPatchResponse {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_url: Option<String>,
    pub backend_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_status: Option<ContainerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub agents_loaded: usize,
}

#[derive(Debug, Serialize)]
pub struct ToolsAvailableResponse {
    pub tools: Vec<String>,
}
