//! Converts a parsed `warden_config::SeedFile` into `warden::instance`
//! runtime types and registers it on a freshly built [`warden::agentloop::AgentRuntime`].
//! Lives in `serve` rather than `config` because `config` deliberately has no
//! dependency on `warden` (spec §6 "Config seed format").

use warden::instance::{AgentTemplate, BackendConfig, InterruptRule, SubAgentSpec};
use warden::tools::mcp::{McpAuth, McpBridge};
use warden::tools::ToolRegistry;
use warden_config::{AgentDefaults, AgentSeed, BackendSeed, McpServerSeed, SeedFile, SubagentSeed};

fn backend_from_seed(seed: Option<BackendSeed>, agent_id: &str, sandbox_root: &str) -> BackendConfig {
    match seed {
        None => BackendConfig::Local { root: sandbox_root.to_string() },
        Some(BackendSeed::Local { root }) => BackendConfig::Local { root: root.unwrap_or_else(|| sandbox_root.to_string()) },
        Some(BackendSeed::Docker { image, .. }) => BackendConfig::Docker {
            container_name: format!("warden-{agent_id}"),
            workdir: "/workspace".to_string(),
            docker_host: None,
            image,
        },
    }
}

fn subagent_from_seed(s: SubagentSeed) -> SubAgentSpec {
    SubAgentSpec { name: s.name, agent_id: s.agent_id, tool_subset: s.tool_subset }
}

/// Applies `defaults` to one seed entry, then converts it into a runtime
/// template. `agent_id`/`name`/`system_prompt` are never defaulted — they are
/// each agent's own identity (spec §6).
pub fn agent_template_from_seed(seed: AgentSeed, defaults: Option<&AgentDefaults>, sandbox_root: &str) -> AgentTemplate {
    let now = chrono::Utc::now();
    let model = seed.model.or_else(|| defaults.and_then(|d| d.model.clone())).unwrap_or_else(|| "gpt-4o-mini".to_string());
    let max_iterations = seed.max_iterations.or_else(|| defaults.and_then(|d| d.max_iterations)).unwrap_or(25);
    let context_window_tokens = seed.context_window_tokens.or_else(|| defaults.and_then(|d| d.context_window_tokens)).unwrap_or(8000);
    let backend = seed.backend.or_else(|| defaults.and_then(|d| d.backend.clone()));

    AgentTemplate {
        agent_id: seed.agent_id.clone(),
        name: seed.name,
        model,
        system_prompt: seed.system_prompt,
        tool_names: seed.tools,
        middleware_names: seed.middleware,
        subagents: seed.subagents.into_iter().map(subagent_from_seed).collect(),
        backend_cfg: backend_from_seed(backend, &seed.agent_id, sandbox_root),
        interrupt_on: seed.interrupt_on.into_iter().map(|(k, v)| (k, InterruptRule { enabled: v.enabled, allowed_decisions: v.allowed_decisions })).collect(),
        max_iterations,
        context_window_tokens: context_window_tokens as usize,
        debug: seed.debug,
        created_at: now,
        updated_at: now,
    }
}

/// Registers every agent in `seed` onto `runtime`, applying `seed.defaults`.
pub async fn register_seed_agents(runtime: &warden::agentloop::AgentRuntime, seed: &SeedFile, sandbox_root: &str) {
    for agent in seed.agents.clone() {
        let template = agent_template_from_seed(agent, seed.defaults.as_ref(), sandbox_root);
        runtime.register_template(template).await;
    }
}

/// Connects every `mcp_servers` entry to `registry`, logging and skipping any
/// server that fails to connect rather than failing startup (spec §4.D: a
/// misbehaving MCP server shouldn't prevent the rest of the process from serving).
pub async fn connect_mcp_servers(servers: &[McpServerSeed], registry: &ToolRegistry) -> McpBridge {
    let mut bridge = McpBridge::new();
    for server in servers {
        let auth = server.auth.clone().map(|a| McpAuth { token_url: a.token_url, client_id: a.client_id, client_secret: a.client_secret });
        match bridge.connect_server(server.name.clone(), server.url.clone(), auth, registry).await {
            Ok(count) => tracing::info!(server = %server.name, tools = count, "connected mcp server"),
            Err(e) => tracing::warn!(server = %server.name, error = %e, "failed to connect mcp server, skipping"),
        }
    }
    bridge
}
