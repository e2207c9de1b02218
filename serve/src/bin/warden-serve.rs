//! Process entry point: loads env + an optional YAML agent seed, builds an
//! [`AgentRuntime`], and serves the spec §6 HTTP surface.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use warden::agentloop::AgentRuntime;
use warden::instance::{InstanceRegistry, TemplateRegistry};
use warden::tools::ToolRegistry;
use warden::trace::EventBus;
use warden_serve::seed_loader::{connect_mcp_servers, register_seed_agents};
use warden_serve::{AppState, GatewayAuth, WardenBackendFactory};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let env = warden_config::load_env();

    let events = Arc::new(EventBus::new());
    let tool_registry = Arc::new(ToolRegistry::new());
    let backend_factory = Arc::new(WardenBackendFactory::new(events.clone()));
    let runtime = AgentRuntime::new(
        Arc::new(TemplateRegistry::new()),
        Arc::new(InstanceRegistry::new()),
        tool_registry.clone(),
        backend_factory,
        events,
        warden_serve::default_resolver(),
    );

    if let Some(seed_path) = &env.agents_seed {
        match warden_config::load_seed_file(seed_path) {
            Ok(seed) => {
                // Held for the process lifetime so its MCP sessions stay connected.
                let _mcp_bridge = connect_mcp_servers(&seed.mcp_servers, &tool_registry).await;
                register_seed_agents(&runtime, &seed, &env.sandbox_root.display().to_string()).await;
                tracing::info!(agents = runtime.templates.list().await.len(), "registered seeded agents");
            }
            Err(e) => tracing::error!(error = %e, path = %seed_path.display(), "failed to load agent seed, starting with no agents"),
        }
    } else {
        tracing::info!("no WARDEN_AGENTS_SEED configured, starting with no agents");
    }

    let gateway = env.gateway_url.as_deref().map(GatewayAuth::new);
    if gateway.is_none() {
        tracing::warn!("no WARDEN_GATEWAY_URL configured, every caller is treated as 'anonymous'");
    }

    let state = Arc::new(AppState { runtime, gateway, sandbox_root: env.sandbox_root.clone() });

    warden_serve::run_serve(Some(env.bind_addr.as_str()), state).await
}
