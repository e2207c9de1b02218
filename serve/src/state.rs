//! Shared process state (spec §4.E, §4.H): the [`AgentRuntime`] plus
//! whatever the HTTP layer itself owns (gateway auth, sandbox root).

use std::path::PathBuf;
use std::sync::Arc;

use warden::agentloop::AgentRuntime;

use crate::auth::GatewayAuth;

pub struct AppState {
    pub runtime: Arc<AgentRuntime>,
    pub gateway: Option<GatewayAuth>,
    pub sandbox_root: PathBuf,
}
