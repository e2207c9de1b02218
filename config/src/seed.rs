//! YAML seed shapes (spec §6: "Config seed format"). Each type mirrors the
//! `core` crate's runtime types field-for-field so `warden-serve` can convert
//! a parsed `SeedFile` into `AgentTemplate`s and MCP bridge calls without
//! this crate depending on `warden` itself.

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SeedFile {
    pub defaults: Option<AgentDefaults>,
    pub agents: Vec<AgentSeed>,
    pub mcp_servers: Vec<McpServerSeed>,
}

/// Values merged into an `AgentSeed` that omits them, so a seed file's
/// `agents:` entries don't have to repeat shared settings.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AgentDefaults {
    pub model: Option<String>,
    pub max_iterations: Option<u32>,
    pub context_window_tokens: Option<u32>,
    pub backend: Option<BackendSeed>,
}

/// Mirrors `core::instance::AgentTemplate`.
#[derive(Debug, Deserialize, Clone)]
pub struct AgentSeed {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub middleware: Vec<String>,
    #[serde(default)]
    pub subagents: Vec<SubagentSeed>,
    #[serde(default)]
    pub backend: Option<BackendSeed>,
    #[serde(default)]
    pub interrupt_on: HashMap<String, InterruptSeed>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub context_window_tokens: Option<u32>,
    #[serde(default)]
    pub debug: bool,
}

/// Mirrors `core::instance::SubAgentSpec`.
#[derive(Debug, Deserialize, Clone)]
pub struct SubagentSeed {
    pub name: String,
    pub agent_id: String,
    #[serde(default)]
    pub tool_subset: Option<Vec<String>>,
}

/// Mirrors `core::instance::BackendConfig`.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSeed {
    Local {
        #[serde(default)]
        root: Option<String>,
    },
    Docker {
        image: String,
        #[serde(default)]
        mounts: Vec<String>,
    },
}

/// Mirrors `core::instance::InterruptRule`.
#[derive(Debug, Deserialize, Clone)]
pub struct InterruptSeed {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_decisions: Vec<String>,
}

/// Mirrors `core::tools::mcp::McpAuth`.
#[derive(Debug, Deserialize, Clone)]
pub struct McpAuthSeed {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct McpServerSeed {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub auth: Option<McpAuthSeed>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_seed_tags_on_kind() {
        let local: BackendSeed = serde_yaml::from_str("kind: local\nroot: /tmp/x\n").unwrap();
        assert!(matches!(local, BackendSeed::Local { root: Some(r) } if r == "/tmp/x"));

        let docker: BackendSeed =
            serde_yaml::from_str("kind: docker\nimage: alpine:3\nmounts: []\n").unwrap();
        assert!(matches!(docker, BackendSeed::Docker { image, .. } if image == "alpine:3"));
    }

    #[test]
    fn agent_seed_defaults_optional_fields() {
        let seed: AgentSeed = serde_yaml::from_str(
            "agent_id: a1\nname: A1\nsystem_prompt: hi\ntools: [read_file]\n",
        )
        .unwrap();
        assert!(seed.subagents.is_empty());
        assert!(seed.interrupt_on.is_empty());
        assert!(!seed.debug);
    }
}
