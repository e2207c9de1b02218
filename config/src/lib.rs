//! Env/`.env` loading and YAML agent-seed parsing (spec §6: "Config seed
//! format"). Split the way the teacher's own `config` crate splits concerns
//! (`dotenv.rs` for process env, `xdg_toml.rs` for a structured file) — here
//! the structured file is the YAML agent seed rather than an XDG TOML.

mod env;
mod seed;

pub use env::{load_env, EnvConfig};
pub use seed::{
    AgentSeed, BackendSeed, InterruptSeed, McpAuthSeed, McpServerSeed, SeedFile, SubagentSeed,
};

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read seed file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse seed file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Loads and parses a YAML seed file (spec §6: top-level `defaults`, `agents`,
/// `mcp_servers`). Missing file is the caller's concern — `warden-serve` treats
/// "no seed configured" as "start with an empty template registry".
pub fn load_seed_file(path: &Path) -> Result<SeedFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_seed_file_missing_path_is_a_read_error() {
        let err = load_seed_file(Path::new("/nonexistent/seed.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_seed_file_invalid_yaml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.yaml");
        std::fs::write(&path, "agents: [not: valid: yaml: -\n").unwrap();
        let err = load_seed_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_seed_file_parses_a_minimal_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.yaml");
        std::fs::write(
            &path,
            r#"
agents:
  - agent_id: default
    name: default
    model: gpt-test
    system_prompt: be helpful
    tools: [read_file]
"#,
        )
        .unwrap();
        let seed = load_seed_file(&path).unwrap();
        assert_eq!(seed.agents.len(), 1);
        assert_eq!(seed.agents[0].agent_id, "default");
        assert!(seed.mcp_servers.is_empty());
    }
}
