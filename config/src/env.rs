//! Process environment reads, `.env` loaded via the `dotenv` crate (the same
//! ambient dependency `core` already carries, rather than the teacher's own
//! hand-rolled `.env` parser).

use std::path::PathBuf;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Typed process configuration (spec §6 HTTP surface + §5 timeouts), read
/// once at startup after `.env` has been applied.
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// `WARDEN_BIND_ADDR`, default `127.0.0.1:8080`.
    pub bind_addr: String,
    /// `WARDEN_SANDBOX_ROOT`, the root local sandboxes are scoped under.
    pub sandbox_root: PathBuf,
    /// `WARDEN_AGENTS_SEED`, optional path to a YAML seed file.
    pub agents_seed: Option<PathBuf>,
    /// `WARDEN_GATEWAY_URL`, optional auth gateway base URL (spec §6 "Auth").
    pub gateway_url: Option<String>,
    /// `WARDEN_EVENT_QUEUE_DEPTH`, default 32 (spec §4.H).
    pub event_queue_depth: usize,
    /// `WARDEN_DEFAULT_MAX_ITERATIONS`, default 25.
    pub default_max_iterations: u32,
}

/// Loads `.env` (if present) then reads the typed fields above from the
/// process environment, falling back to spec-documented defaults.
pub fn load_env() -> EnvConfig {
    if let Err(e) = dotenv::dotenv() {
        tracing::debug!("no .env file loaded: {e}");
    }

    EnvConfig {
        bind_addr: env_or("WARDEN_BIND_ADDR", "127.0.0.1:8080"),
        sandbox_root: PathBuf::from(env_or("WARDEN_SANDBOX_ROOT", "/tmp/warden-sandboxes")),
        agents_seed: std::env::var("WARDEN_AGENTS_SEED").ok().map(PathBuf::from),
        gateway_url: std::env::var("WARDEN_GATEWAY_URL").ok(),
        event_queue_depth: env_parsed("WARDEN_EVENT_QUEUE_DEPTH", 32),
        default_max_iterations: env_parsed("WARDEN_DEFAULT_MAX_ITERATIONS", 25),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_unset() {
        std::env::remove_var("WARDEN_BIND_ADDR");
        std::env::remove_var("WARDEN_EVENT_QUEUE_DEPTH");
        let cfg = load_env();
        assert_eq!(cfg.bind_addr, "127.0.0.1:8080");
        assert_eq!(cfg.event_queue_depth, 32);
    }

    #[test]
    fn explicit_env_overrides_default() {
        std::env::set_var("WARDEN_DEFAULT_MAX_ITERATIONS", "7");
        let cfg = load_env();
        assert_eq!(cfg.default_max_iterations, 7);
        std::env::remove_var("WARDEN_DEFAULT_MAX_ITERATIONS");
    }
}
