//! Tool registry & MCP bridge (spec §4.D).
//!
//! `ToolSpec` pairs a JSON Schema (what the LLM sees) with an opaque callable
//! (what actually runs). The registry is a process-wide `DashMap`, the
//! teacher's concurrency idiom for shared lookup tables (`dashmap` crate).

pub mod mcp;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WardenError;
use crate::sandbox::SandboxBackend;

/// Everything a callable needs to act on behalf of one invocation: the caller's
/// sandbox backend and thread, so local tools (read/write/grep/glob) can be
/// implemented once against this context rather than against a concrete backend.
pub struct ToolCallContext {
    pub username: String,
    pub thread_id: String,
    pub backend: Arc<dyn SandboxBackend>,
}

/// An opaque callable a [`ToolSpec`] wraps: a local function or an MCP bridge
/// wrapper (spec §3: "opaque callable (local function or MCP bridge wrapper)").
#[async_trait]
pub trait ToolCallable: Send + Sync {
    async fn call(&self, ctx: &ToolCallContext, args: Value) -> Result<Value, WardenError>;
}

impl fmt::Debug for dyn ToolCallable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<tool callable>")
    }
}

/// `{name, description, parameters}` plus the opaque callable (spec §3). Unique
/// by name across the process registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone)]
pub struct ToolSpec {
    pub schema: ToolSchema,
    pub callable: Arc<dyn ToolCallable>,
}

impl fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSpec").field("schema", &self.schema).finish()
    }
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value, callable: Arc<dyn ToolCallable>) -> Self {
        Self {
            schema: ToolSchema { name: name.into(), description: description.into(), parameters },
            callable,
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }
}

/// Process-wide registry of tools by name. Local tools and MCP-bridged tools
/// are registered through the same map; callers resolve names to callables
/// once per instance (see [`crate::instance`]).
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any prior registration with the same name.
    pub fn register(&self, spec: ToolSpec) {
        self.tools.insert(spec.name().to_string(), spec);
    }

    pub fn unregister(&self, name: &str) -> Option<ToolSpec> {
        self.tools.remove(name).map(|(_, v)| v)
    }

    pub fn get(&self, name: &str) -> Option<ToolSpec> {
        self.tools.get(name).map(|entry| entry.value().clone())
    }

    pub fn resolve_many(&self, names: &[String]) -> Result<Vec<ToolSpec>, WardenError> {
        names
            .iter()
            .map(|n| self.get(n).ok_or_else(|| WardenError::NotFound(format!("tool: {n}"))))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl ToolCallable for EchoTool {
        async fn call(&self, _ctx: &ToolCallContext, args: Value) -> Result<Value, WardenError> {
            Ok(args)
        }
    }

    fn echo_spec(name: &str) -> ToolSpec {
        ToolSpec::new(name, "echoes its args", serde_json::json!({"type": "object"}), Arc::new(EchoTool))
    }

    #[test]
    fn register_then_get_round_trips_by_name() {
        let registry = ToolRegistry::new();
        registry.register(echo_spec("echo"));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn registering_same_name_twice_replaces_the_entry() {
        let registry = ToolRegistry::new();
        registry.register(echo_spec("echo"));
        registry.register(ToolSpec::new("echo", "v2", serde_json::json!({}), Arc::new(EchoTool)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("echo").unwrap().schema.description, "v2");
    }

    #[test]
    fn resolve_many_fails_fast_on_unknown_name() {
        let registry = ToolRegistry::new();
        registry.register(echo_spec("echo"));
        let err = registry.resolve_many(&["echo".to_string(), "ghost".to_string()]).unwrap_err();
        assert!(matches!(err, WardenError::NotFound(_)));
    }
}
