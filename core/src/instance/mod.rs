//! Agent template & instance registry (spec §4.E).
//!
//! Fine-grained locking, not one lock around the whole map: the registry's
//! own `RwLock` only ever guards the `(agent_id, username) -> Arc<AgentInstance>`
//! lookup itself (spec §5: "Template and instance maps: guarded by a per-map
//! reader/writer lock; reads dominate"). Each instance's mutable fields get
//! their own lock, and each thread its own (spec §5: "Per-instance thread map:
//! guarded by a per-instance lock held for the duration of the agent loop"),
//! so one user's long-running invocation never blocks lookups for another.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::error::WardenError;
use crate::message::Message;
use crate::sandbox::SandboxBackend;
use crate::tools::{ToolRegistry, ToolSpec};

/// `{tool_name, rule}` — when a named tool call should pause for human review
/// rather than execute immediately (spec §4.G interrupt handling).
#[derive(Clone, Debug)]
pub struct InterruptRule {
    pub enabled: bool,
    pub allowed_decisions: Vec<String>,
}

/// `{agent_id, ...}` a template can delegate a nested invocation to (spec §4.G
/// "nested subagent tool invocation on a fresh thread with a filtered tool subset").
#[derive(Clone, Debug)]
pub struct SubAgentSpec {
    pub name: String,
    pub agent_id: String,
    pub tool_subset: Option<Vec<String>>,
}

/// `{tool_call_id, name, args, allowed_decisions}` (spec §3): recorded on a
/// thread when the loop paused mid-iteration for human review.
#[derive(Clone, Debug)]
pub struct PendingInterrupt {
    pub tool_call_id: String,
    pub name: String,
    pub args: serde_json::Value,
    pub allowed_decisions: Vec<String>,
}

/// Resolved sandbox backend configuration carried on a template, cloned fresh
/// per instance (spec §4.E: "constructs a fresh backend so sandboxes are
/// per-user-isolated").
#[derive(Clone, Debug)]
pub enum BackendConfig {
    Local { root: String },
    Docker { container_name: String, workdir: String, docker_host: Option<String>, image: String },
}

/// Immutable-by-convention agent definition (spec §3). Stored behind a
/// per-instance `RwLock` rather than truly immutable because `update_tools`/
/// `update_backend` mutate a running instance's copy in place; the
/// process-wide [`TemplateRegistry`] entry a new instance clones from is
/// never mutated after registration (spec §8: "template immutability").
#[derive(Clone)]
pub struct AgentTemplate {
    pub agent_id: String,
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    pub tool_names: Vec<String>,
    pub middleware_names: Vec<String>,
    pub subagents: Vec<SubAgentSpec>,
    pub backend_cfg: BackendConfig,
    pub interrupt_on: HashMap<String, InterruptRule>,
    pub max_iterations: u32,
    pub context_window_tokens: usize,
    pub debug: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One thread's conversation state, guarded independently so concurrent
/// invocations on different `thread_id`s of the same instance never contend.
#[derive(Default)]
pub struct ThreadState {
    pub messages: Vec<Message>,
    pub pending_interrupt: Option<PendingInterrupt>,
}

/// Per-user clone of a template (spec §3). Ownership: exclusive to
/// `(agent_id, username)`.
pub struct AgentInstance {
    pub agent_id: String,
    pub username: String,
    template: RwLock<AgentTemplate>,
    backend: RwLock<Arc<dyn SandboxBackend>>,
    tool_callables: RwLock<Vec<ToolSpec>>,
    threads: DashMap<String, Arc<Mutex<ThreadState>>>,
    pub created_at: DateTime<Utc>,
    updated_at: RwLock<DateTime<Utc>>,
}

impl AgentInstance {
    pub async fn template(&self) -> AgentTemplate {
        self.template.read().await.clone()
    }

    pub async fn backend(&self) -> Arc<dyn SandboxBackend> {
        self.backend.read().await.clone()
    }

    pub async fn tool_callables(&self) -> Vec<ToolSpec> {
        self.tool_callables.read().await.clone()
    }

    pub async fn updated_at(&self) -> DateTime<Utc> {
        *self.updated_at.read().await
    }

    /// Returns this thread's lock, creating an empty one on first access.
    /// `DashMap::entry` makes the get-or-insert atomic across concurrent callers.
    pub fn thread_handle(&self, thread_id: &str) -> Arc<Mutex<ThreadState>> {
        self.threads.entry(thread_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(ThreadState::default()))).clone()
    }

    pub fn has_thread(&self, thread_id: &str) -> bool {
        self.threads.contains_key(thread_id)
    }
}

/// `agent_id → AgentTemplate`, validated and stored at startup or via the
/// create/delete API (spec §4.E).
#[derive(Default)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, AgentTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates tool names against `registry`, storing the template either
    /// way — an unregistered tool name logs a warning rather than failing
    /// startup (spec §4.E: "so partial MCP availability doesn't break startup").
    pub async fn register_template(&self, template: AgentTemplate, registry: &ToolRegistry) {
        for name in &template.tool_names {
            if registry.get(name).is_none() {
                warn!(agent_id = %template.agent_id, tool = %name, "template references unregistered tool");
            }
        }
        self.templates.write().await.insert(template.agent_id.clone(), template);
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentTemplate> {
        self.templates.read().await.get(agent_id).cloned()
    }

    pub async fn remove(&self, agent_id: &str) -> Option<AgentTemplate> {
        self.templates.write().await.remove(agent_id)
    }

    pub async fn list(&self) -> Vec<AgentTemplate> {
        self.templates.read().await.values().cloned().collect()
    }
}

type InstanceKey = (String, String);

fn key(agent_id: &str, username: &str) -> InstanceKey {
    (agent_id.to_string(), username.to_string())
}

/// Constructs a fresh backend for `(agent_id, username)` from its template's
/// configuration. Swappable so `InstanceRegistry` doesn't need to know about
/// concrete backend wiring (event bus, sandbox root) beyond what's passed in.
#[async_trait::async_trait]
pub trait BackendFactory: Send + Sync {
    async fn build(&self, cfg: &BackendConfig, username: &str) -> Result<Arc<dyn SandboxBackend>, WardenError>;
}

/// `(agent_id, username) → AgentInstance` (spec §4.E).
#[derive(Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceKey, Arc<AgentInstance>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, agent_id: &str, username: &str) -> Option<Arc<AgentInstance>> {
        self.instances.read().await.get(&key(agent_id, username)).cloned()
    }

    /// Returns the existing instance or deep-clones one from the template:
    /// resolves tool names to callables, constructs a fresh backend, and
    /// starts with no threads. Double-checked under the write lock so two
    /// concurrent first-accesses don't both build a backend.
    pub async fn get_or_clone(
        &self,
        agent_id: &str,
        username: &str,
        templates: &TemplateRegistry,
        tool_registry: &ToolRegistry,
        backend_factory: &dyn BackendFactory,
    ) -> Result<Arc<AgentInstance>, WardenError> {
        let k = key(agent_id, username);
        if let Some(existing) = self.instances.read().await.get(&k) {
            return Ok(existing.clone());
        }

        let template = templates
            .get(agent_id)
            .await
            .ok_or_else(|| WardenError::NotFound(format!("agent template: {agent_id}")))?;
        let tool_callables = tool_registry.resolve_many(&template.tool_names)?;
        let backend = backend_factory.build(&template.backend_cfg, username).await?;
        let now = Utc::now();

        let instance = Arc::new(AgentInstance {
            agent_id: agent_id.to_string(),
            username: username.to_string(),
            template: RwLock::new(template),
            backend: RwLock::new(backend),
            tool_callables: RwLock::new(tool_callables),
            threads: DashMap::new(),
            created_at: now,
            updated_at: RwLock::new(now),
        });

        let mut guard = self.instances.write().await;
        Ok(guard.entry(k).or_insert(instance).clone())
    }

    /// Rebuilds the instance's tool callable list in place; existing threads
    /// are untouched (spec §4.E).
    pub async fn update_tools(&self, agent_id: &str, username: &str, new_names: Vec<String>, tool_registry: &ToolRegistry) -> Result<(), WardenError> {
        let instance = self
            .get(agent_id, username)
            .await
            .ok_or_else(|| WardenError::NotFound(format!("instance: {agent_id}/{username}")))?;
        let resolved = tool_registry.resolve_many(&new_names)?;
        *instance.tool_callables.write().await = resolved;
        instance.template.write().await.tool_names = new_names;
        *instance.updated_at.write().await = Utc::now();
        Ok(())
    }

    /// Tears down the old backend (cancelling any in-flight container launch)
    /// and constructs the new one. A variant change is logged as a warning —
    /// any files living in the old sandbox do not transfer — but the thread
    /// map itself is never touched here (spec §4.E).
    pub async fn update_backend(
        &self,
        agent_id: &str,
        username: &str,
        new_cfg: BackendConfig,
        backend_factory: &dyn BackendFactory,
    ) -> Result<(), WardenError> {
        let instance = self
            .get(agent_id, username)
            .await
            .ok_or_else(|| WardenError::NotFound(format!("instance: {agent_id}/{username}")))?;

        {
            let backend = instance.backend.read().await;
            if let Some(docker) = backend.as_docker() {
                docker.cancel_launch().await;
            }
        }

        let same_variant = {
            let template = instance.template.read().await;
            std::mem::discriminant(&template.backend_cfg) == std::mem::discriminant(&new_cfg)
        };
        if !same_variant {
            warn!(agent_id, username, "backend variant changed; sandbox file contents do not transfer");
        }

        let new_backend = backend_factory.build(&new_cfg, username).await?;
        *instance.backend.write().await = new_backend;
        instance.template.write().await.backend_cfg = new_cfg;
        *instance.updated_at.write().await = Utc::now();
        Ok(())
    }

    /// Removes only the user's instance; the template persists (spec §4.E).
    pub async fn delete_instance(&self, agent_id: &str, username: &str) -> Option<()> {
        self.instances.write().await.remove(&key(agent_id, username)).map(|_| ())
    }

    pub async fn contains(&self, agent_id: &str, username: &str) -> bool {
        self.instances.read().await.contains_key(&key(agent_id, username))
    }

    /// All instances owned by `username`, for the `GET /agents/` listing.
    pub async fn list_for_user(&self, username: &str) -> Vec<Arc<AgentInstance>> {
        self.instances
            .read()
            .await
            .iter()
            .filter(|((_, u), _)| u == username)
            .map(|(_, instance)| instance.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::LocalBackend;
    use crate::tools::{ToolCallContext, ToolCallable};
    use async_trait::async_trait;
    use serde_json::Value;

    struct EchoTool;

    #[async_trait]
    impl ToolCallable for EchoTool {
        async fn call(&self, _ctx: &ToolCallContext, args: Value) -> Result<Value, WardenError> {
            Ok(args)
        }
    }

    struct LocalFactory {
        root: std::path::PathBuf,
    }

    #[async_trait]
    impl BackendFactory for LocalFactory {
        async fn build(&self, _cfg: &BackendConfig, username: &str) -> Result<Arc<dyn SandboxBackend>, WardenError> {
            Ok(Arc::new(LocalBackend::new(&self.root, username).await?))
        }
    }

    fn sample_template() -> AgentTemplate {
        let now = Utc::now();
        AgentTemplate {
            agent_id: "default".into(),
            name: "default".into(),
            model: "gpt-test".into(),
            system_prompt: "be helpful".into(),
            tool_names: vec!["echo".into()],
            middleware_names: vec![],
            subagents: vec![],
            backend_cfg: BackendConfig::Local { root: "/tmp/warden".into() },
            interrupt_on: HashMap::new(),
            max_iterations: 10,
            context_window_tokens: 8000,
            debug: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn get_or_clone_creates_isolated_instances_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let tool_registry = ToolRegistry::new();
        tool_registry.register(ToolSpec::new("echo", "echoes", serde_json::json!({}), Arc::new(EchoTool)));
        let templates = TemplateRegistry::new();
        templates.register_template(sample_template(), &tool_registry).await;
        let instances = InstanceRegistry::new();
        let factory = LocalFactory { root: dir.path().to_path_buf() };

        let alice = instances.get_or_clone("default", "alice", &templates, &tool_registry, &factory).await.unwrap();
        let bob = instances.get_or_clone("default", "bob", &templates, &tool_registry, &factory).await.unwrap();

        assert!(instances.contains("default", "alice").await);
        assert!(instances.contains("default", "bob").await);
        assert_eq!(alice.username, "alice");
        assert_eq!(bob.username, "bob");
    }

    #[tokio::test]
    async fn get_or_clone_returns_the_same_instance_on_second_call() {
        let dir = tempfile::tempdir().unwrap();
        let tool_registry = ToolRegistry::new();
        tool_registry.register(ToolSpec::new("echo", "echoes", serde_json::json!({}), Arc::new(EchoTool)));
        let templates = TemplateRegistry::new();
        templates.register_template(sample_template(), &tool_registry).await;
        let instances = InstanceRegistry::new();
        let factory = LocalFactory { root: dir.path().to_path_buf() };

        let first = instances.get_or_clone("default", "alice", &templates, &tool_registry, &factory).await.unwrap();
        first.thread_handle("t1").lock().await.messages.push(Message::user("hi"));
        let second = instances.get_or_clone("default", "alice", &templates, &tool_registry, &factory).await.unwrap();
        assert_eq!(second.thread_handle("t1").lock().await.messages.len(), 1);
    }

    #[tokio::test]
    async fn delete_instance_only_removes_that_user() {
        let dir = tempfile::tempdir().unwrap();
        let tool_registry = ToolRegistry::new();
        tool_registry.register(ToolSpec::new("echo", "echoes", serde_json::json!({}), Arc::new(EchoTool)));
        let templates = TemplateRegistry::new();
        templates.register_template(sample_template(), &tool_registry).await;
        let instances = InstanceRegistry::new();
        let factory = LocalFactory { root: dir.path().to_path_buf() };

        instances.get_or_clone("default", "alice", &templates, &tool_registry, &factory).await.unwrap();
        instances.get_or_clone("default", "bob", &templates, &tool_registry, &factory).await.unwrap();
        instances.delete_instance("default", "alice").await;

        assert!(!instances.contains("default", "alice").await);
        assert!(instances.contains("default", "bob").await);
    }

    #[tokio::test]
    async fn register_template_with_unregistered_tool_still_stores_template() {
        let tool_registry = ToolRegistry::new();
        let templates = TemplateRegistry::new();
        templates.register_template(sample_template(), &tool_registry).await;
        assert!(templates.get("default").await.is_some());
    }
}
