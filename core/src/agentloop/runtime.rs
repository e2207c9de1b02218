//! Wires templates, instances, tools and the LLM/tool pipelines into the
//! process-wide entry points `invoke`/`resume` (spec §4.E, §4.G), and supplies
//! the built-in `subagent` delegation tool (spec §4.G: "nested subagent tool
//! invocation on a fresh thread with a filtered tool subset").

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::WardenError;
use crate::instance::{AgentTemplate, BackendFactory, InstanceRegistry, SubAgentSpec, TemplateRegistry};
use crate::llm::LlmClient;
use crate::message::Message;
use crate::middleware::{LlmPipeline, LoggingLlmMiddleware, LoggingToolMiddleware, ResponseCacheMiddleware, SummarizerMiddleware, ToolPipeline};
use crate::tools::{ToolCallContext, ToolCallable, ToolRegistry, ToolSpec};
use crate::trace::{EventBus, Trace};

use super::{resume as run_resume, invoke as run_invoke, LoopContext, LoopOutcome, ResumeDecision};

type LlmResolver = dyn Fn(&str) -> Arc<dyn LlmClient> + Send + Sync;

/// Everything one server process shares across every `(agent_id, username)`
/// pair: the template/instance/tool registries, an LLM client resolver keyed
/// by model name, and the process-global event bus.
pub struct AgentRuntime {
    pub templates: Arc<TemplateRegistry>,
    pub instances: Arc<InstanceRegistry>,
    pub tool_registry: Arc<ToolRegistry>,
    pub backend_factory: Arc<dyn BackendFactory>,
    pub events: Arc<EventBus>,
    llm_resolver: Arc<LlmResolver>,
    weak_self: Weak<AgentRuntime>,
}

impl AgentRuntime {
    pub fn new(
        templates: Arc<TemplateRegistry>,
        instances: Arc<InstanceRegistry>,
        tool_registry: Arc<ToolRegistry>,
        backend_factory: Arc<dyn BackendFactory>,
        events: Arc<EventBus>,
        llm_resolver: Arc<LlmResolver>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            templates,
            instances,
            tool_registry,
            backend_factory,
            events,
            llm_resolver,
            weak_self: weak.clone(),
        })
    }

    /// Registers each of `template.subagents` as a callable tool before
    /// storing the template itself, so `TemplateRegistry::register_template`'s
    /// unregistered-tool warning never fires for a subagent delegation name.
    pub async fn register_template(&self, template: AgentTemplate) {
        for spec in &template.subagents {
            let tool = SubagentTool { runtime: self.weak_self.clone(), spec: spec.clone() };
            self.tool_registry.register(ToolSpec::new(
                spec.name.clone(),
                format!("Delegates to the '{}' subagent and returns its final reply.", spec.name),
                serde_json::json!({
                    "type": "object",
                    "properties": {"message": {"type": "string"}},
                    "required": ["message"],
                }),
                Arc::new(tool),
            ));
        }
        self.templates.register_template(template, &self.tool_registry).await;
    }

    /// Resolves `middleware_names` into a [`LlmPipeline`]. Unknown names are
    /// ignored with a warning rather than failing the invocation (same
    /// forgiving-startup posture as [`TemplateRegistry::register_template`]).
    fn build_llm_pipeline(&self, template: &AgentTemplate) -> Arc<LlmPipeline> {
        let mut stack: Vec<Arc<dyn crate::middleware::LlmMiddleware>> = Vec::new();
        for name in &template.middleware_names {
            match name.as_str() {
                "logging" => stack.push(Arc::new(LoggingLlmMiddleware)),
                "cache" => stack.push(Arc::new(ResponseCacheMiddleware::new())),
                "summarizer" => stack.push(Arc::new(SummarizerMiddleware::new(template.context_window_tokens))),
                other => tracing::warn!(middleware = %other, "unknown llm middleware name, skipping"),
            }
        }
        Arc::new(LlmPipeline::new(stack))
    }

    fn build_tool_pipeline(&self, template: &AgentTemplate) -> Arc<ToolPipeline> {
        let mut stack: Vec<Arc<dyn crate::middleware::ToolMiddleware>> = Vec::new();
        for name in &template.middleware_names {
            if name == "logging" {
                stack.push(Arc::new(LoggingToolMiddleware));
            }
        }
        Arc::new(ToolPipeline::new(stack))
    }

    async fn loop_context(&self, agent_id: &str, username: &str) -> Result<LoopContext, WardenError> {
        let instance = self
            .instances
            .get_or_clone(agent_id, username, &self.templates, &self.tool_registry, self.backend_factory.as_ref())
            .await?;
        let template = instance.template().await;
        let llm = (self.llm_resolver)(&template.model);
        Ok(LoopContext {
            llm_pipeline: self.build_llm_pipeline(&template),
            tool_pipeline: self.build_tool_pipeline(&template),
            instance,
            llm,
            events: self.events.clone(),
            cancel: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    pub async fn invoke(&self, agent_id: &str, username: &str, thread_id: &str, new_messages: Vec<Message>) -> Result<(LoopOutcome, Trace), WardenError> {
        let ctx = self.loop_context(agent_id, username).await?;
        run_invoke(&ctx, thread_id, new_messages).await
    }

    pub async fn resume(&self, agent_id: &str, username: &str, thread_id: &str, decision: ResumeDecision) -> Result<(LoopOutcome, Trace), WardenError> {
        let ctx = self.loop_context(agent_id, username).await?;
        run_resume(&ctx, thread_id, decision).await
    }
}

/// The callable behind a `subagents` entry: runs a fresh, independent loop
/// against the target agent under the *same* username, then surfaces its
/// final text as this tool's result. Holds only a [`Weak`] back-reference to
/// the runtime that registered it, since the registry → tool → runtime path
/// would otherwise be a reference cycle that never deallocates.
pub struct SubagentTool {
    runtime: Weak<AgentRuntime>,
    spec: SubAgentSpec,
}

#[async_trait]
impl ToolCallable for SubagentTool {
    async fn call(&self, ctx: &ToolCallContext, args: Value) -> Result<Value, WardenError> {
        let runtime = self
            .runtime
            .upgrade()
            .ok_or_else(|| WardenError::BackendError("agent runtime no longer available".into()))?;

        if let Some(subset) = &self.spec.tool_subset {
            let instance = runtime
                .instances
                .get_or_clone(&self.spec.agent_id, &ctx.username, &runtime.templates, &runtime.tool_registry, runtime.backend_factory.as_ref())
                .await?;
            let narrowed: Vec<String> = instance.template().await.tool_names.into_iter().filter(|n| subset.contains(n)).collect();
            runtime.instances.update_tools(&self.spec.agent_id, &ctx.username, narrowed, &runtime.tool_registry).await?;
        }

        let message = args.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
        let thread_id = format!("subagent-{}-{}", self.spec.name, Uuid::new_v4());

        let (outcome, _trace) = runtime.invoke(&self.spec.agent_id, &ctx.username, &thread_id, vec![Message::user(message)]).await?;
        match outcome {
            LoopOutcome::Completed { response } => Ok(Value::String(response)),
            LoopOutcome::Cancelled { partial } => Ok(Value::String(partial)),
            LoopOutcome::Interrupted { .. } => Err(WardenError::BadRequest(format!(
                "subagent '{}' paused on an interrupt; subagents cannot be resumed from within a parent loop",
                self.spec.name
            ))),
            LoopOutcome::Error(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{BackendConfig, InterruptRule};
    use crate::llm::{LlmResponse, MockLlm};
    use crate::message::ToolCallRequest;
    use crate::sandbox::{LocalBackend, SandboxBackend};
    use std::collections::HashMap;

    struct LocalFactory(std::path::PathBuf);

    #[async_trait]
    impl BackendFactory for LocalFactory {
        async fn build(&self, _cfg: &BackendConfig, username: &str) -> Result<Arc<dyn SandboxBackend>, WardenError> {
            Ok(Arc::new(LocalBackend::new(&self.0, username).await?))
        }
    }

    fn base_template(agent_id: &str, model: &str, subagents: Vec<SubAgentSpec>) -> AgentTemplate {
        let now = chrono::Utc::now();
        AgentTemplate {
            agent_id: agent_id.into(),
            name: agent_id.into(),
            model: model.into(),
            system_prompt: "be helpful".into(),
            tool_names: subagents.iter().map(|s| s.name.clone()).collect(),
            middleware_names: vec!["logging".into()],
            subagents,
            backend_cfg: BackendConfig::Local { root: "/tmp/warden".into() },
            interrupt_on: HashMap::new(),
            max_iterations: 10,
            context_window_tokens: 8000,
            debug: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn runtime_with(responses_by_model: HashMap<&'static str, Vec<LlmResponse>>, dir: &std::path::Path) -> Arc<AgentRuntime> {
        let mocks: HashMap<String, Arc<dyn LlmClient>> = responses_by_model
            .into_iter()
            .map(|(model, responses)| (model.to_string(), Arc::new(MockLlm::new(responses)) as Arc<dyn LlmClient>))
            .collect();
        let mocks = Arc::new(mocks);
        let resolver: Arc<LlmResolver> = Arc::new(move |model: &str| mocks.get(model).cloned().expect("configured mock for model"));

        AgentRuntime::new(
            Arc::new(TemplateRegistry::new()),
            Arc::new(InstanceRegistry::new()),
            Arc::new(ToolRegistry::new()),
            Arc::new(LocalFactory(dir.to_path_buf())),
            Arc::new(EventBus::new()),
            resolver,
        )
    }

    #[tokio::test]
    async fn subagent_tool_delegates_and_returns_the_childs_final_reply() {
        let dir = tempfile::tempdir().unwrap();
        let mut responses = HashMap::new();
        responses.insert(
            "parent-model",
            vec![
                LlmResponse {
                    content: String::new(),
                    tool_calls: vec![ToolCallRequest { id: "c1".into(), name: "helper".into(), args: serde_json::json!({"message": "please help"}) }],
                },
                LlmResponse { content: "the helper says: child done".into(), tool_calls: vec![] },
            ],
        );
        responses.insert("child-model", vec![LlmResponse { content: "child done".into(), tool_calls: vec![] }]);
        let runtime = runtime_with(responses, dir.path());

        runtime.register_template(base_template("child", "child-model", vec![])).await;
        let parent_subagents = vec![SubAgentSpec { name: "helper".into(), agent_id: "child".into(), tool_subset: None }];
        runtime.register_template(base_template("parent", "parent-model", parent_subagents)).await;

        let (outcome, _trace) = runtime.invoke("parent", "alice", "main", vec![Message::user("go")]).await.unwrap();
        match outcome {
            LoopOutcome::Completed { response } => assert!(response.contains("child done")),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_after_interrupt_goes_through_the_runtime_too() {
        let dir = tempfile::tempdir().unwrap();
        let mut responses = HashMap::new();
        responses.insert(
            "m",
            vec![
                LlmResponse {
                    content: String::new(),
                    tool_calls: vec![ToolCallRequest { id: "t1".into(), name: "helper".into(), args: serde_json::json!({"message": "x"}) }],
                },
                LlmResponse { content: "resumed".into(), tool_calls: vec![] },
            ],
        );
        responses.insert("child-model", vec![LlmResponse { content: "done".into(), tool_calls: vec![] }]);
        let runtime = runtime_with(responses, dir.path());

        runtime.register_template(base_template("child", "child-model", vec![])).await;
        let mut template = base_template("parent", "m", vec![SubAgentSpec { name: "helper".into(), agent_id: "child".into(), tool_subset: None }]);
        template.interrupt_on.insert("helper".into(), InterruptRule { enabled: true, allowed_decisions: vec!["approve".into(), "reject".into()] });
        runtime.register_template(template).await;

        let (outcome, _) = runtime.invoke("parent", "bob", "main", vec![Message::user("go")]).await.unwrap();
        assert!(matches!(outcome, LoopOutcome::Interrupted { .. }));

        let (outcome, _) = runtime.resume("parent", "bob", "main", ResumeDecision::Reject).await.unwrap();
        match outcome {
            LoopOutcome::Completed { response } => assert_eq!(response, "resumed"),
            other => panic!("expected Completed, got {other:?}"),
        }
    }
}
