//! The agent loop engine (spec §4.G): plan → LLM → parse → execute tools →
//! iterate, exactly as spec.md's pseudocode. This is the one component with
//! no direct teacher analogue (the teacher's `StateGraph`/ReAct runner solves
//! a related but more general problem); its shape — sequential tool dispatch,
//! middleware-wrapped LLM/tool calls, checkpointed interrupts — is derived
//! straight from the pseudocode rather than ported from any one teacher file.

pub mod runtime;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::error::WardenError;
use crate::instance::{AgentInstance, InterruptRule, PendingInterrupt};
use crate::llm::{LlmClient, LlmRequest};
use crate::message::{Message, ToolCallRequest};
use crate::middleware::{LlmPipeline, ToolPipeline};
use crate::tools::{ToolCallContext, ToolSpec};
use crate::trace::{EventBus, Trace};
use warden_stream::TraceKind;

pub use runtime::{AgentRuntime, SubagentTool};

/// How a paused invocation is continued (spec §4.G: `approve`/`reject`/`edit`).
#[derive(Clone, Debug)]
pub enum ResumeDecision {
    Approve,
    Reject,
    Edit(Value),
}

/// How one `loop()` invocation ended (spec §4.G "Termination").
#[derive(Clone, Debug)]
pub enum LoopOutcome {
    /// Normal termination: the assistant produced no further tool calls.
    Completed { response: String },
    /// Paused before executing `tool_name`; resume with [`ResumeDecision`].
    Interrupted { tool_call_id: String, tool_name: String, args: Value, allowed_decisions: Vec<String> },
    /// Cancelled between iterations or tool calls; `partial` is whatever the
    /// assistant had streamed before cancellation was observed.
    Cancelled { partial: String },
    /// Iteration cap hit, or the LLM call itself failed.
    Error(WardenError),
}

/// Everything one `invoke`/`resume` call needs, bundled so the recursive
/// subagent call site doesn't have to thread five separate parameters.
pub struct LoopContext {
    pub instance: Arc<AgentInstance>,
    pub llm: Arc<dyn LlmClient>,
    pub llm_pipeline: Arc<LlmPipeline>,
    pub tool_pipeline: Arc<ToolPipeline>,
    pub events: Arc<EventBus>,
    /// Checked between iterations and between tool calls (spec §5); never
    /// aborts an in-flight LLM call.
    pub cancel: Arc<AtomicBool>,
}

fn emit(events: &EventBus, username: &str, trace: &mut Trace, kind: TraceKind, payload: Value) {
    let event = warden_stream::TraceEvent::now(kind, None, payload);
    events.publish(Some(username.to_string()), event.clone());
    trace.push(event);
}

fn active_interrupt<'a>(interrupt_on: &'a HashMap<String, InterruptRule>, tool_name: &str) -> Option<&'a InterruptRule> {
    interrupt_on.get(tool_name).filter(|rule| rule.enabled)
}

/// Runs `loop()` from spec §4.G starting at `new_messages` appended to
/// `thread_id`'s existing state. Returns [`WardenError::ThreadBusy`] without
/// running anything if another invocation already holds this thread's lock
/// (spec §5: "MUST either queue behind it or return 409 ThreadBusy" — this
/// implementation chooses the 409).
pub async fn invoke(ctx: &LoopContext, thread_id: &str, new_messages: Vec<Message>) -> Result<(LoopOutcome, Trace), WardenError> {
    let thread_lock = ctx.instance.thread_handle(thread_id);
    let mut thread = thread_lock.try_lock().map_err(|_| WardenError::ThreadBusy)?;

    if thread.pending_interrupt.is_some() {
        return Err(WardenError::BadRequest(
            "thread has a pending interrupt; call resume() instead of invoke()".into(),
        ));
    }

    thread.messages.extend(new_messages);
    let outcome = run_loop(ctx, thread_id, &mut thread.messages, &mut thread.pending_interrupt).await;
    let (outcome, trace) = outcome;
    Ok((outcome, trace))
}

/// Continues a thread paused at a [`PendingInterrupt`] (spec §4.G resume semantics).
pub async fn resume(ctx: &LoopContext, thread_id: &str, decision: ResumeDecision) -> Result<(LoopOutcome, Trace), WardenError> {
    let thread_lock = ctx.instance.thread_handle(thread_id);
    let mut thread = thread_lock.try_lock().map_err(|_| WardenError::ThreadBusy)?;

    let pending = thread
        .pending_interrupt
        .take()
        .ok_or_else(|| WardenError::BadRequest("thread has no pending interrupt".into()))?;

    let mut trace = Trace::new();
    match decision {
        ResumeDecision::Reject => {
            thread.messages.push(Message::tool(pending.tool_call_id, pending.name, "The user rejected this call."));
        }
        ResumeDecision::Approve => {
            let result = run_one_tool_call(ctx, thread_id, &ToolCallRequest { id: pending.tool_call_id.clone(), name: pending.name.clone(), args: pending.args }, &mut trace).await;
            thread.messages.push(Message::tool(pending.tool_call_id, pending.name, result));
        }
        ResumeDecision::Edit(edit_args) => {
            let result = run_one_tool_call(ctx, thread_id, &ToolCallRequest { id: pending.tool_call_id.clone(), name: pending.name.clone(), args: edit_args }, &mut trace).await;
            thread.messages.push(Message::tool(pending.tool_call_id, pending.name, result));
        }
    }

    let (outcome, continuation_trace) = run_loop(ctx, thread_id, &mut thread.messages, &mut thread.pending_interrupt).await;
    let mut merged = trace;
    for event in continuation_trace.into_events() {
        merged.push(event);
    }
    Ok((outcome, merged))
}

/// Executes one tool call through the middleware pipeline, converting any
/// error into a string tool result rather than propagating it (spec §7:
/// "tool execution errors are caught and converted to a tool message").
async fn run_one_tool_call(ctx: &LoopContext, thread_id: &str, tc: &ToolCallRequest, trace: &mut Trace) -> Value {
    emit(&ctx.events, &ctx.instance.username, trace, TraceKind::ToolCall, serde_json::json!({"id": tc.id, "name": tc.name, "args": tc.args}));

    let tools = ctx.instance.tool_callables().await;
    let Some(spec) = tools.iter().find(|t| t.name() == tc.name) else {
        let err = Value::String(format!("Error: unknown tool '{}'", tc.name));
        emit(&ctx.events, &ctx.instance.username, trace, TraceKind::ToolResult, serde_json::json!({"id": tc.id, "error": true}));
        return err;
    };

    let tool_ctx = ToolCallContext { username: ctx.instance.username.clone(), thread_id: thread_id.to_string(), backend: ctx.instance.backend().await };
    let result = ctx.tool_pipeline.run(&tool_ctx, tc.name.clone(), tc.args.clone(), spec.callable.as_ref()).await;

    let value = match result {
        Ok(v) => v,
        Err(e) => {
            warn!(tool = %tc.name, error = %e, "tool call failed");
            Value::String(format!("Error: {e}"))
        }
    };
    emit(&ctx.events, &ctx.instance.username, trace, TraceKind::ToolResult, serde_json::json!({"id": tc.id}));
    value
}

fn build_request(template: &crate::instance::AgentTemplate, tools: &[ToolSpec], messages: &[Message]) -> LlmRequest {
    let mut request = LlmRequest::new(template.model.clone(), messages.to_vec());
    request.system_prompt = Some(template.system_prompt.clone());
    request.tools = tools.to_vec();
    request
}

/// The core state machine (spec §4.G pseudocode), operating on `messages`/
/// `pending_interrupt` in place under the caller's already-held thread lock.
async fn run_loop(
    ctx: &LoopContext,
    thread_id: &str,
    messages: &mut Vec<Message>,
    pending_interrupt: &mut Option<PendingInterrupt>,
) -> (LoopOutcome, Trace) {
    let mut trace = Trace::new();
    let username = ctx.instance.username.clone();
    emit(&ctx.events, &username, &mut trace, TraceKind::AgentStart, serde_json::json!({}));

    let template = ctx.instance.template().await;
    let tools = ctx.instance.tool_callables().await;

    for _iteration in 0..template.max_iterations {
        if ctx.cancel.load(Ordering::Relaxed) {
            let partial = messages.iter().rev().find_map(|m| match m {
                Message::Assistant { content, .. } => Some(content.clone()),
                _ => None,
            }).unwrap_or_default();
            return (LoopOutcome::Cancelled { partial }, trace);
        }

        let request = build_request(&template, &tools, messages);
        emit(&ctx.events, &username, &mut trace, TraceKind::LlmStart, serde_json::json!({"model": template.model}));
        let response = match ctx.llm_pipeline.run(request, ctx.llm.as_ref()).await {
            Ok(r) => r,
            Err(e) => {
                emit(&ctx.events, &username, &mut trace, TraceKind::Error, serde_json::json!({"error": e.to_string()}));
                return (LoopOutcome::Error(e), trace);
            }
        };
        emit(&ctx.events, &username, &mut trace, TraceKind::LlmEnd, serde_json::json!({"tool_calls": response.tool_calls.len()}));

        if response.tool_calls.is_empty() {
            messages.push(Message::assistant(response.content.clone(), vec![]));
            emit(&ctx.events, &username, &mut trace, TraceKind::AgentEnd, serde_json::json!({}));
            emit(&ctx.events, &username, &mut trace, TraceKind::Done, serde_json::json!({}));
            return (LoopOutcome::Completed { response: response.content }, trace);
        }

        messages.push(Message::assistant(response.content.clone(), response.tool_calls.clone()));

        for tc in &response.tool_calls {
            if ctx.cancel.load(Ordering::Relaxed) {
                return (LoopOutcome::Cancelled { partial: response.content.clone() }, trace);
            }

            if let Some(rule) = active_interrupt(&template.interrupt_on, &tc.name) {
                let interrupt = PendingInterrupt {
                    tool_call_id: tc.id.clone(),
                    name: tc.name.clone(),
                    args: tc.args.clone(),
                    allowed_decisions: rule.allowed_decisions.clone(),
                };
                emit(&ctx.events, &username, &mut trace, TraceKind::Interrupt, serde_json::json!({"tool_call_id": tc.id, "name": tc.name}));
                let outcome = LoopOutcome::Interrupted {
                    tool_call_id: interrupt.tool_call_id.clone(),
                    tool_name: interrupt.name.clone(),
                    args: interrupt.args.clone(),
                    allowed_decisions: interrupt.allowed_decisions.clone(),
                };
                *pending_interrupt = Some(interrupt);
                return (outcome, trace);
            }

            let result = run_one_tool_call(ctx, thread_id, tc, &mut trace).await;
            messages.push(Message::tool(tc.id.clone(), tc.name.clone(), result));
        }
    }

    emit(&ctx.events, &username, &mut trace, TraceKind::Error, serde_json::json!({"error": "iteration_cap"}));
    (LoopOutcome::Error(WardenError::IterationCap), trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{AgentTemplate, BackendConfig, InstanceRegistry, TemplateRegistry};
    use crate::llm::{LlmResponse, MockLlm};
    use crate::sandbox::LocalBackend;
    use crate::tools::{ToolCallable, ToolRegistry};
    use async_trait::async_trait;
    use std::collections::HashMap as Map;

    struct AddTool;

    #[async_trait]
    impl ToolCallable for AddTool {
        async fn call(&self, _ctx: &ToolCallContext, args: Value) -> Result<Value, WardenError> {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::String((a + b).to_string()))
        }
    }

    struct LocalFactory(std::path::PathBuf);

    #[async_trait]
    impl crate::instance::BackendFactory for LocalFactory {
        async fn build(&self, _cfg: &BackendConfig, username: &str) -> Result<Arc<dyn crate::sandbox::SandboxBackend>, WardenError> {
            Ok(Arc::new(LocalBackend::new(&self.0, username).await?))
        }
    }

    fn template(max_iterations: u32, interrupt_on: Map<String, InterruptRule>) -> AgentTemplate {
        let now = chrono::Utc::now();
        AgentTemplate {
            agent_id: "default".into(),
            name: "default".into(),
            model: "stub".into(),
            system_prompt: "Reply with OK.".into(),
            tool_names: vec!["add".into()],
            middleware_names: vec![],
            subagents: vec![],
            backend_cfg: BackendConfig::Local { root: "/tmp/warden".into() },
            interrupt_on,
            max_iterations,
            context_window_tokens: 8000,
            debug: false,
            created_at: now,
            updated_at: now,
        }
    }

    async fn make_context(dir: &std::path::Path, llm_responses: Vec<LlmResponse>, max_iterations: u32, interrupt_on: Map<String, InterruptRule>) -> LoopContext {
        let tool_registry = ToolRegistry::new();
        tool_registry.register(ToolSpec::new("add", "adds two numbers", serde_json::json!({"type":"object"}), Arc::new(AddTool)));
        let templates = TemplateRegistry::new();
        templates.register_template(template(max_iterations, interrupt_on), &tool_registry).await;
        let instances = InstanceRegistry::new();
        let factory = LocalFactory(dir.to_path_buf());
        let instance = instances.get_or_clone("default", "alice", &templates, &tool_registry, &factory).await.unwrap();

        LoopContext {
            instance,
            llm: Arc::new(MockLlm::new(llm_responses)),
            llm_pipeline: Arc::new(LlmPipeline::new(vec![])),
            tool_pipeline: Arc::new(ToolPipeline::new(vec![])),
            events: Arc::new(EventBus::new()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn happy_path_no_tools() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = make_context(&dir, vec![LlmResponse { content: "OK".into(), tool_calls: vec![] }], 10, Map::new()).await;

        let (outcome, trace) = invoke(&ctx, "t1", vec![Message::user("hi")]).await.unwrap();
        match outcome {
            LoopOutcome::Completed { response } => assert_eq!(response, "OK"),
            other => panic!("expected Completed, got {other:?}"),
        }
        let kinds: Vec<_> = trace.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![TraceKind::AgentStart, TraceKind::LlmStart, TraceKind::LlmEnd, TraceKind::AgentEnd, TraceKind::Done]);
    }

    #[tokio::test]
    async fn tool_call_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = make_context(
            &dir,
            vec![
                LlmResponse { content: String::new(), tool_calls: vec![ToolCallRequest { id: "t1".into(), name: "add".into(), args: serde_json::json!({"a":2,"b":3}) }] },
                LlmResponse { content: "5".into(), tool_calls: vec![] },
            ],
            10,
            Map::new(),
        )
        .await;

        let (outcome, _trace) = invoke(&ctx, "thread-1", vec![Message::user("add 2 and 3")]).await.unwrap();
        match outcome {
            LoopOutcome::Completed { response } => assert_eq!(response, "5"),
            other => panic!("expected Completed, got {other:?}"),
        }

        let thread = ctx.instance.thread_handle("thread-1");
        let messages = &thread.lock().await.messages;
        assert_eq!(messages.len(), 4); // user, assistant(tool_call), tool, assistant("5")
    }

    #[tokio::test]
    async fn iteration_cap_hit_emits_error_as_the_last_event() {
        let dir = tempfile::tempdir().unwrap();
        let responses: Vec<LlmResponse> = (0..3)
            .map(|i| LlmResponse { content: String::new(), tool_calls: vec![ToolCallRequest { id: format!("t{i}"), name: "add".into(), args: serde_json::json!({"a":1,"b":1}) }] })
            .collect();
        let ctx = make_context(&dir, responses, 3, Map::new()).await;

        let (outcome, trace) = invoke(&ctx, "t1", vec![Message::user("loop forever")]).await.unwrap();
        assert!(matches!(outcome, LoopOutcome::Error(WardenError::IterationCap)));
        assert_eq!(trace.events().last().unwrap().kind, TraceKind::Error);
    }

    #[tokio::test]
    async fn interrupt_then_resume_approve_runs_the_tool_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let mut interrupt_on = Map::new();
        interrupt_on.insert("add".to_string(), InterruptRule { enabled: true, allowed_decisions: vec!["approve".into(), "reject".into(), "edit".into()] });
        let ctx = make_context(
            &dir,
            vec![
                LlmResponse { content: String::new(), tool_calls: vec![ToolCallRequest { id: "t1".into(), name: "add".into(), args: serde_json::json!({"a":2,"b":3}) }] },
                LlmResponse { content: "the sum is 5".into(), tool_calls: vec![] },
            ],
            10,
            interrupt_on,
        )
        .await;

        let (outcome, _) = invoke(&ctx, "t1", vec![Message::user("add 2 and 3")]).await.unwrap();
        match outcome {
            LoopOutcome::Interrupted { tool_call_id, tool_name, .. } => {
                assert_eq!(tool_call_id, "t1");
                assert_eq!(tool_name, "add");
            }
            other => panic!("expected Interrupted, got {other:?}"),
        };

        let (outcome, _) = resume(&ctx, "t1", ResumeDecision::Approve).await.unwrap();
        match outcome {
            LoopOutcome::Completed { response } => assert_eq!(response, "the sum is 5"),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn interrupt_then_resume_edit_uses_edited_args() {
        let dir = tempfile::tempdir().unwrap();
        let mut interrupt_on = Map::new();
        interrupt_on.insert("add".to_string(), InterruptRule { enabled: true, allowed_decisions: vec!["approve".into(), "edit".into()] });
        let ctx = make_context(
            &dir,
            vec![
                LlmResponse { content: String::new(), tool_calls: vec![ToolCallRequest { id: "t1".into(), name: "add".into(), args: serde_json::json!({"a":2,"b":3}) }] },
                LlmResponse { content: "done".into(), tool_calls: vec![] },
            ],
            10,
            interrupt_on,
        )
        .await;

        invoke(&ctx, "t1", vec![Message::user("add 2 and 3")]).await.unwrap();
        resume(&ctx, "t1", ResumeDecision::Edit(serde_json::json!({"a": 10, "b": 20}))).await.unwrap();

        let thread = ctx.instance.thread_handle("t1");
        let messages = thread.lock().await.messages.clone();
        let tool_msg = messages.iter().find_map(|m| match m {
            Message::Tool { content, .. } => Some(content.as_text()),
            _ => None,
        });
        assert_eq!(tool_msg.as_deref(), Some("30"));
    }

    #[tokio::test]
    async fn a_second_invoke_on_a_busy_thread_returns_thread_busy() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = make_context(&dir, vec![LlmResponse { content: "OK".into(), tool_calls: vec![] }], 10, Map::new()).await;

        let thread = ctx.instance.thread_handle("t1");
        let _held = thread.try_lock().unwrap();
        let err = invoke(&ctx, "t1", vec![Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, WardenError::ThreadBusy));
    }

    #[tokio::test]
    async fn per_user_isolation_keeps_separate_backends_and_threads() {
        let dir = tempfile::tempdir().unwrap();
        let tool_registry = ToolRegistry::new();
        tool_registry.register(ToolSpec::new("add", "adds", serde_json::json!({}), Arc::new(AddTool)));
        let templates = TemplateRegistry::new();
        templates.register_template(template(10, Map::new()), &tool_registry).await;
        let instances = InstanceRegistry::new();
        let factory = LocalFactory(dir.path().to_path_buf());

        let alice = instances.get_or_clone("default", "alice", &templates, &tool_registry, &factory).await.unwrap();
        let bob = instances.get_or_clone("default", "bob", &templates, &tool_registry, &factory).await.unwrap();

        alice.backend().await.write_file("secret.txt", "alice-only").await.unwrap();
        let bob_download = bob.backend().await.download(vec!["secret.txt".into()]).await.unwrap();
        assert_eq!(bob_download[0].error.as_deref(), Some("file_not_found"));
    }
}
