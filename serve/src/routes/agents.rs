//! Agent CRUD, invoke/stream/resume, and tool listing (spec §6).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::Stream;
use warden::agentloop::{LoopOutcome, ResumeDecision};
use warden::instance::AgentInstance;
use warden::message::Message;
use warden::trace::Trace;
use warden::WardenError;

use crate::auth::{tool_allowed, Caller};
use crate::dto::*;
use crate::error::ApiError;
use crate::state::AppState;

fn enforce_tool_acl(caller: &Caller, names: &[String]) -> Result<(), ApiError> {
    if let Some(forbidden) = names.iter().find(|n| !tool_allowed(caller.tool_acl.as_ref(), n)) {
        return Err(ApiError(WardenError::ToolForbidden(forbidden.clone())));
    }
    Ok(())
}

async fn agent_info(instance: &AgentInstance) -> AgentInfo {
    let template = instance.template().await;
    let backend = instance.backend().await;
    let (backend_type, sandbox_url, container_status) = match &template.backend_cfg {
        warden::instance::BackendConfig::Local { .. } => ("local".to_string(), None, None),
        warden::instance::BackendConfig::Docker { docker_host, .. } => {
            let status = backend.as_docker().map(|d| d.container_status());
            let status = match status {
                Some(fut) => Some(fut.await),
                None => None,
            };
            ("docker".to_string(), docker_host.clone(), status)
        }
    };
    AgentInfo {
        agent_id: template.agent_id,
        name: template.name,
        model: template.model,
        tools: template.tool_names,
        backend_type,
        sandbox_url,
        container_status,
        created_at: template.created_at,
        updated_at: template.updated_at,
    }
}

pub async fn create_agent(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<AgentCreateRequest>,
) -> Result<Json<AgentInfo>, ApiError> {
    enforce_tool_acl(&caller, &req.tools)?;
    let template = req.into_template(25, &state.sandbox_root.display().to_string());
    let agent_id = template.agent_id.clone();
    state.runtime.register_template(template).await;
    let instance = state
        .runtime
        .instances
        .get_or_clone(&agent_id, &caller.username, &state.runtime.templates, &state.runtime.tool_registry, state.runtime.backend_factory.as_ref())
        .await?;
    Ok(Json(agent_info(&instance).await))
}

pub async fn list_agents(State(state): State<Arc<AppState>>, caller: Caller) -> Json<Vec<AgentInfo>> {
    let instances = state.runtime.instances.list_for_user(&caller.username).await;
    let mut infos = Vec::with_capacity(instances.len());
    for instance in &instances {
        infos.push(agent_info(instance).await);
    }
    Json(infos)
}

pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentInfo>, ApiError> {
    let instance = state
        .runtime
        .instances
        .get_or_clone(&agent_id, &caller.username, &state.runtime.templates, &state.runtime.tool_registry, state.runtime.backend_factory.as_ref())
        .await?;
    Ok(Json(agent_info(&instance).await))
}

pub async fn delete_agent(State(state): State<Arc<AppState>>, caller: Caller, Path(agent_id): Path<String>) -> StatusCode {
    state.runtime.instances.delete_instance(&agent_id, &caller.username).await;
    StatusCode::NO_CONTENT
}

pub async fn patch_tools(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(agent_id): Path<String>,
    Json(req): Json<ToolsPatchRequest>,
) -> Result<Json<ToolsPatchResponse>, ApiError> {
    enforce_tool_acl(&caller, &req.tools)?;
    state
        .runtime
        .instances
        .update_tools(&agent_id, &caller.username, req.tools.clone(), &state.runtime.tool_registry)
        .await?;
    Ok(Json(ToolsPatchResponse { agent_id, tools: req.tools }))
}

pub async fn patch_backend(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(agent_id): Path<String>,
    Json(req): Json<BackendPatchRequest>,
) -> Result<Json<BackendPatchResponse>, ApiError> {
    let instance = state
        .runtime
        .instances
        .get_or_clone(&agent_id, &caller.username, &state.runtime.templates, &state.runtime.tool_registry, state.runtime.backend_factory.as_ref())
        .await?;
    let current = instance.template().await.backend_cfg;

    let new_cfg = match req.mode.as_deref() {
        Some("docker") => {
            let image = req.image.or_else(|| match &current {
                warden::instance::BackendConfig::Docker { image, .. } => Some(image.clone()),
                _ => None,
            }).ok_or_else(|| ApiError(WardenError::BadRequest("image required to switch to docker backend".into())))?;
            warden::instance::BackendConfig::Docker {
                container_name: format!("warden-{agent_id}-{}", caller.username),
                workdir: "/workspace".to_string(),
                docker_host: req.sandbox_url,
                image,
            }
        }
        Some("local") | None => warden::instance::BackendConfig::Local { root: state.sandbox_root.display().to_string() },
        Some(other) => return Err(ApiError(WardenError::BadRequest(format!("unknown backend mode: {other}")))),
    };

    state
        .runtime
        .instances
        .update_backend(&agent_id, &caller.username, new_cfg, state.runtime.backend_factory.as_ref())
        .await?;

    // Fires the (lazy) container launch asynchronously rather than blocking this request on it.
    let instance = state.runtime.instances.get(&agent_id, &caller.username).await;
    if let Some(instance) = instance {
        let backend = instance.backend().await;
        if backend.as_docker().is_some() {
            tokio::spawn(async move {
                let _ = backend.execute("true").await;
            });
        }
    }

    let instance = state
        .runtime
        .instances
        .get(&agent_id, &caller.username)
        .await
        .ok_or_else(|| ApiError(WardenError::NotFound(format!("instance: {agent_id}"))))?;
    let info = agent_info(&instance).await;
    Ok(Json(BackendPatchResponse {
        agent_id: info.agent_id,
        sandbox_url: info.sandbox_url,
        backend_type: info.backend_type,
        container_status: info.container_status,
        container_error: None,
    }))
}

pub async fn tools_available(State(state): State<Arc<AppState>>, caller: Caller) -> Json<ToolsAvailableResponse> {
    let names = state.runtime.tool_registry.names();
    let allowed = names.into_iter().filter(|n| tool_allowed(caller.tool_acl.as_ref(), n)).collect();
    Json(ToolsAvailableResponse { tools: allowed })
}

fn decode_messages(messages: Vec<WireMessage>) -> Result<Vec<Message>, ApiError> {
    messages.into_iter().map(Message::try_from).collect::<Result<Vec<_>, _>>().map_err(ApiError)
}

fn resolve_thread_id(thread_id: Option<String>) -> String {
    thread_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn outcome_to_response(thread_id: String, outcome: LoopOutcome, trace: Option<Trace>, include_trace: bool) -> Result<InvokeResponse, ApiError> {
    let trace_events = if include_trace { trace.map(|t| t.into_events()) } else { None };
    match outcome {
        LoopOutcome::Completed { response } => Ok(InvokeResponse {
            thread_id,
            response: Some(response),
            interrupted: false,
            tool_call_id: None,
            tool_name: None,
            tool_args: None,
            allowed_decisions: None,
            trace: trace_events,
        }),
        LoopOutcome::Interrupted { tool_call_id, tool_name, args, allowed_decisions } => Ok(InvokeResponse {
            thread_id,
            response: None,
            interrupted: true,
            tool_call_id: Some(tool_call_id),
            tool_name: Some(tool_name),
            tool_args: Some(args),
            allowed_decisions: Some(allowed_decisions),
            trace: trace_events,
        }),
        LoopOutcome::Cancelled { partial } => Ok(InvokeResponse {
            thread_id,
            response: Some(partial),
            interrupted: false,
            tool_call_id: None,
            tool_name: None,
            tool_args: None,
            allowed_decisions: None,
            trace: trace_events,
        }),
        LoopOutcome::Error(e) => Err(ApiError(e)),
    }
}

async fn do_invoke(
    state: &AppState,
    caller: &Caller,
    agent_id: &str,
    req: InvokeRequest,
) -> Result<InvokeResponse, ApiError> {
    let messages = decode_messages(req.messages)?;
    let thread_id = resolve_thread_id(req.thread_id);
    let (outcome, trace) = state.runtime.invoke(agent_id, &caller.username, &thread_id, messages).await?;
    outcome_to_response(thread_id, outcome, Some(trace), req.trace)
}

pub async fn invoke_with_id(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(agent_id): Path<String>,
    Json(req): Json<InvokeRequest>,
) -> Result<Json<InvokeResponse>, ApiError> {
    Ok(Json(do_invoke(&state, &caller, &agent_id, req).await?))
}

pub async fn invoke_no_id(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<InvokeRequest>,
) -> Result<Json<InvokeResponse>, ApiError> {
    let agent_id = req.agent_id.clone().ok_or_else(|| ApiError(WardenError::BadRequest("agent_id required".into())))?;
    Ok(Json(do_invoke(&state, &caller, &agent_id, req).await?))
}

async fn do_resume(state: &AppState, caller: &Caller, agent_id: &str, req: ResumeRequest) -> Result<InvokeResponse, ApiError> {
    let decision = match req.decision.as_str() {
        "approve" => ResumeDecision::Approve,
        "reject" => ResumeDecision::Reject,
        "edit" => ResumeDecision::Edit(req.edit_args.ok_or_else(|| ApiError(WardenError::BadRequest("edit_args required for edit decision".into())))?),
        other => return Err(ApiError(WardenError::BadRequest(format!("unknown decision: {other}")))),
    };
    let (outcome, trace) = state.runtime.resume(agent_id, &caller.username, &req.thread_id, decision).await?;
    outcome_to_response(req.thread_id.clone(), outcome, Some(trace), false)
}

pub async fn resume_with_id(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(agent_id): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<InvokeResponse>, ApiError> {
    Ok(Json(do_resume(&state, &caller, &agent_id, req).await?))
}

pub async fn resume_no_id(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<InvokeResponse>, ApiError> {
    let agent_id = req.agent_id.clone().ok_or_else(|| ApiError(WardenError::BadRequest("agent_id required".into())))?;
    Ok(Json(do_resume(&state, &caller, &agent_id, req).await?))
}

/// Subscribes to the caller's events before running the invocation on a
/// background task, forwarding every `TraceEvent` it emits as an SSE frame
/// until a terminal event arrives (spec §4.H: "strictly serialized" per thread).
async fn stream_invocation(
    state: Arc<AppState>,
    caller: Caller,
    agent_id: String,
    req: InvokeRequest,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let mut sub = state.runtime.events.subscribe(Some(caller.username.clone()));
    let runtime = state.runtime.clone();
    let username = caller.username.clone();

    tokio::spawn(async move {
        let messages = match decode_messages(req.messages) {
            Ok(m) => m,
            Err(_) => return,
        };
        let thread_id = resolve_thread_id(req.thread_id);
        let _ = runtime.invoke(&agent_id, &username, &thread_id, messages).await;
    });

    async_stream::stream! {
        while let Some(scoped) = sub.recv().await {
            let terminal = scoped.event.kind.is_terminal();
            if let Ok(data) = serde_json::to_string(&scoped.event) {
                yield Ok(Event::default().event(scoped.event.kind.as_sse_name()).data(data));
            }
            if terminal {
                break;
            }
        }
    }
}

pub async fn stream_with_id(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(agent_id): Path<String>,
    Json(req): Json<InvokeRequest>,
) -> impl IntoResponse {
    let stream = stream_invocation(state, caller, agent_id, req).await;
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(30)).text("keep-alive"))
}

pub async fn stream_no_id(State(state): State<Arc<AppState>>, caller: Caller, Json(req): Json<InvokeRequest>) -> Result<impl IntoResponse, ApiError> {
    let agent_id = req.agent_id.clone().ok_or_else(|| ApiError(WardenError::BadRequest("agent_id required".into())))?;
    let stream = stream_invocation(state, caller, agent_id, req).await;
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(30)).text("keep-alive")))
}
