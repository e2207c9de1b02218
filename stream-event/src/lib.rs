//! Trace event wire protocol (spec §3, §4.H): one tagged event per LLM/tool/loop
//! transition, plus SSE line framing. No HTTP dependency — callers feed events
//! and consume `event: <kind>\ndata: <json>\n\n` lines (or the envelope's JSON value
//! directly for a non-streaming response body).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminant for [`TraceEvent`]. Covers both per-invocation trace events and the
/// process-global bus events (`ContainerStatus`, `ConfigChanged`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    AgentStart,
    InputPrompt,
    LlmStart,
    LlmToken,
    LlmEnd,
    ToolCall,
    ToolResult,
    NodeStart,
    NodeEnd,
    Interrupt,
    AgentEnd,
    Done,
    Error,
    /// Process-global: a sandbox's Docker container changed lifecycle state.
    ContainerStatus,
    /// Process-global: template or instance configuration changed.
    ConfigChanged,
}

impl TraceKind {
    /// The `event:` line value used in SSE framing (same as the serde tag).
    pub fn as_sse_name(&self) -> &'static str {
        match self {
            TraceKind::AgentStart => "agent_start",
            TraceKind::InputPrompt => "input_prompt",
            TraceKind::LlmStart => "llm_start",
            TraceKind::LlmToken => "llm_token",
            TraceKind::LlmEnd => "llm_end",
            TraceKind::ToolCall => "tool_call",
            TraceKind::ToolResult => "tool_result",
            TraceKind::NodeStart => "node_start",
            TraceKind::NodeEnd => "node_end",
            TraceKind::Interrupt => "interrupt",
            TraceKind::AgentEnd => "agent_end",
            TraceKind::Done => "done",
            TraceKind::Error => "error",
            TraceKind::ContainerStatus => "container_status",
            TraceKind::ConfigChanged => "config_changed",
        }
    }

    /// True for the three kinds that may legally terminate an invocation's SSE stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TraceKind::Done | TraceKind::Error | TraceKind::Interrupt)
    }
}

/// One event in a [`Trace`]: `{kind, timestamp_ms, duration_ms?, run_id?, payload}` (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceEvent {
    pub kind: TraceKind,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub payload: Value,
}

impl TraceEvent {
    /// Builds an event stamped with the current wall-clock time.
    pub fn now(kind: TraceKind, run_id: Option<String>, payload: Value) -> Self {
        Self {
            kind,
            timestamp_ms: current_millis(),
            duration_ms: None,
            run_id,
            payload,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Renders this event as one SSE frame: `event: <kind>\ndata: <json>\n\n`.
    /// Returns `Err` only if the payload fails to serialize (it is already a `Value`,
    /// so this only happens for non-finite floats smuggled into the payload).
    pub fn to_sse_frame(&self) -> Result<String, serde_json::Error> {
        let data = serde_json::to_string(self)?;
        Ok(format!("event: {}\ndata: {}\n\n", self.kind.as_sse_name(), data))
    }
}

fn current_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A keep-alive SSE comment line, sent every 30s on idle streams to defeat proxy
/// idle-close timeouts (spec §4.H). Comments start with `:` and carry no event.
pub const SSE_KEEPALIVE_LINE: &str = ": keep-alive\n\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frame_has_event_and_data_lines() {
        let ev = TraceEvent::now(TraceKind::LlmToken, Some("run-1".into()), serde_json::json!({"delta":"hi"}));
        let frame = ev.to_sse_frame().unwrap();
        assert!(frame.starts_with("event: llm_token\ndata: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"delta\":\"hi\""));
    }

    #[test]
    fn terminal_kinds_are_done_error_interrupt_only() {
        assert!(TraceKind::Done.is_terminal());
        assert!(TraceKind::Error.is_terminal());
        assert!(TraceKind::Interrupt.is_terminal());
        assert!(!TraceKind::LlmToken.is_terminal());
        assert!(!TraceKind::ToolCall.is_terminal());
    }

    #[test]
    fn duration_is_omitted_when_unset() {
        let ev = TraceEvent::now(TraceKind::AgentStart, None, serde_json::json!({}));
        let v = serde_json::to_value(&ev).unwrap();
        assert!(v.get("duration_ms").is_none());
        assert!(v.get("run_id").is_none());
    }
}
