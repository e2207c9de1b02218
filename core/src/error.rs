//! Crate-wide error type (spec §7).
//!
//! `Interrupted` is deliberately not a variant here — an interrupt is a normal
//! outcome of the agent loop (see [`crate::agentloop::LoopOutcome`]), not a failure.

use thiserror::Error;

/// Errors surfaced across the runtime: template/instance lookup, the agent loop,
/// LLM adapters, sandbox backends, and the tool registry.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("thread busy: an invocation is already running on this thread")]
    ThreadBusy,

    #[error("tool forbidden: {0}")]
    ToolForbidden(String),

    #[error("llm error (status {status}): {body}")]
    LlmError { status: u16, body: String },

    #[error("backend error: {0}")]
    BackendError(String),

    #[error("agent loop hit its iteration cap without terminating")]
    IterationCap,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("format mismatch: {0}")]
    FormatMismatch(String),
}

impl WardenError {
    /// User-visible `{error, detail?}` JSON body (spec §7).
    pub fn to_response_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.to_string(),
            "detail": self.detail(),
        })
    }

    fn detail(&self) -> Option<String> {
        match self {
            WardenError::LlmError { body, .. } => Some(body.clone()),
            _ => None,
        }
    }
}
