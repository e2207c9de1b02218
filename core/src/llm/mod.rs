//! Backend-agnostic LLM adapter (spec §4.C).
//!
//! `LlmClient` exposes `invoke`/`stream` with template-method delegation: an
//! implementation that only provides `invoke` gets `stream` as a single
//! delta-then-done sequence wrapping it, and vice versa. A sentinel return
//! breaks the recursion if a type provides neither (spec §9 redesign note),
//! matching the teacher's `invoke`/`invoke_stream` default-delegation shape
//! in `loom/src/llm/mod.rs`.

pub mod anthropic;
pub mod gateway;
pub mod mock;
pub mod openai_chat;
pub mod proxy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::WardenError;
use crate::message::Message;
use crate::tools::ToolSpec;

pub use mock::MockLlm;

/// Controls whether the model may choose, must avoid, or must use a tool (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceMode {
    #[default]
    Auto,
    None,
    Required,
}

impl std::str::FromStr for ToolChoiceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "none" => Ok(Self::None),
            "required" => Ok(Self::Required),
            other => Err(format!("unknown tool_choice: {other} (use auto, none, or required)")),
        }
    }
}

/// `{model, messages, system_prompt?, tools?, tool_choice?, max_tokens?, temperature?, stream}` (spec §3).
#[derive(Clone, Debug)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoiceMode,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stream: bool,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            system_prompt: None,
            tools: Vec::new(),
            tool_choice: ToolChoiceMode::default(),
            max_tokens: None,
            temperature: None,
            stream: false,
        }
    }
}

/// `{content, tool_calls}` (spec §3).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<crate::message::ToolCallRequest>,
}

/// One increment of a streamed response: a text delta, a tool-call fragment, or
/// the terminating marker (spec §4.C: "lazy sequence of {delta, tool_call?, done}
/// ending with exactly one done=true chunk").
#[derive(Clone, Debug, Default)]
pub struct LlmStreamChunk {
    pub delta: String,
    pub tool_call: Option<crate::message::ToolCallRequest>,
    pub done: bool,
}

impl LlmStreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self { delta: text.into(), tool_call: None, done: false }
    }

    pub fn done_marker() -> Self {
        Self { delta: String::new(), tool_call: None, done: true }
    }
}

/// Sentinel error surfaced when a client provides neither native method below.
fn unimplemented_delegation() -> WardenError {
    WardenError::BackendError(
        "LlmClient provides neither invoke_native nor stream_native".into(),
    )
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Non-streaming backend hook. `None` is the explicit "not implemented"
    /// sentinel (spec §9): a client that only speaks streaming leaves this as
    /// the default and implements [`stream_native`](Self::stream_native) instead.
    async fn invoke_native(&self, _request: &LlmRequest) -> Option<Result<LlmResponse, WardenError>> {
        None
    }

    /// Streaming backend hook; same sentinel convention as [`invoke_native`](Self::invoke_native).
    async fn stream_native(
        &self,
        _request: &LlmRequest,
    ) -> Option<Result<mpsc::Receiver<LlmStreamChunk>, WardenError>> {
        None
    }

    /// Single-call API. Calls [`invoke_native`](Self::invoke_native) if the
    /// client provides it; otherwise drains [`stream_native`](Self::stream_native)
    /// and accumulates. Fails with [`unimplemented_delegation`] only if a client
    /// overrides neither hook — this is the recursion guard, since neither
    /// `invoke` nor `stream` ever calls the other directly.
    async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse, WardenError> {
        if let Some(result) = self.invoke_native(request).await {
            return result;
        }
        if let Some(stream_result) = self.stream_native(request).await {
            let mut rx = stream_result?;
            let mut content = String::new();
            let mut tool_calls = Vec::new();
            while let Some(chunk) = rx.recv().await {
                content.push_str(&chunk.delta);
                if let Some(tc) = chunk.tool_call {
                    tool_calls.push(tc);
                }
                if chunk.done {
                    break;
                }
            }
            return Ok(LlmResponse { content, tool_calls });
        }
        Err(unimplemented_delegation())
    }

    /// Streaming API: returns a channel of chunks ending with exactly one
    /// `done: true` chunk. Calls [`stream_native`](Self::stream_native) if the
    /// client provides it; otherwise wraps [`invoke_native`](Self::invoke_native)'s
    /// result as a single delta followed by `done`.
    async fn stream(&self, request: &LlmRequest) -> Result<mpsc::Receiver<LlmStreamChunk>, WardenError> {
        if let Some(result) = self.stream_native(request).await {
            return result;
        }
        if let Some(invoke_result) = self.invoke_native(request).await {
            let response = invoke_result?;
            let (tx, rx) = mpsc::channel(8);
            if !response.content.is_empty() {
                let _ = tx.send(LlmStreamChunk::delta(response.content)).await;
            }
            for tc in response.tool_calls {
                let _ = tx
                    .send(LlmStreamChunk { delta: String::new(), tool_call: Some(tc), done: false })
                    .await;
            }
            let _ = tx.send(LlmStreamChunk::done_marker()).await;
            return Ok(rx);
        }
        Err(unimplemented_delegation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCallRequest;

    struct InvokeOnlyLlm {
        content: String,
    }

    #[async_trait]
    impl LlmClient for InvokeOnlyLlm {
        async fn invoke_native(&self, _request: &LlmRequest) -> Option<Result<LlmResponse, WardenError>> {
            Some(Ok(LlmResponse { content: self.content.clone(), tool_calls: vec![] }))
        }
    }

    struct StreamOnlyLlm;

    #[async_trait]
    impl LlmClient for StreamOnlyLlm {
        async fn stream_native(
            &self,
            _request: &LlmRequest,
        ) -> Option<Result<mpsc::Receiver<LlmStreamChunk>, WardenError>> {
            let (tx, rx) = mpsc::channel(4);
            tx.send(LlmStreamChunk::delta("hi")).await.unwrap();
            tx.send(LlmStreamChunk {
                delta: String::new(),
                tool_call: Some(ToolCallRequest { id: "t1".into(), name: "x".into(), args: serde_json::json!({}) }),
                done: false,
            })
            .await
            .unwrap();
            tx.send(LlmStreamChunk::done_marker()).await.unwrap();
            Some(Ok(rx))
        }
    }

    struct NeitherLlm;

    #[async_trait]
    impl LlmClient for NeitherLlm {}

    fn req() -> LlmRequest {
        LlmRequest::new("test-model", vec![Message::user("hi")])
    }

    #[tokio::test]
    async fn stream_default_wraps_invoke_as_single_delta_then_done() {
        let llm = InvokeOnlyLlm { content: "hello".into() };
        let mut rx = llm.stream(&req()).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.delta, "hello");
        assert!(!first.done);
        let last = rx.recv().await.unwrap();
        assert!(last.done);
    }

    #[tokio::test]
    async fn invoke_default_drains_stream_and_accumulates() {
        let llm = StreamOnlyLlm;
        let resp = llm.invoke(&req()).await.unwrap();
        assert_eq!(resp.content, "hi");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "x");
    }

    #[tokio::test]
    async fn neither_invoke_nor_stream_overridden_fails_with_recursion_guard() {
        let llm = NeitherLlm;
        let err = llm.invoke(&req()).await.unwrap_err();
        assert!(matches!(err, WardenError::BackendError(_)));
    }

    #[test]
    fn tool_choice_mode_parses_known_values() {
        assert_eq!("auto".parse::<ToolChoiceMode>().unwrap(), ToolChoiceMode::Auto);
        assert_eq!("required".parse::<ToolChoiceMode>().unwrap(), ToolChoiceMode::Required);
        assert!("bogus".parse::<ToolChoiceMode>().is_err());
    }
}
