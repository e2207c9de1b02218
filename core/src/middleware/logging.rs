//! Tool-call and LLM-call loggers (spec §4.F), grounded on the teacher's
//! `LoggingNodeMiddleware` (`graphweave/src/graph/logging_middleware.rs`):
//! log enter/exit around the wrapped call. Uses `tracing` rather than
//! `eprintln!`, matching the rest of this crate's structured logging.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::WardenError;
use crate::llm::{LlmRequest, LlmResponse};
use crate::tools::ToolCallContext;

use super::{LlmMiddleware, LlmNext, ToolCallInput, ToolMiddleware, ToolNext};

/// Logs model name and timing around each LLM call.
pub struct LoggingLlmMiddleware;

#[async_trait]
impl LlmMiddleware for LoggingLlmMiddleware {
    async fn around(&self, request: LlmRequest, next: LlmNext<'_>) -> Result<LlmResponse, WardenError> {
        let model = request.model.clone();
        let started = Instant::now();
        info!(model = %model, message_count = request.messages.len(), "llm call start");
        let result = next(request).await;
        match &result {
            Ok(response) => {
                info!(model = %model, elapsed_ms = started.elapsed().as_millis() as u64, tool_calls = response.tool_calls.len(), "llm call end");
            }
            Err(e) => {
                warn!(model = %model, elapsed_ms = started.elapsed().as_millis() as u64, error = %e, "llm call failed");
            }
        }
        result
    }
}

/// Logs tool name and timing around each tool dispatch.
pub struct LoggingToolMiddleware;

#[async_trait]
impl ToolMiddleware for LoggingToolMiddleware {
    async fn around(&self, ctx: &ToolCallContext, input: ToolCallInput, next: ToolNext<'_>) -> Result<Value, WardenError> {
        let name = input.name.clone();
        let started = Instant::now();
        info!(username = %ctx.username, thread_id = %ctx.thread_id, tool = %name, "tool call start");
        let result = next(input).await;
        match &result {
            Ok(_) => info!(tool = %name, elapsed_ms = started.elapsed().as_millis() as u64, "tool call end"),
            Err(e) => warn!(tool = %name, elapsed_ms = started.elapsed().as_millis() as u64, error = %e, "tool call failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::message::Message;
    use crate::middleware::LlmPipeline;
    use crate::sandbox::LocalBackend;
    use crate::tools::ToolCallable;
    use std::sync::Arc;

    struct EchoTool;

    #[async_trait]
    impl ToolCallable for EchoTool {
        async fn call(&self, _ctx: &ToolCallContext, args: Value) -> Result<Value, WardenError> {
            Ok(args)
        }
    }

    #[tokio::test]
    async fn logging_llm_middleware_passes_through_the_response() {
        let llm = MockLlm::fixed("passed through");
        let pipeline = LlmPipeline::new(vec![Arc::new(LoggingLlmMiddleware)]);
        let resp = pipeline.run(LlmRequest::new("m", vec![Message::user("hi")]), &llm).await.unwrap();
        assert_eq!(resp.content, "passed through");
    }

    #[tokio::test]
    async fn logging_tool_middleware_passes_through_the_result() {
        let pipeline = super::super::ToolPipeline::new(vec![Arc::new(LoggingToolMiddleware)]);
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn crate::sandbox::SandboxBackend> = Arc::new(LocalBackend::new(dir.path(), "alice").await.unwrap());
        let ctx = ToolCallContext { username: "alice".into(), thread_id: "t1".into(), backend };
        let result = pipeline.run(&ctx, "echo", serde_json::json!({"ok": true}), &EchoTool).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }
}
