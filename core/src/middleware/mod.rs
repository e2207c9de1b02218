//! Composable wrappers around the LLM and tool-call invocations (spec §4.F).
//!
//! A middleware is `(request, next) -> response`, grounded on the teacher's
//! `NodeMiddleware::around_run` shape (`loom/src/graph/node_middleware.rs`):
//! an owned input, a boxed one-shot `next` continuation, and an owned output.
//! Two independent pipelines exist — one around `LlmClient::invoke`, one
//! around a single tool dispatch — composed outermost-first: the first name
//! in `AgentTemplate::middleware_names` wraps every other layer (spec §9
//! Open Question resolution).

pub mod cache;
pub mod logging;
pub mod summarizer;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::WardenError;
use crate::llm::{LlmClient, LlmRequest, LlmResponse};
use crate::tools::{ToolCallContext, ToolCallable};

pub use cache::ResponseCacheMiddleware;
pub use logging::{LoggingLlmMiddleware, LoggingToolMiddleware};
pub use summarizer::SummarizerMiddleware;

/// The remaining pipeline, as a one-shot continuation a middleware calls at
/// most once (teacher's `Box<dyn FnOnce(S) -> Pin<Box<dyn Future<...>>>>`).
pub type LlmNext<'a> = Box<dyn FnOnce(LlmRequest) -> BoxFuture<'a, Result<LlmResponse, WardenError>> + Send + 'a>;

#[async_trait]
pub trait LlmMiddleware: Send + Sync {
    async fn around(&self, request: LlmRequest, next: LlmNext<'_>) -> Result<LlmResponse, WardenError>;
}

/// An ordered, resolved chain of [`LlmMiddleware`], terminating in a real
/// [`LlmClient::invoke`] call.
pub struct LlmPipeline {
    middlewares: Vec<Arc<dyn LlmMiddleware>>,
}

impl LlmPipeline {
    pub fn new(middlewares: Vec<Arc<dyn LlmMiddleware>>) -> Self {
        Self { middlewares }
    }

    pub async fn run(&self, request: LlmRequest, llm: &dyn LlmClient) -> Result<LlmResponse, WardenError> {
        self.run_from(0, request, llm).await
    }

    fn run_from<'a>(&'a self, index: usize, request: LlmRequest, llm: &'a dyn LlmClient) -> BoxFuture<'a, Result<LlmResponse, WardenError>> {
        Box::pin(async move {
            match self.middlewares.get(index) {
                Some(mw) => {
                    let next: LlmNext = Box::new(move |req| self.run_from(index + 1, req, llm));
                    mw.around(request, next).await
                }
                None => llm.invoke(&request).await,
            }
        })
    }
}

/// One tool call's name and arguments, threaded through the tool pipeline.
#[derive(Clone, Debug)]
pub struct ToolCallInput {
    pub name: String,
    pub args: Value,
}

pub type ToolNext<'a> = Box<dyn FnOnce(ToolCallInput) -> BoxFuture<'a, Result<Value, WardenError>> + Send + 'a>;

#[async_trait]
pub trait ToolMiddleware: Send + Sync {
    async fn around(&self, ctx: &ToolCallContext, input: ToolCallInput, next: ToolNext<'_>) -> Result<Value, WardenError>;
}

/// An ordered, resolved chain of [`ToolMiddleware`], terminating in the actual
/// [`ToolCallable::call`].
pub struct ToolPipeline {
    middlewares: Vec<Arc<dyn ToolMiddleware>>,
}

impl ToolPipeline {
    pub fn new(middlewares: Vec<Arc<dyn ToolMiddleware>>) -> Self {
        Self { middlewares }
    }

    pub async fn run(&self, ctx: &ToolCallContext, name: impl Into<String>, args: Value, callable: &dyn ToolCallable) -> Result<Value, WardenError> {
        self.run_from(0, ctx, ToolCallInput { name: name.into(), args }, callable).await
    }

    fn run_from<'a>(
        &'a self,
        index: usize,
        ctx: &'a ToolCallContext,
        input: ToolCallInput,
        callable: &'a dyn ToolCallable,
    ) -> BoxFuture<'a, Result<Value, WardenError>> {
        Box::pin(async move {
            match self.middlewares.get(index) {
                Some(mw) => {
                    let next: ToolNext = Box::new(move |input| self.run_from(index + 1, ctx, input, callable));
                    mw.around(ctx, input, next).await
                }
                None => callable.call(ctx, input.args).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::sandbox::LocalBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTool;

    #[async_trait]
    impl ToolCallable for EchoTool {
        async fn call(&self, _ctx: &ToolCallContext, args: Value) -> Result<Value, WardenError> {
            Ok(args)
        }
    }

    #[tokio::test]
    async fn llm_pipeline_runs_middleware_outermost_first_then_terminal() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        struct Tagging(Arc<std::sync::Mutex<Vec<&'static str>>>, &'static str);
        #[async_trait]
        impl LlmMiddleware for Tagging {
            async fn around(&self, request: LlmRequest, next: LlmNext<'_>) -> Result<LlmResponse, WardenError> {
                self.0.lock().unwrap().push(self.1);
                next(request).await
            }
        }
        let pipeline = LlmPipeline::new(vec![
            Arc::new(Tagging(order.clone(), "outer")),
            Arc::new(Tagging(order.clone(), "inner")),
        ]);
        let llm = crate::llm::MockLlm::fixed("ok");
        let req = LlmRequest::new("m", vec![Message::user("hi")]);
        pipeline.run(req, &llm).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn tool_pipeline_reaches_terminal_callable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = ToolPipeline::new(vec![Arc::new(CountingLlmMiddlewareAdapter { calls: calls.clone() })]);
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn crate::sandbox::SandboxBackend> = Arc::new(LocalBackend::new(dir.path(), "alice").await.unwrap());
        let ctx = ToolCallContext { username: "alice".into(), thread_id: "t1".into(), backend };
        let result = pipeline.run(&ctx, "echo", serde_json::json!({"x": 1}), &EchoTool).await.unwrap();
        assert_eq!(result, serde_json::json!({"x": 1}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct CountingLlmMiddlewareAdapter {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolMiddleware for CountingLlmMiddlewareAdapter {
        async fn around(&self, ctx: &ToolCallContext, input: ToolCallInput, next: ToolNext<'_>) -> Result<Value, WardenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            next(input).await.map(|v| {
                let _ = ctx;
                v
            })
        }
    }
}
