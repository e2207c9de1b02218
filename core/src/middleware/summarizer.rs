//! Conversation summarizer middleware (spec §4.F): when the thread's
//! estimated token count exceeds the model's context window, the middle
//! third is collapsed into a single synthetic assistant message before the
//! request reaches the backend. Threshold is a single `usize` field, trimmed
//! down from the teacher's `ModelSpec` (`loom/src/model_spec/spec.rs`), which
//! this crate has no use for beyond the one context-limit number.

use async_trait::async_trait;
use tracing::info;

use crate::error::WardenError;
use crate::llm::{LlmRequest, LlmResponse};
use crate::message::Message;

use super::{LlmMiddleware, LlmNext};

/// Replaces `messages[third..len-third]` with one summary message, keeping
/// the opening third (system prompt, early grounding) and closing third
/// (recent turns) intact. Thread invariants (tool_call_id references) are not
/// preserved across the cut — the same tradeoff the estimate-then-collapse
/// approach makes everywhere it's used.
fn summarize_middle_third(messages: Vec<Message>) -> Vec<Message> {
    let len = messages.len();
    let third = len / 3;
    let start = third;
    let end = len - third;
    if len < 3 || start >= end {
        return messages;
    }

    let mut out = Vec::with_capacity(len - (end - start) + 1);
    out.extend_from_slice(&messages[..start]);
    out.push(Message::assistant(format!("[{} earlier messages summarized]", end - start), vec![]));
    out.extend_from_slice(&messages[end..]);
    out
}

/// Wraps the LLM call, collapsing the thread before it's sent whenever it's
/// estimated to exceed `context_window_tokens`.
pub struct SummarizerMiddleware {
    context_window_tokens: usize,
}

impl SummarizerMiddleware {
    pub fn new(context_window_tokens: usize) -> Self {
        Self { context_window_tokens }
    }
}

#[async_trait]
impl LlmMiddleware for SummarizerMiddleware {
    async fn around(&self, mut request: LlmRequest, next: LlmNext<'_>) -> Result<LlmResponse, WardenError> {
        let estimated: usize = request.messages.iter().map(Message::estimate_tokens).sum();
        if estimated > self.context_window_tokens {
            let before = request.messages.len();
            request.messages = summarize_middle_third(request.messages);
            info!(before, after = request.messages.len(), estimated, limit = self.context_window_tokens, "summarized thread over context window");
        }
        next(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::middleware::LlmPipeline;
    use std::sync::Arc;

    fn long_thread(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user("x".repeat(100) + &i.to_string())).collect()
    }

    #[test]
    fn leaves_short_threads_untouched() {
        let messages = long_thread(5);
        let out = summarize_middle_third(messages.clone());
        assert_eq!(out, messages);
    }

    #[test]
    fn collapses_the_middle_third_of_a_long_thread() {
        let messages = long_thread(9);
        let out = summarize_middle_third(messages);
        assert_eq!(out.len(), 3 + 1 + 3);
        assert!(matches!(out[3], Message::Assistant { .. }));
    }

    #[tokio::test]
    async fn middleware_forwards_to_the_next_stage_regardless_of_thread_length() {
        let llm = MockLlm::fixed("ok");
        let pipeline = LlmPipeline::new(vec![Arc::new(SummarizerMiddleware::new(10))]);
        let resp = pipeline.run(LlmRequest::new("m", long_thread(9)), &llm).await.unwrap();
        assert_eq!(resp.content, "ok");
    }
}
