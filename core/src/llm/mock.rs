//! Test double for [`LlmClient`] (spec §8 scenarios), grounded on the
//! teacher's `MockLlm`: a queue of canned responses, one per call.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::WardenError;

use super::{LlmClient, LlmRequest, LlmResponse};

/// Replays a fixed queue of responses, one per `invoke`/`stream` call, in
/// order. Panics (in test code only) if called more times than it has
/// responses queued — that indicates a test set up the wrong iteration count.
pub struct MockLlm {
    responses: Mutex<Vec<LlmResponse>>,
}

impl MockLlm {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self { responses: Mutex::new(responses) }
    }

    /// A single-response mock for the common "one assistant turn" case.
    pub fn fixed(content: impl Into<String>) -> Self {
        Self::new(vec![LlmResponse { content: content.into(), tool_calls: vec![] }])
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn invoke_native(&self, _request: &LlmRequest) -> Option<Result<LlmResponse, WardenError>> {
        let mut guard = self.responses.lock().await;
        if guard.is_empty() {
            return Some(Err(WardenError::BackendError("MockLlm: no more queued responses".into())));
        }
        Some(Ok(guard.remove(0)))
    }
}
