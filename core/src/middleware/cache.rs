//! Response cache keyed by model+messages+tools hash (spec §4.F), grounded on
//! the teacher's `CachedResolver` (`loom/src/model_spec/cached.rs`):
//! `Arc<RwLock<HashMap<...>>>` checked before the inner call, populated after.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::WardenError;
use crate::llm::{LlmRequest, LlmResponse};

use super::{LlmMiddleware, LlmNext};

fn cache_key(request: &LlmRequest) -> String {
    let mut hasher = DefaultHasher::new();
    request.model.hash(&mut hasher);
    for message in &request.messages {
        serde_json::to_string(message).unwrap_or_default().hash(&mut hasher);
    }
    for tool in &request.tools {
        tool.name().hash(&mut hasher);
    }
    format!("{:?}", request.tool_choice).hash(&mut hasher);
    request.max_tokens.hash(&mut hasher);
    request.temperature.map(f32::to_bits).hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Caches `LlmResponse`s by content hash so repeated identical requests
/// (same model, same thread, same tool set) skip the backend entirely.
#[derive(Default)]
pub struct ResponseCacheMiddleware {
    store: Arc<RwLock<HashMap<String, LlmResponse>>>,
}

impl ResponseCacheMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn clear(&self) {
        self.store.write().await.clear();
    }
}

#[async_trait]
impl LlmMiddleware for ResponseCacheMiddleware {
    async fn around(&self, request: LlmRequest, next: LlmNext<'_>) -> Result<LlmResponse, WardenError> {
        let key = cache_key(&request);
        if let Some(cached) = self.store.read().await.get(&key).cloned() {
            return Ok(cached);
        }
        let response = next(request).await?;
        self.store.write().await.insert(key, response.clone());
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::message::Message;
    use crate::middleware::LlmPipeline;

    #[tokio::test]
    async fn identical_requests_hit_the_cache_and_skip_the_second_queued_response() {
        let llm = MockLlm::new(vec![
            LlmResponse { content: "first".into(), tool_calls: vec![] },
            LlmResponse { content: "second".into(), tool_calls: vec![] },
        ]);
        let pipeline = LlmPipeline::new(vec![Arc::new(ResponseCacheMiddleware::new())]);
        let req = LlmRequest::new("m", vec![Message::user("same question")]);

        let first = pipeline.run(req.clone(), &llm).await.unwrap();
        let second = pipeline.run(req, &llm).await.unwrap();

        assert_eq!(first.content, "first");
        assert_eq!(second.content, "first");
    }

    #[tokio::test]
    async fn differing_requests_each_invoke_the_backend() {
        let llm = MockLlm::new(vec![
            LlmResponse { content: "a".into(), tool_calls: vec![] },
            LlmResponse { content: "b".into(), tool_calls: vec![] },
        ]);
        let pipeline = LlmPipeline::new(vec![Arc::new(ResponseCacheMiddleware::new())]);

        let first = pipeline.run(LlmRequest::new("m", vec![Message::user("q1")]), &llm).await.unwrap();
        let second = pipeline.run(LlmRequest::new("m", vec![Message::user("q2")]), &llm).await.unwrap();

        assert_eq!(first.content, "a");
        assert_eq!(second.content, "b");
    }
}
