//! Resolves a template's `model` string to a concrete [`LlmClient`] (spec
//! §4.C). Convention: a `claude`-prefixed model name goes to the Anthropic
//! Messages adapter, everything else to the OpenAI-chat adapter — both
//! pointed at `{OPENAI,ANTHROPIC}_BASE_URL`/`_API_KEY` env vars.

use std::sync::Arc;

use warden::llm::{anthropic::AnthropicMessagesClient, openai_chat::OpenAiChatClient, LlmClient};

pub fn default_resolver() -> Arc<dyn Fn(&str) -> Arc<dyn LlmClient> + Send + Sync> {
    Arc::new(|model: &str| -> Arc<dyn LlmClient> {
        if model.starts_with("claude") {
            let base_url = std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| "https://api.anthropic.com".to_string());
            let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
            Arc::new(AnthropicMessagesClient::new(base_url, api_key))
        } else {
            let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
            let api_key = std::env::var("OPENAI_API_KEY").ok();
            Arc::new(OpenAiChatClient::new(base_url, api_key))
        }
    })
}
