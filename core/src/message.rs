//! Message model (spec §3, §4.A): tagged-variant chat messages plus serialization
//! to each backend's wire format.
//!
//! Invariants checked by [`validate_thread`]:
//! (i) the first message in a thread is `System` or `User`;
//! (ii) every `Tool` message's `tool_call_id` matches an earlier `Assistant`
//!      message's `ToolCallRequest::id`;
//! (iii) a thread never contains two consecutive `Tool` messages for the same
//!       `tool_call_id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WardenError;

/// A tool call the assistant asked to run: `{id, name, args}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Content of a `tool` message: a plain string or a JSON value (spec §3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolContent {
    Text(String),
    Json(Value),
}

impl ToolContent {
    pub fn as_text(&self) -> String {
        match self {
            ToolContent::Text(s) => s.clone(),
            ToolContent::Json(v) => v.to_string(),
        }
    }
}

impl From<String> for ToolContent {
    fn from(s: String) -> Self {
        ToolContent::Text(s)
    }
}

impl From<&str> for ToolContent {
    fn from(s: &str) -> Self {
        ToolContent::Text(s.to_string())
    }
}

impl From<Value> for ToolContent {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) => ToolContent::Text(s),
            other => ToolContent::Json(other),
        }
    }
}

/// One message in a thread. Tagged by role; see module docs for thread invariants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        tool_call_id: String,
        name: String,
        content: ToolContent,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System { content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User { content: content.into() }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Message::Assistant {
            content: content.into(),
            tool_calls,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, name: impl Into<String>, content: impl Into<ToolContent>) -> Self {
        Message::Tool {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Message::System { .. } => "system",
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
            Message::Tool { .. } => "tool",
        }
    }

    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        match self {
            Message::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// Rough token estimate (chars / 4) used by the context-window summarizer middleware.
    pub fn estimate_tokens(&self) -> usize {
        let text_len = match self {
            Message::System { content } | Message::User { content } => content.len(),
            Message::Assistant { content, tool_calls } => {
                content.len() + tool_calls.iter().map(|tc| tc.name.len() + tc.args.to_string().len()).sum::<usize>()
            }
            Message::Tool { content, .. } => content.as_text().len(),
        };
        text_len / 4 + 1
    }
}

/// Target wire dialect for [`Message::to_backend_format`] (spec §4.A).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    OpenAiChat,
    AnthropicMessages,
}

impl Message {
    /// Serializes this message into the JSON shape the target dialect expects.
    ///
    /// - `openai_chat`: assistant tool calls become a `tool_calls` array; tool
    ///   messages use `role: "tool"` with `tool_call_id`.
    /// - `anthropic_messages`: system messages are not emitted here (callers lift
    ///   the system prompt to the top-level `system` field separately, see
    ///   [`system_and_rest`]); assistant tool calls become `tool_use` content
    ///   blocks; tool messages become `role: "user"` with a `tool_result` block.
    pub fn to_backend_format(&self, dialect: Dialect) -> Value {
        match (dialect, self) {
            (Dialect::OpenAiChat, Message::System { content }) => {
                serde_json::json!({"role": "system", "content": content})
            }
            (Dialect::OpenAiChat, Message::User { content }) => {
                serde_json::json!({"role": "user", "content": content})
            }
            (Dialect::OpenAiChat, Message::Assistant { content, tool_calls }) => {
                let mut obj = serde_json::json!({"role": "assistant", "content": content});
                if !tool_calls.is_empty() {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {"name": tc.name, "arguments": tc.args.to_string()},
                            })
                        })
                        .collect();
                    obj["tool_calls"] = Value::Array(calls);
                }
                obj
            }
            (Dialect::OpenAiChat, Message::Tool { tool_call_id, name, content }) => {
                serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "name": name,
                    "content": content.as_text(),
                })
            }
            (Dialect::AnthropicMessages, Message::System { content }) => {
                // Lifted to top-level `system`; still representable standalone for round-trip tests.
                serde_json::json!({"role": "system", "content": content})
            }
            (Dialect::AnthropicMessages, Message::User { content }) => {
                serde_json::json!({"role": "user", "content": content})
            }
            (Dialect::AnthropicMessages, Message::Assistant { content, tool_calls }) => {
                let mut blocks: Vec<Value> = Vec::new();
                if !content.is_empty() {
                    blocks.push(serde_json::json!({"type": "text", "text": content}));
                }
                for tc in tool_calls {
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": tc.args,
                    }));
                }
                serde_json::json!({"role": "assistant", "content": blocks})
            }
            (Dialect::AnthropicMessages, Message::Tool { tool_call_id, content, .. }) => {
                serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": content.as_text(),
                    }],
                })
            }
        }
    }

    /// Parses a single wire-format message back into [`Message`] (inverse of
    /// [`to_backend_format`]). Returns `FormatMismatch` when the shape is neither
    /// recognizable text nor a known tool-call/tool-result shape.
    pub fn from_backend_format(value: &Value, dialect: Dialect) -> Result<Self, WardenError> {
        let role = value
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| WardenError::FormatMismatch("missing role".into()))?;

        match dialect {
            Dialect::OpenAiChat => match role {
                "system" => Ok(Message::system(text_field(value)?)),
                "user" => Ok(Message::user(text_field(value)?)),
                "assistant" => {
                    let content = value.get("content").and_then(Value::as_str).unwrap_or("").to_string();
                    let tool_calls = value
                        .get("tool_calls")
                        .and_then(Value::as_array)
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|tc| {
                                    let id = tc.get("id")?.as_str()?.to_string();
                                    let func = tc.get("function")?;
                                    let name = func.get("name")?.as_str()?.to_string();
                                    let args_str = func.get("arguments")?.as_str()?;
                                    let args = serde_json::from_str(args_str).unwrap_or(Value::String(args_str.to_string()));
                                    Some(ToolCallRequest { id, name, args })
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    Ok(Message::assistant(content, tool_calls))
                }
                "tool" => {
                    let tool_call_id = value
                        .get("tool_call_id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| WardenError::FormatMismatch("tool message missing tool_call_id".into()))?
                        .to_string();
                    let name = value.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                    let content = value.get("content").and_then(Value::as_str).unwrap_or("").to_string();
                    Ok(Message::tool(tool_call_id, name, content))
                }
                other => Err(WardenError::FormatMismatch(format!("unrecognized role: {other}"))),
            },
            Dialect::AnthropicMessages => match role {
                "system" => Ok(Message::system(text_field(value)?)),
                "user" => {
                    if let Some(blocks) = value.get("content").and_then(Value::as_array) {
                        if let Some(tr) = blocks.iter().find(|b| b.get("type").and_then(Value::as_str) == Some("tool_result")) {
                            let tool_call_id = tr
                                .get("tool_use_id")
                                .and_then(Value::as_str)
                                .ok_or_else(|| WardenError::FormatMismatch("tool_result missing tool_use_id".into()))?
                                .to_string();
                            let content = tr.get("content").and_then(Value::as_str).unwrap_or("").to_string();
                            return Ok(Message::tool(tool_call_id, "", content));
                        }
                    }
                    Ok(Message::user(text_field(value)?))
                }
                "assistant" => {
                    let blocks = value
                        .get("content")
                        .and_then(Value::as_array)
                        .ok_or_else(|| WardenError::FormatMismatch("assistant content must be a block array".into()))?;
                    let mut text = String::new();
                    let mut tool_calls = Vec::new();
                    for block in blocks {
                        match block.get("type").and_then(Value::as_str) {
                            Some("text") => {
                                text.push_str(block.get("text").and_then(Value::as_str).unwrap_or(""));
                            }
                            Some("tool_use") => {
                                let id = block.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                                let name = block.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                                let args = block.get("input").cloned().unwrap_or(Value::Null);
                                tool_calls.push(ToolCallRequest { id, name, args });
                            }
                            _ => {}
                        }
                    }
                    Ok(Message::assistant(text, tool_calls))
                }
                other => Err(WardenError::FormatMismatch(format!("unrecognized role: {other}"))),
            },
        }
    }
}

fn text_field(value: &Value) -> Result<String, WardenError> {
    value
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| WardenError::FormatMismatch("missing string content".into()))
}

/// Validates the thread-integrity invariants (spec §8).
pub fn validate_thread(messages: &[Message]) -> Result<(), WardenError> {
    if let Some(first) = messages.first() {
        if !matches!(first, Message::System { .. } | Message::User { .. }) {
            return Err(WardenError::BadRequest(
                "first message in a thread must be system or user".into(),
            ));
        }
    }

    let mut known_call_ids: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let mut last_tool_call_id: Option<&str> = None;
    for msg in messages {
        match msg {
            Message::Assistant { tool_calls, .. } => {
                for tc in tool_calls {
                    known_call_ids.insert(&tc.id);
                }
                last_tool_call_id = None;
            }
            Message::Tool { tool_call_id, .. } => {
                if !known_call_ids.contains(tool_call_id.as_str()) {
                    return Err(WardenError::BadRequest(format!(
                        "tool message references unknown tool_call_id: {tool_call_id}"
                    )));
                }
                if last_tool_call_id == Some(tool_call_id.as_str()) {
                    return Err(WardenError::BadRequest(format!(
                        "consecutive tool messages for the same tool_call_id: {tool_call_id}"
                    )));
                }
                last_tool_call_id = Some(tool_call_id.as_str());
            }
            _ => {
                last_tool_call_id = None;
            }
        }
    }
    Ok(())
}
