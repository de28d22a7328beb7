//! Chat model backend (spec §4.9): the LLM call behind an agent's tool-call
//! loop. `ChatModel` is this project's analogue of the teacher's
//! `ModelClient` — one trait, swappable concrete backends, no coupling
//! between the agent pipeline and any particular wire format.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::AgentModelSettings;
use crate::error::EngineError;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// One increment of a model's response.
#[derive(Debug, Clone)]
pub enum ChatModelEvent {
    TextDelta(String),
    ToolCall { name: String, arguments: Value },
    Complete,
    Error(String),
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream_chat(
        &self,
        system_instructions: &str,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<ChatModelEvent>>;
}

/// Deterministic, network-free model used in tests, grounded in the
/// teacher's own test-double pattern for `ModelClient`. If the last user
/// message looks like an arithmetic request "in python", emits a single
/// `executeCode` tool call so the agent tool loop has something to drive;
/// otherwise just echoes.
pub struct MockChatModel;

#[async_trait]
impl ChatModel for MockChatModel {
    async fn stream_chat(
        &self,
        _system_instructions: &str,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<ChatModelEvent>> {
        let (tx, rx) = mpsc::channel(16);
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        tokio::spawn(async move {
            if let Some(code) = extract_code_request(&last_user) {
                let sent = tx
                    .send(ChatModelEvent::ToolCall {
                        name: "executeCode".to_string(),
                        arguments: serde_json::json!({ "code": code }),
                    })
                    .await;
                if sent.is_err() {
                    return;
                }
            } else {
                let sent = tx
                    .send(ChatModelEvent::TextDelta(format!("echo: {last_user}")))
                    .await;
                if sent.is_err() {
                    return;
                }
            }
            let _ = tx.send(ChatModelEvent::Complete).await;
        });
        Ok(rx)
    }
}

/// Pulls a trivial arithmetic expression out of a request like "Compute 2+2
/// in Python", wrapped in a `print(...)` so executing it produces visible
/// output the tool-call loop can forward back to the model.
fn extract_code_request(text: &str) -> Option<String> {
    if !text.to_ascii_lowercase().contains("python") {
        return None;
    }
    let expr: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '*' | '/'))
        .collect();
    if expr.is_empty() {
        None
    } else {
        Some(format!("print({expr})"))
    }
}

/// OpenAI-chat-completions-compatible client, matching the
/// `AGENT_MODEL_*` env vars (base URL, API key, model name, temperature).
/// Streams `POST {base_url}/chat/completions` with `"stream": true` and
/// parses newline-delimited `data: {...}` SSE frames by hand (the teacher's
/// `ollama::client`'s manual byte-buffer line-splitting, generalized from
/// the pull-progress format to OpenAI's delta/tool_call shape).
pub struct OpenAiChatModel {
    client: reqwest::Client,
    settings: AgentModelSettings,
}

impl OpenAiChatModel {
    pub fn new(settings: AgentModelSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }
}

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn stream_chat(
        &self,
        system_instructions: &str,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<ChatModelEvent>> {
        let mut wire_messages = Vec::with_capacity(messages.len() + 1);
        wire_messages.push(serde_json::json!({"role": "system", "content": system_instructions}));
        for message in messages {
            wire_messages.push(serde_json::json!({"role": message.role, "content": message.content}));
        }

        let mut request = serde_json::json!({
            "model": self.settings.model,
            "messages": wire_messages,
            "temperature": self.settings.temperature,
            "stream": true,
            "tools": [{
                "type": "function",
                "function": {
                    "name": "executeCode",
                    "description": "Execute code in the agent's attached kernel.",
                    "parameters": {
                        "type": "object",
                        "properties": {"code": {"type": "string"}},
                        "required": ["code"],
                    },
                },
            }],
        });
        if let Some(object) = request.as_object_mut() {
            object.insert("stream_options".to_string(), serde_json::json!({"include_usage": false}));
        }

        let url = format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'));
        let mut builder = self.client.post(url).json(&request);
        if let Some(api_key) = &self.settings.api_key {
            builder = builder.bearer_auth(api_key);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::EmbeddingProviderError(format!(
                "chat completions request failed: HTTP {status}: {body}"
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut buffer = bytes::BytesMut::new();
            let mut byte_stream = response.bytes_stream();
            let mut tool_calls: Vec<ToolCallAccumulator> = Vec::new();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(ChatModelEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line = buffer.split_to(pos + 1);
                    let Ok(text) = std::str::from_utf8(&line) else {
                        continue;
                    };
                    let text = text.trim();
                    let Some(payload) = text.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        flush_tool_calls(&tx, &mut tool_calls).await;
                        let _ = tx.send(ChatModelEvent::Complete).await;
                        return;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(payload) else {
                        continue;
                    };
                    handle_delta(&tx, &mut tool_calls, &value).await;
                }
            }
            flush_tool_calls(&tx, &mut tool_calls).await;
            let _ = tx.send(ChatModelEvent::Complete).await;
        });

        Ok(rx)
    }
}

async fn handle_delta(
    tx: &mpsc::Sender<ChatModelEvent>,
    tool_calls: &mut Vec<ToolCallAccumulator>,
    value: &Value,
) {
    let Some(choice) = value.get("choices").and_then(|c| c.get(0)) else {
        return;
    };
    let Some(delta) = choice.get("delta") else {
        return;
    };
    if let Some(content) = delta.get("content").and_then(|c| c.as_str())
        && !content.is_empty()
    {
        let _ = tx.send(ChatModelEvent::TextDelta(content.to_string())).await;
    }
    if let Some(deltas) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        for entry in deltas {
            let index = entry.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
            while tool_calls.len() <= index {
                tool_calls.push(ToolCallAccumulator::default());
            }
            let accumulator = &mut tool_calls[index];
            if let Some(id) = entry.get("id").and_then(|i| i.as_str()) {
                accumulator.id = id.to_string();
            }
            if let Some(function) = entry.get("function") {
                if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                    accumulator.name.push_str(name);
                }
                if let Some(arguments) = function.get("arguments").and_then(|a| a.as_str()) {
                    accumulator.arguments.push_str(arguments);
                }
            }
        }
    }
    if choice.get("finish_reason").and_then(|f| f.as_str()) == Some("tool_calls") {
        flush_tool_calls(tx, tool_calls).await;
    }
}

async fn flush_tool_calls(tx: &mpsc::Sender<ChatModelEvent>, tool_calls: &mut Vec<ToolCallAccumulator>) {
    for accumulator in tool_calls.drain(..) {
        if accumulator.name.is_empty() {
            continue;
        }
        let arguments = serde_json::from_str(&accumulator.arguments)
            .unwrap_or_else(|_| Value::String(accumulator.arguments.clone()));
        let _ = tx
            .send(ChatModelEvent::ToolCall {
                name: accumulator.name,
                arguments,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[tokio::test]
    async fn mock_model_emits_tool_call_for_python_request() {
        let model = MockChatModel;
        let mut rx = model
            .stream_chat("you are helpful", &[ChatMessage::new("user", "Compute 2+2 in Python")])
            .await
            .expect("stream");
        let first = rx.recv().await.expect("event");
        match first {
            ChatModelEvent::ToolCall { name, arguments } => {
                assert_eq!(name, "executeCode");
                assert!(arguments["code"].as_str().expect("code").contains("2+2"));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(ChatModelEvent::Complete)));
    }

    #[tokio::test]
    async fn mock_model_echoes_non_code_requests() {
        let model = MockChatModel;
        let mut rx = model
            .stream_chat("you are helpful", &[ChatMessage::new("user", "hello there")])
            .await
            .expect("stream");
        match rx.recv().await.expect("event") {
            ChatModelEvent::TextDelta(text) => assert_eq!(text, "echo: hello there"),
            other => panic!("expected text delta, got {other:?}"),
        }
    }
}
