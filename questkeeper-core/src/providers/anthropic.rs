// questkeeper-core/src/providers/anthropic.rs

//! Anthropic Messages API adapter.
//!
//! Tool traffic rides inside content blocks: assistant `tool_use` blocks on
//! the way out, `tool_result` blocks inside user messages on the way back.

use super::{Provider, SseLineBuffer};
use crate::config::ModelConfig;
use crate::errors::ClientError;
use crate::models::chat::{ChatMessage, LlmResponse};
use crate::models::tools::{ToolCall, ToolDefinition};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub const ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    model_config: ModelConfig,
    http_client: Client,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(model_config: ModelConfig, http_client: Client, api_key: String) -> Self {
        Self {
            model_config,
            http_client,
            api_key,
        }
    }

    pub fn get_endpoint(&self) -> String {
        self.model_config
            .endpoint
            .clone()
            .unwrap_or_else(|| ANTHROPIC_ENDPOINT.to_string())
    }

    pub fn build_payload(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        stream: bool,
    ) -> Value {
        // System prompt travels as a top-level field, not a message.
        let system = messages
            .iter()
            .find(|m| m.role == "system")
            .and_then(|m| m.content.clone());
        let conversation: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != "system")
            .map(wire_message)
            .collect();

        let mut payload = json!({
            "model": self.model_config.model_name,
            "messages": conversation,
            "max_tokens": MAX_TOKENS,
            "stream": stream,
        });

        if let Some(system) = system {
            payload["system"] = json!(system);
        }

        if !tools.is_empty() {
            let wire_tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema
                    })
                })
                .collect();
            payload["tools"] = json!(wire_tools);
        }

        if let Some(params) = &self.model_config.parameters {
            if let Some(temperature) = params.get("temperature").and_then(|t| t.as_float()) {
                payload["temperature"] = json!(temperature);
            }
        }

        payload
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, ClientError> {
        let response = self
            .http_client
            .post(self.get_endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(payload)
            .send()
            .await
            .map_err(|e| ClientError::Transport {
                provider: "anthropic".to_string(),
                source: e.into(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                provider: "anthropic".to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    pub fn parse_response(&self, response_body: &str) -> Result<LlmResponse, ClientError> {
        let raw: Value = serde_json::from_str(response_body)
            .map_err(|e| ClientError::Parse(format!("anthropic response was not JSON: {}", e)))?;

        let blocks = raw.get("content").and_then(Value::as_array).ok_or_else(|| {
            ClientError::Parse(format!(
                "anthropic response had no content blocks: {}",
                response_body
            ))
        })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                    let name = match block.get("name").and_then(Value::as_str) {
                        Some(n) => n,
                        None => continue,
                    };
                    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    tool_calls.push(ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments: input,
                    });
                }
                _ => {}
            }
        }

        Ok(LlmResponse {
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls,
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn get_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, ClientError> {
        let payload = self.build_payload(messages, tools, false);
        debug!(model = %self.model_config.model_name, num_messages = messages.len(), "Requesting completion");
        let response = self.post(&payload).await?;
        let body = response.text().await.map_err(|e| ClientError::Transport {
            provider: "anthropic".to_string(),
            source: e.into(),
        })?;
        self.parse_response(&body)
    }

    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        chunks: mpsc::UnboundedSender<String>,
    ) -> Result<LlmResponse, ClientError> {
        let payload = self.build_payload(messages, tools, true);
        trace!(model = %self.model_config.model_name, "Opening message stream");
        let response = self.post(&payload).await?;

        let mut body = response.bytes_stream();
        let mut lines = SseLineBuffer::new();
        let mut accumulator = AnthropicStreamAccumulator::new();

        'receive: while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ClientError::Transport {
                provider: "anthropic".to_string(),
                source: e.into(),
            })?;
            for data in lines.push(&String::from_utf8_lossy(&chunk)) {
                if data == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<Value>(&data) {
                    Ok(event) => {
                        if let Some(text) = accumulator.ingest(&event) {
                            let _ = chunks.send(text);
                        }
                        if accumulator.is_finished() {
                            break 'receive;
                        }
                    }
                    Err(e) => warn!(error = %e, line = %data, "Failed to parse SSE event"),
                }
            }
        }

        Ok(accumulator.finish())
    }
}

fn wire_message(m: &ChatMessage) -> Value {
    if m.role == "tool" {
        return json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": m.tool_call_id,
                "content": m.content
            }]
        });
    }
    if m.role == "assistant" {
        if let Some(calls) = &m.tool_calls {
            let mut blocks = Vec::new();
            if let Some(content) = &m.content {
                if !content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": content }));
                }
            }
            for call in calls {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.arguments
                }));
            }
            return json!({ "role": "assistant", "content": blocks });
        }
    }
    json!({ "role": m.role, "content": m.content })
}

/// Accumulates one streamed message: text deltas stream out, `tool_use`
/// blocks build up from `input_json_delta` fragments keyed by block index.
#[derive(Default)]
pub(crate) struct AnthropicStreamAccumulator {
    text: String,
    open: HashMap<u64, PartialBlock>,
    completed: Vec<ToolCall>,
    finished: bool,
}

struct PartialBlock {
    id: String,
    name: String,
    arguments: String,
}

impl AnthropicStreamAccumulator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Ingests one SSE event, returning any text delta to surface.
    pub(crate) fn ingest(&mut self, event: &Value) -> Option<String> {
        match event.get("type").and_then(Value::as_str)? {
            "content_block_start" => {
                let block = event.get("content_block")?;
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                    self.open.insert(
                        index,
                        PartialBlock {
                            id: block
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            name: block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            arguments: String::new(),
                        },
                    );
                }
                None
            }
            "content_block_delta" => {
                let delta = event.get("delta")?;
                match delta.get("type").and_then(Value::as_str)? {
                    "text_delta" => {
                        let text = delta.get("text").and_then(Value::as_str)?;
                        self.text.push_str(text);
                        Some(text.to_string())
                    }
                    "input_json_delta" => {
                        let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                        if let Some(block) = self.open.get_mut(&index) {
                            if let Some(partial) =
                                delta.get("partial_json").and_then(Value::as_str)
                            {
                                block.arguments.push_str(partial);
                            }
                        }
                        None
                    }
                    _ => None,
                }
            }
            "content_block_stop" => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(block) = self.open.remove(&index) {
                    // No deltas at all means a no-argument tool.
                    let arguments = if block.arguments.trim().is_empty() {
                        json!({})
                    } else {
                        match serde_json::from_str(&block.arguments) {
                            Ok(value) => value,
                            Err(e) => {
                                warn!(
                                    tool_name = %block.name,
                                    error = %e,
                                    accumulated = %block.arguments,
                                    "Dropping tool call with malformed streamed input"
                                );
                                return None;
                            }
                        }
                    };
                    self.completed.push(ToolCall {
                        id: block.id,
                        name: block.name,
                        arguments,
                    });
                }
                None
            }
            "message_stop" => {
                self.finished = true;
                None
            }
            // ping, message_start, message_delta
            _ => None,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn finish(self) -> LlmResponse {
        LlmResponse {
            content: if self.text.is_empty() {
                None
            } else {
                Some(self.text)
            },
            tool_calls: self.completed,
        }
    }
}
