// questkeeper-core/src/providers/openai.rs

//! Chat-completions adapter, used for both OpenAI and OpenRouter.

use super::{Provider, SseLineBuffer};
use crate::config::ModelConfig;
use crate::errors::ClientError;
use crate::models::chat::{ChatMessage, LlmResponse};
use crate::models::tools::{ToolCall, ToolDefinition};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const OPENROUTER_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

pub struct OpenAiProvider {
    name: String,
    model_config: ModelConfig,
    http_client: Client,
    api_key: String,
}

impl OpenAiProvider {
    pub fn openai(model_config: ModelConfig, http_client: Client, api_key: String) -> Self {
        Self {
            name: "openai".to_string(),
            model_config,
            http_client,
            api_key,
        }
    }

    /// OpenRouter speaks the same schema on a different endpoint.
    pub fn openrouter(model_config: ModelConfig, http_client: Client, api_key: String) -> Self {
        Self {
            name: "openrouter".to_string(),
            model_config,
            http_client,
            api_key,
        }
    }

    pub fn get_endpoint(&self) -> String {
        if let Some(endpoint) = &self.model_config.endpoint {
            return endpoint.clone();
        }
        match self.name.as_str() {
            "openrouter" => OPENROUTER_ENDPOINT.to_string(),
            _ => OPENAI_ENDPOINT.to_string(),
        }
    }

    pub fn build_payload(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        stream: bool,
    ) -> Value {
        let mut payload = json!({
            "model": self.model_config.model_name,
            "messages": wire_messages(messages),
        });

        if !tools.is_empty() {
            let tools_with_type: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema
                        }
                    })
                })
                .collect();
            payload["tools"] = json!(tools_with_type);
        }

        if let Some(params) = &self.model_config.parameters {
            if let Some(temperature) = params.get("temperature").and_then(|t| t.as_float()) {
                payload["temperature"] = json!(temperature);
            }
        }

        if stream {
            payload["stream"] = json!(true);
        }

        payload
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, ClientError> {
        let mut request = self.http_client.post(self.get_endpoint()).json(payload);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        if self.name == "openrouter" {
            // Attribution headers OpenRouter asks clients to send.
            request = request
                .header("HTTP-Referer", "https://github.com/questkeeper")
                .header("X-Title", "QuestKeeper");
        }

        let response = request.send().await.map_err(|e| ClientError::Transport {
            provider: self.name.clone(),
            source: e.into(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                provider: self.name.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    pub fn parse_response(&self, response_body: &str) -> Result<LlmResponse, ClientError> {
        let raw: Value = serde_json::from_str(response_body).map_err(|e| {
            ClientError::Parse(format!("{} response was not JSON: {}", self.name, e))
        })?;

        let message = raw
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| {
                ClientError::Parse(format!(
                    "{} response had no choices: {}",
                    self.name, response_body
                ))
            })?;

        let content = message
            .get("content")
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        let mut tool_calls = Vec::new();
        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
                let function = match call.get("function") {
                    Some(f) => f,
                    None => continue,
                };
                let name = match function.get("name").and_then(Value::as_str) {
                    Some(n) => n,
                    None => continue,
                };
                let raw_args = function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}");
                let arguments = serde_json::from_str(raw_args).unwrap_or_else(|e| {
                    warn!(tool_name = %name, error = %e, "Tool call arguments were not valid JSON, substituting empty object");
                    json!({})
                });
                tool_calls.push(ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments,
                });
            }
        }

        Ok(LlmResponse {
            content,
            tool_calls,
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, ClientError> {
        let payload = self.build_payload(messages, tools, false);
        debug!(provider = %self.name, model = %self.model_config.model_name, num_messages = messages.len(), "Requesting completion");
        let response = self.post(&payload).await?;
        let body = response.text().await.map_err(|e| ClientError::Transport {
            provider: self.name.clone(),
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
        trace!(provider = %self.name, "Opening completion stream");
        let response = self.post(&payload).await?;

        let mut body = response.bytes_stream();
        let mut lines = SseLineBuffer::new();
        let mut accumulator = OpenAiStreamAccumulator::new();

        'receive: while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ClientError::Transport {
                provider: self.name.clone(),
                source: e.into(),
            })?;
            for data in lines.push(&String::from_utf8_lossy(&chunk)) {
                if data == "[DONE]" {
                    break 'receive;
                }
                match serde_json::from_str::<Value>(&data) {
                    Ok(event) => {
                        if let Some(text) = accumulator.ingest(&event) {
                            let _ = chunks.send(text);
                        }
                    }
                    Err(e) => warn!(error = %e, "Skipping undecodable stream event"),
                }
            }
        }

        Ok(accumulator.finish())
    }
}

fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut wire = json!({ "role": m.role });
            if let Some(content) = &m.content {
                wire["content"] = json!(content);
            }
            if let Some(calls) = &m.tool_calls {
                // The wire format wants stringified argument objects.
                let wire_calls: Vec<Value> = calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {
                                "name": c.name,
                                "arguments": c.arguments.to_string()
                            }
                        })
                    })
                    .collect();
                wire["tool_calls"] = json!(wire_calls);
            }
            if let Some(id) = &m.tool_call_id {
                wire["tool_call_id"] = json!(id);
            }
            wire
        })
        .collect()
}

/// Accumulates one streamed chat-completions response: text deltas plus
/// tool-call fragments keyed by the `index` field.
#[derive(Default)]
pub(crate) struct OpenAiStreamAccumulator {
    text: String,
    partial: BTreeMap<u64, PartialCall>,
}

#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl OpenAiStreamAccumulator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Ingests one stream event, returning any text delta to surface.
    pub(crate) fn ingest(&mut self, event: &Value) -> Option<String> {
        let delta = event.get("choices")?.get(0)?.get("delta")?;

        if let Some(fragments) = delta.get("tool_calls").and_then(Value::as_array) {
            for fragment in fragments {
                let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
                let entry = self.partial.entry(index).or_default();
                if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                    entry.id = Some(id.to_string());
                }
                if let Some(function) = fragment.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        entry.name.get_or_insert_with(String::new).push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        entry.arguments.push_str(args);
                    }
                }
            }
        }

        let text = delta.get("content").and_then(Value::as_str)?;
        if text.is_empty() {
            return None;
        }
        self.text.push_str(text);
        Some(text.to_string())
    }

    /// Parses the accumulated fragments. A call whose argument JSON never
    /// became valid is logged and dropped rather than propagated.
    pub(crate) fn finish(self) -> LlmResponse {
        let OpenAiStreamAccumulator { text, partial } = self;
        let mut tool_calls = Vec::new();

        for (index, call) in partial {
            let name = match call.name {
                Some(name) if !name.is_empty() => name,
                _ => {
                    warn!(index, "Dropping streamed tool call with no name");
                    continue;
                }
            };
            let arguments = if call.arguments.trim().is_empty() {
                json!({})
            } else {
                match serde_json::from_str(&call.arguments) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(
                            tool_name = %name,
                            error = %e,
                            accumulated = %call.arguments,
                            "Dropping streamed tool call with malformed arguments"
                        );
                        continue;
                    }
                }
            };
            tool_calls.push(ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{}", index)),
                name,
                arguments,
            });
        }

        LlmResponse {
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls,
        }
    }
}
