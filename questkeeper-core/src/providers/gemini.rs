// questkeeper-core/src/providers/gemini.rs

//! Google Gemini `generateContent` adapter.
//!
//! Gemini differs from the other backends in three ways: the model name and
//! API key live in the URL, tool results are echoed back by function NAME
//! rather than call id, and the streaming endpoint emits one JSON array
//! (chunked mid-object) instead of SSE lines.

use super::Provider;
use crate::config::ModelConfig;
use crate::errors::ClientError;
use crate::models::chat::{ChatMessage, LlmResponse};
use crate::models::tools::{ToolCall, ToolDefinition};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const MAX_OUTPUT_TOKENS: u32 = 4096;

pub struct GeminiProvider {
    model_config: ModelConfig,
    http_client: Client,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(model_config: ModelConfig, http_client: Client, api_key: String) -> Self {
        Self {
            model_config,
            http_client,
            api_key,
        }
    }

    /// Builds the method URL. A configured endpoint overrides the base only;
    /// the model segment and key query are appended either way.
    pub fn request_url(&self, stream: bool) -> String {
        let method = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let base = self
            .model_config
            .endpoint
            .as_deref()
            .unwrap_or(GEMINI_BASE_URL)
            .trim_end_matches('/');
        let url = format!("{}/{}:{}", base, self.model_config.model_name, method);
        if self.api_key.is_empty() {
            url
        } else {
            format!("{}?key={}", url, self.api_key)
        }
    }

    pub fn build_payload(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Value {
        let mut contents = Vec::new();
        for message in messages {
            if let Some(role) = map_role_to_gemini(&message.role) {
                match role {
                    "function" => {
                        // Results round-trip by function name. The call id is
                        // only a fallback for histories recorded before the
                        // name was tracked.
                        let name = message
                            .name
                            .clone()
                            .or_else(|| message.tool_call_id.clone())
                            .unwrap_or_default();
                        let response_content = message.content.clone().unwrap_or_default();
                        let response_json: Value = serde_json::from_str(&response_content)
                            .unwrap_or_else(|_| json!(response_content));
                        contents.push(json!({
                            "role": role,
                            "parts": [{
                                "functionResponse": {
                                    "name": name,
                                    "response": {"content": response_json}
                                }
                            }]
                        }));
                    }
                    _ => {
                        let mut parts = Vec::new();
                        if let Some(content) = &message.content {
                            parts.push(json!({ "text": content }));
                        }
                        if let Some(calls) = &message.tool_calls {
                            for call in calls {
                                parts.push(json!({
                                    "functionCall": {
                                        "name": call.name,
                                        "args": call.arguments
                                    }
                                }));
                            }
                        }
                        if !parts.is_empty() {
                            contents.push(json!({ "role": role, "parts": parts }));
                        }
                    }
                }
            }
        }

        let mut generation_config = json!({ "maxOutputTokens": MAX_OUTPUT_TOKENS });
        if let Some(params) = &self.model_config.parameters {
            if let Some(temperature) = params.get("temperature").and_then(|t| t.as_float()) {
                generation_config["temperature"] = json!(temperature);
            }
        }

        let mut payload = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });

        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema
                    })
                })
                .collect();
            payload["tools"] = json!([{ "function_declarations": declarations }]);
        }

        payload
    }

    async fn post(&self, url: &str, payload: &Value) -> Result<reqwest::Response, ClientError> {
        let response = self
            .http_client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| ClientError::Transport {
                provider: "gemini".to_string(),
                source: e.into(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                provider: "gemini".to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    pub fn parse_response(&self, response_body: &str) -> Result<LlmResponse, ClientError> {
        let raw: Value = serde_json::from_str(response_body)
            .map_err(|e| ClientError::Parse(format!("gemini response was not JSON: {}", e)))?;

        let candidates = raw
            .get("candidates")
            .and_then(Value::as_array)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| match blocked_reason(&raw) {
                Some(reason) => {
                    ClientError::Parse(format!("gemini request blocked: {}", reason))
                }
                None => ClientError::Parse(format!(
                    "gemini response had no candidates: {}",
                    response_body
                )),
            })?;

        let candidate = &candidates[0];
        if candidates.len() > 1 {
            warn!("Handling only the first candidate from Gemini response.");
        }

        let finish_reason = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        if !["STOP", "MAX_TOKENS", "TOOL_CALLS", "unknown"].contains(&finish_reason) {
            warn!(finish_reason = %finish_reason, "Gemini candidate finishReason indicates potential issue.");
            return Err(ClientError::Parse(match blocked_reason(&raw) {
                Some(reason) => format!(
                    "gemini request blocked: {} (finishReason: {})",
                    reason, finish_reason
                ),
                None => format!(
                    "gemini candidate finished abnormally (finishReason: {})",
                    finish_reason
                ),
            }));
        }

        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ClientError::Parse(format!(
                    "gemini candidate had no content parts: {}",
                    response_body
                ))
            })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        collect_parts(parts, &mut text, &mut tool_calls);

        Ok(LlmResponse {
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls,
        })
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn get_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, ClientError> {
        let payload = self.build_payload(messages, tools);
        debug!(model = %self.model_config.model_name, num_messages = messages.len(), "Requesting completion");
        let response = self.post(&self.request_url(false), &payload).await?;
        let body = response.text().await.map_err(|e| ClientError::Transport {
            provider: "gemini".to_string(),
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
        let payload = self.build_payload(messages, tools);
        trace!(model = %self.model_config.model_name, "Opening generateContent stream");
        let response = self.post(&self.request_url(true), &payload).await?;

        let mut body = response.bytes_stream();
        let mut objects = JsonStreamBuffer::new();
        let mut accumulator = GeminiStreamAccumulator::default();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ClientError::Transport {
                provider: "gemini".to_string(),
                source: e.into(),
            })?;
            for object in objects.push(&String::from_utf8_lossy(&chunk)) {
                match serde_json::from_str::<Value>(&object) {
                    Ok(event) => {
                        if let Some(text) = accumulator.ingest(&event) {
                            let _ = chunks.send(text);
                        }
                    }
                    Err(e) => warn!(error = %e, object = %object, "Failed to parse stream object"),
                }
            }
        }

        Ok(accumulator.finish())
    }
}

fn map_role_to_gemini(role: &str) -> Option<&str> {
    match role {
        // No system slot in the contents array; fold it into the user turn.
        "user" | "system" => Some("user"),
        "assistant" => Some("model"),
        "tool" => Some("function"),
        _ => {
            warn!(role = %role, "Unknown role encountered for Gemini mapping, skipping message.");
            None
        }
    }
}

fn collect_parts(parts: &[Value], text: &mut String, tool_calls: &mut Vec<ToolCall>) {
    for part in parts {
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push_str(t);
        } else if let Some(function_call) = part.get("functionCall") {
            if let Some(name) = function_call.get("name").and_then(Value::as_str) {
                let args = function_call
                    .get("args")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                tool_calls.push(ToolCall {
                    id: generate_id("gemini_tool"),
                    name: name.to_string(),
                    arguments: args,
                });
            }
        }
    }
}

fn blocked_reason(raw: &Value) -> Option<String> {
    raw.get("promptFeedback")
        .and_then(|f| f.get("blockReason"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn generate_id(prefix: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{}_{}", prefix, nanos)
}

/// Splits a streamed JSON array into complete top-level objects.
///
/// `streamGenerateContent` delivers `[{...},\n{...}]` with chunk boundaries
/// anywhere, including inside string literals. Brace depth is tracked with
/// string and escape awareness; commas and brackets between objects fall out
/// of the scan naturally.
pub(crate) struct JsonStreamBuffer {
    buffer: String,
}

impl JsonStreamBuffer {
    pub(crate) fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Appends a chunk and drains every complete object now available.
    pub(crate) fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut objects = Vec::new();
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut start = None;
        let mut consumed = 0usize;

        for (i, ch) in self.buffer.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                '{' if !in_string => {
                    if depth == 0 {
                        start = Some(i);
                    }
                    depth += 1;
                }
                '}' if !in_string => {
                    if depth > 0 {
                        depth -= 1;
                        if depth == 0 {
                            if let Some(s) = start.take() {
                                objects.push(self.buffer[s..=i].to_string());
                                consumed = i + ch.len_utf8();
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        self.buffer.drain(..consumed);
        objects
    }
}

/// Collects streamed candidates into one response. Gemini sends complete
/// `functionCall` parts per chunk, so no partial-argument assembly is needed.
#[derive(Default)]
pub(crate) struct GeminiStreamAccumulator {
    text: String,
    tool_calls: Vec<ToolCall>,
}

impl GeminiStreamAccumulator {
    /// Ingests one stream object, returning any text delta to surface.
    pub(crate) fn ingest(&mut self, event: &Value) -> Option<String> {
        let candidate = event.get("candidates")?.get(0)?;
        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)?;

        let mut delta = String::new();
        collect_parts(parts, &mut delta, &mut self.tool_calls);
        if delta.is_empty() {
            None
        } else {
            self.text.push_str(&delta);
            Some(delta)
        }
    }

    pub(crate) fn finish(self) -> LlmResponse {
        LlmResponse {
            content: if self.text.is_empty() {
                None
            } else {
                Some(self.text)
            },
            tool_calls: self.tool_calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn provider() -> GeminiProvider {
        GeminiProvider::new(
            ModelConfig {
                model_name: "gemini-2.0-flash".to_string(),
                parameters: None,
                endpoint: None,
            },
            Client::new(),
            "test_key".to_string(),
        )
    }

    #[test]
    fn test_request_url_embeds_model_and_key() {
        let p = provider();
        assert_eq!(
            p.request_url(false),
            format!("{}/gemini-2.0-flash:generateContent?key=test_key", GEMINI_BASE_URL)
        );
        assert!(p.request_url(true).contains(":streamGenerateContent"));
    }

    #[test]
    fn test_request_url_without_key_has_no_query() {
        let p = GeminiProvider::new(
            ModelConfig {
                model_name: "gemini-2.0-flash".to_string(),
                parameters: None,
                endpoint: None,
            },
            Client::new(),
            String::new(),
        );
        assert!(!p.request_url(false).contains('?'));
    }

    #[test]
    fn test_build_payload_maps_roles_and_function_traffic() {
        let p = provider();
        let messages = vec![
            ChatMessage::system("You are the Game Master."),
            ChatMessage::user("Roll for initiative"),
            ChatMessage::assistant(
                None,
                vec![ToolCall {
                    id: "gemini_tool_1".to_string(),
                    name: "dice_roll".to_string(),
                    arguments: json!({"formula": "1d20"}),
                }],
            ),
            ChatMessage::tool_result("gemini_tool_1", "dice_roll", r#"{"total":14}"#),
        ];

        let payload = p.build_payload(&messages, &[]);
        let contents = payload["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 4);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "user");
        assert_eq!(contents[2]["role"], "model");
        assert_eq!(
            contents[2]["parts"][0]["functionCall"]["name"],
            "dice_roll"
        );

        // The result goes back under the function NAME, with parsed content.
        let response_part = &contents[3]["parts"][0]["functionResponse"];
        assert_eq!(contents[3]["role"], "function");
        assert_eq!(response_part["name"], "dice_roll");
        assert_eq!(response_part["response"]["content"], json!({"total": 14}));

        assert_eq!(payload["generationConfig"]["maxOutputTokens"], 4096);
    }

    #[test]
    fn test_build_payload_function_response_falls_back_to_call_id() {
        let p = provider();
        let mut message = ChatMessage::tool_result("call_abc", "dice_roll", "plain text");
        message.name = None;
        let payload = p.build_payload(&[message], &[]);
        let response_part = &payload["contents"][0]["parts"][0]["functionResponse"];
        assert_eq!(response_part["name"], "call_abc");
        // Non-JSON content survives as a string.
        assert_eq!(response_part["response"]["content"], "plain text");
    }

    #[test]
    fn test_build_payload_declares_tools() {
        let p = provider();
        let tools = vec![ToolDefinition {
            name: "give_item".to_string(),
            description: "Add an item to a character's inventory".to_string(),
            input_schema: json!({"type": "object"}),
        }];
        let payload = p.build_payload(&[ChatMessage::user("loot")], &tools);
        let declaration = &payload["tools"][0]["function_declarations"][0];
        assert_eq!(declaration["name"], "give_item");
        assert_eq!(declaration["parameters"], json!({"type": "object"}));
    }

    #[test]
    fn test_parse_response_extracts_text_and_function_calls() {
        let p = provider();
        let body = r#"{
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        { "text": "The blade finds its mark." },
                        { "functionCall": { "name": "execute_combat_action", "args": {"action": "attack"} } }
                    ]
                },
                "finishReason": "STOP"
            }]
        }"#;
        let response = p.parse_response(body).unwrap();
        assert_eq!(response.content.as_deref(), Some("The blade finds its mark."));
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "execute_combat_action");
        assert!(response.tool_calls[0].id.starts_with("gemini_tool_"));
        assert_eq!(response.tool_calls[0].arguments, json!({"action": "attack"}));
    }

    #[test]
    fn test_parse_response_reports_block_reason() {
        let p = provider();
        let body = r#"{ "candidates": [], "promptFeedback": { "blockReason": "SAFETY" } }"#;
        let err = p.parse_response(body).unwrap_err();
        match err {
            ClientError::Parse(msg) => assert!(msg.contains("SAFETY")),
            other => panic!("Expected Parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_json_stream_buffer_reassembles_split_objects() {
        let mut buffer = JsonStreamBuffer::new();
        assert!(buffer.push("[{\"a\": ").is_empty());
        let objects = buffer.push("1},\n{\"b\": 2}");
        assert_eq!(objects, vec!["{\"a\": 1}", "{\"b\": 2}"]);
        assert_eq!(buffer.push("]"), Vec::<String>::new());
    }

    #[test]
    fn test_json_stream_buffer_ignores_braces_inside_strings() {
        let mut buffer = JsonStreamBuffer::new();
        let objects = buffer.push(r#"[{"text": "a } b \" { c"}"#);
        assert_eq!(objects, vec![r#"{"text": "a } b \" { c"}"#]);
    }

    #[test]
    fn test_stream_accumulator_collects_text_and_calls() {
        let mut acc = GeminiStreamAccumulator::default();
        assert_eq!(
            acc.ingest(&json!({
                "candidates": [{ "content": { "parts": [{ "text": "The door " }] } }]
            })),
            Some("The door ".to_string())
        );
        assert_eq!(
            acc.ingest(&json!({
                "candidates": [{ "content": { "parts": [{ "text": "creaks open." }] } }]
            })),
            Some("creaks open.".to_string())
        );
        acc.ingest(&json!({
            "candidates": [{ "content": { "parts": [
                { "functionCall": { "name": "advance_turn", "args": {} } }
            ] } }]
        }));

        let response = acc.finish();
        assert_eq!(response.content.as_deref(), Some("The door creaks open."));
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "advance_turn");
    }

    #[tokio::test]
    async fn test_get_completion_round_trip() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/gemini-2.0-flash:generateContent")
                .query_param("key", "test_key");
            then.status(200).json_body(json!({
                "candidates": [{
                    "content": { "role": "model", "parts": [{ "text": "Welcome." }] },
                    "finishReason": "STOP"
                }]
            }));
        });

        let p = GeminiProvider::new(
            ModelConfig {
                model_name: "gemini-2.0-flash".to_string(),
                parameters: None,
                endpoint: Some(server.url("")),
            },
            Client::new(),
            "test_key".to_string(),
        );
        let response = p
            .get_completion(&[ChatMessage::user("hello")], &[])
            .await
            .unwrap();
        mock.assert();
        assert_eq!(response.content.as_deref(), Some("Welcome."));
    }

    #[tokio::test]
    async fn test_get_completion_surfaces_api_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/gemini-2.0-flash:generateContent");
            then.status(400).body("API key not valid");
        });

        let p = GeminiProvider::new(
            ModelConfig {
                model_name: "gemini-2.0-flash".to_string(),
                parameters: None,
                endpoint: Some(server.url("")),
            },
            Client::new(),
            "bad_key".to_string(),
        );
        let err = p
            .get_completion(&[ChatMessage::user("hello")], &[])
            .await
            .unwrap_err();
        match err {
            ClientError::Api { status, .. } => assert_eq!(status, 400),
            other => panic!("Expected Api error, got {:?}", other),
        }
    }
}
