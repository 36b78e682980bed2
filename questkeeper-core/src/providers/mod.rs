// questkeeper-core/src/providers/mod.rs

//! LLM provider adapters.
//!
//! Each adapter translates the canonical [`ChatMessage`]/[`ToolCall`] shapes
//! into one provider's wire format and back. The registry is built from
//! config at startup; nothing here is global.

use crate::config::ClientConfig;
use crate::errors::ClientError;
use crate::models::chat::{ChatMessage, LlmResponse};
use crate::models::tools::ToolDefinition;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::warn;

pub mod anthropic;
pub mod gemini;
pub mod openai;

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// One complete request/response cycle. An empty `tools` slice sends no
    /// tool catalog at all.
    async fn get_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, ClientError>;

    /// Streaming variant: narration text is pushed into `chunks` as it
    /// arrives; the returned response carries the accumulated text plus the
    /// complete batch of tool calls requested this turn. A dropped receiver
    /// is not an error, the stream just goes unobserved.
    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        chunks: mpsc::UnboundedSender<String>,
    ) -> Result<LlmResponse, ClientError>;
}

pub struct ProviderRegistry {
    providers: HashMap<String, Box<dyn Provider>>,
    default_provider: String,
}

impl ProviderRegistry {
    pub fn new(default_provider: String) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider,
        }
    }

    pub fn register(&mut self, id: String, provider: Box<dyn Provider>) {
        self.providers.insert(id, provider);
    }

    pub fn get(&self, id: &str) -> Result<&dyn Provider, ClientError> {
        self.providers
            .get(id)
            .map(|p| p.as_ref())
            .ok_or_else(|| ClientError::UnknownProvider(id.to_string()))
    }

    pub fn default(&self) -> Result<&dyn Provider, ClientError> {
        self.get(&self.default_provider)
    }

    pub fn default_provider_id(&self) -> &str {
        &self.default_provider
    }
}

/// Builds the registry from config, resolving API keys from the
/// environment. A missing key is recorded as a warning here and becomes a
/// hard error only when that provider is actually asked for a turn.
pub fn build_registry(
    config: &ClientConfig,
    http_client: &reqwest::Client,
) -> Result<ProviderRegistry, ClientError> {
    let mut registry = ProviderRegistry::new(config.default_provider.clone());

    for (id, provider_conf) in &config.providers {
        let api_key = match std::env::var(&provider_conf.api_key_env_var) {
            Ok(key) => key,
            Err(_) => {
                warn!(
                    provider_id = %id,
                    env_var = %provider_conf.api_key_env_var,
                    "API key environment variable not set"
                );
                String::new()
            }
        };

        let model_config = provider_conf.model_config.clone();
        let provider: Box<dyn Provider> = match provider_conf.provider_type.as_str() {
            "openai" => Box::new(openai::OpenAiProvider::openai(
                model_config,
                http_client.clone(),
                api_key,
            )),
            "openrouter" => Box::new(openai::OpenAiProvider::openrouter(
                model_config,
                http_client.clone(),
                api_key,
            )),
            "anthropic" => Box::new(anthropic::AnthropicProvider::new(
                model_config,
                http_client.clone(),
                api_key,
            )),
            "gemini" => Box::new(gemini::GeminiProvider::new(
                model_config,
                http_client.clone(),
                api_key,
            )),
            other => return Err(ClientError::UnknownProvider(other.to_string())),
        };
        registry.register(id.clone(), provider);
    }

    Ok(registry)
}

/// Splits an SSE body into `data:` payloads as bytes arrive, carrying
/// partial lines across chunk boundaries.
#[derive(Default)]
pub(crate) struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds one transport chunk and returns the completed `data:` payloads
    /// it closed out.
    pub(crate) fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data: ") {
                payloads.push(data.to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}
