// questkeeper-core/src/errors.rs
use thiserror::Error;

/// Errors that can occur while driving a game-master turn.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Error related to configuration loading or validation.
    #[error("Configuration Error: {0}")]
    Config(String),

    /// No API key available for a provider that requires one.
    #[error("Missing API key for provider '{provider}' (set {env_var})")]
    MissingApiKey { provider: String, env_var: String },

    /// Non-2xx response from an LLM provider.
    #[error("{provider} API error: status {status}: {body}")]
    Api {
        provider: String,
        status: u16,
        body: String,
    },

    /// Transport-level failure before any provider response arrived.
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: String,
        #[source]
        source: anyhow::Error,
    },

    /// A provider id with no registered adapter.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Error from the game-server connection or a tool call.
    #[error("Game Server Error: {0}")]
    Mcp(#[source] anyhow::Error),

    /// A provider response or stream that could not be decoded.
    #[error("Parse Error: {0}")]
    Parse(String),
}

impl ClientError {
    pub fn config(msg: impl Into<String>) -> Self {
        ClientError::Config(msg.into())
    }
}
