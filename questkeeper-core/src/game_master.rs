// questkeeper-core/src/game_master.rs

//! The turn driver. One user message goes in, the provider and the game
//! server trade tool calls for up to [`MAX_TOOL_TURNS`] rounds, and the
//! final narration comes out along with the updated message history.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ProviderInstanceConfig};
use crate::errors::ClientError;
use crate::mcp::client::{GameServerClient, ToolClient};
use crate::mcp::envelope::{error_message, is_error_payload, parse_tool_payload};
use crate::models::chat::{ChatMessage, LlmResponse};
use crate::models::tools::{
    ToolCall, ToolCatalogCache, ToolDefinition, ToolExecution, ToolOutcome, DEFAULT_TOOL_CACHE_TTL,
};
use crate::providers::ProviderRegistry;
use crate::stores::combat::CombatStore;
use crate::stores::game::GameStateStore;
use crate::sync::StateSync;
use crate::watchdog::{is_local_tool, local_tool_definitions, LogBuffer, Watchdog};

/// Ceiling on provider/tool rounds for a single user message. Hitting it is
/// not an error: the turn ends with whatever narration the model produced
/// last.
pub const MAX_TOOL_TURNS: usize = 5;

/// Orchestrates a play session: provider selection, the tool-call loop,
/// state synchronization after each batch, and the background refresh.
pub struct GameMaster {
    config: ClientConfig,
    providers: ProviderRegistry,
    client: Arc<dyn ToolClient>,
    game: Arc<GameStateStore>,
    combat: Arc<CombatStore>,
    sync: StateSync,
    watchdog: Arc<Watchdog>,
    catalog: Mutex<ToolCatalogCache>,
}

impl GameMaster {
    /// Creates a game master that spawns and owns its game-server process.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| ClientError::config(format!("failed to build HTTP client: {}", e)))?;
        let providers = crate::providers::build_registry(&config, &http_client)?;
        let client: Arc<dyn ToolClient> = Arc::new(GameServerClient::new(
            config.game_server.command.clone(),
            config.game_server.args.clone(),
        ));
        Ok(Self::assemble(config, providers, client))
    }

    /// Wires a game master around an existing tool client. Callers that
    /// manage the server connection themselves (and the test suite) come
    /// through here.
    pub fn with_client(
        config: ClientConfig,
        providers: ProviderRegistry,
        client: Arc<dyn ToolClient>,
    ) -> Self {
        Self::assemble(config, providers, client)
    }

    fn assemble(
        config: ClientConfig,
        providers: ProviderRegistry,
        client: Arc<dyn ToolClient>,
    ) -> Self {
        let game = Arc::new(GameStateStore::new(Arc::clone(&client)));
        let combat = Arc::new(CombatStore::new(Arc::clone(&client), Arc::clone(&game)));
        let logs = Arc::new(LogBuffer::default());
        let watchdog = Arc::new(Watchdog::new(logs, Arc::clone(&client), Arc::clone(&combat)));
        let sync = StateSync::new(Arc::clone(&combat), Arc::clone(&game));
        Self {
            config,
            providers,
            client,
            game,
            combat,
            sync,
            watchdog,
            catalog: Mutex::new(ToolCatalogCache::new(DEFAULT_TOOL_CACHE_TTL)),
        }
    }

    /// Runs one full turn and returns the final narration together with the
    /// updated history (assistant and tool messages appended in order).
    ///
    /// One turn at a time: overlapping turns on the same game master are not
    /// supported, and interleave tool calls and store refreshes if attempted.
    pub async fn send_message(
        &self,
        history: Vec<ChatMessage>,
    ) -> Result<(String, Vec<ChatMessage>), ClientError> {
        self.run_turn(history, None).await
    }

    /// Streaming variant of [`send_message`](Self::send_message). Text deltas
    /// from every round are forwarded on `chunks` as they arrive; rounds that
    /// only request tools produce no chunks.
    pub async fn stream_message(
        &self,
        history: Vec<ChatMessage>,
        chunks: mpsc::UnboundedSender<String>,
    ) -> Result<(String, Vec<ChatMessage>), ClientError> {
        self.run_turn(history, Some(chunks)).await
    }

    async fn run_turn(
        &self,
        mut history: Vec<ChatMessage>,
        stream: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<(String, Vec<ChatMessage>), ClientError> {
        if history.is_empty() {
            return Err(ClientError::config(
                "cannot run a turn with an empty message history",
            ));
        }
        let provider_id = self.config.default_provider.clone();
        self.ensure_api_key(&provider_id)?;
        let provider = self.providers.get(&provider_id)?;

        info!(
            provider = %provider_id,
            num_messages = history.len(),
            "Starting game-master turn."
        );

        let mut final_content = String::new();
        for round in 1..=MAX_TOOL_TURNS {
            let tools = self.available_tools().await;
            debug!(
                round,
                tool_count = tools.len(),
                "Requesting completion from '{}'.",
                provider.name()
            );

            let response = match &stream {
                Some(sender) => {
                    provider
                        .stream_completion(&history, &tools, sender.clone())
                        .await
                }
                None => provider.get_completion(&history, &tools).await,
            };
            let response: LlmResponse = match response {
                Ok(response) => response,
                Err(e) => {
                    self.watchdog
                        .logs()
                        .record("llm", format!("{} completion failed: {}", provider.name(), e))
                        .await;
                    return Err(e);
                }
            };

            if let Some(content) = response.content.as_deref() {
                if !content.trim().is_empty() {
                    final_content = content.to_string();
                }
            }

            history.push(response.to_assistant_message());

            if !response.has_tool_calls() {
                debug!(round, "No tool calls requested; turn complete.");
                return Ok((final_content, history));
            }

            info!(
                round,
                count = response.tool_calls.len(),
                "Model requested {} tool call(s).",
                response.tool_calls.len()
            );
            let executions = self.execute_batch(&response.tool_calls).await;
            for execution in &executions {
                history.push(ChatMessage::tool_result(
                    execution.call_id.clone(),
                    execution.tool_name.clone(),
                    execution.history_content(),
                ));
            }

            let report = self.sync.after_batch(&executions).await;
            debug!(round, ?report, "State sync pass finished.");
        }

        warn!(
            limit = MAX_TOOL_TURNS,
            "Turn hit the tool-round ceiling; replying with the last narration."
        );
        Ok((final_content, history))
    }

    /// Executes a batch of tool calls concurrently and returns the records in
    /// request order regardless of completion order. Local watchdog tools
    /// never leave the process; everything else goes to the game server.
    /// Failures become [`ToolOutcome::Error`] records, never early returns,
    /// so the model always hears back about every call it made.
    async fn execute_batch(&self, calls: &[ToolCall]) -> Vec<ToolExecution> {
        let started = Instant::now();
        let executions = join_all(calls.iter().map(|call| self.execute_call(call))).await;
        debug!(
            count = executions.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tool batch finished."
        );
        executions
    }

    async fn execute_call(&self, call: &ToolCall) -> ToolExecution {
        debug!(call_id = %call.id, tool = %call.name, "Executing tool call.");
        let outcome = if is_local_tool(&call.name) {
            let envelope = self
                .watchdog
                .execute_local_tool(&call.name, &call.arguments)
                .await;
            outcome_from_envelope(envelope)
        } else {
            match self.client.call_tool(&call.name, call.arguments.clone()).await {
                Ok(envelope) => outcome_from_envelope(envelope),
                Err(e) => ToolOutcome::Error(e.to_string()),
            }
        };
        if let ToolOutcome::Error(message) = &outcome {
            warn!(tool = %call.name, error = %message, "Tool call failed.");
            self.watchdog
                .logs()
                .record("tool", format!("{} failed: {}", call.name, message))
                .await;
        }
        ToolExecution {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            outcome,
        }
    }

    /// The tool list offered to the model this round: the game server's
    /// catalog (cached) plus the local watchdog tools. Free-tier OpenRouter
    /// models reject tool-bearing requests, so they get an empty list.
    async fn available_tools(&self) -> Vec<ToolDefinition> {
        if let Some(instance) = self.config.providers.get(&self.config.default_provider) {
            if is_free_model(instance) {
                debug!(
                    model = %instance.model_config.model_name,
                    "Free-tier model; offering no tools."
                );
                return Vec::new();
            }
        }
        let mut tools = self.server_tools().await;
        tools.extend(local_tool_definitions());
        tools
    }

    async fn server_tools(&self) -> Vec<ToolDefinition> {
        let mut catalog = self.catalog.lock().await;
        if let Some(tools) = catalog.fresh() {
            return tools;
        }
        match self.client.list_tools().await {
            Ok(tools) => {
                debug!(count = tools.len(), "Refreshed tool catalog from game server.");
                catalog.store(tools.clone());
                tools
            }
            Err(e) => {
                warn!(error = ?e, "Tool catalog fetch failed; using last known catalog.");
                catalog.last_known().unwrap_or_default()
            }
        }
    }

    /// Call-time key check. Registry construction only warns on a missing
    /// key; an actual send without one is a hard error.
    fn ensure_api_key(&self, provider_id: &str) -> Result<(), ClientError> {
        let Some(instance) = self.config.providers.get(provider_id) else {
            // Unknown ids fall through to the registry's own error.
            return Ok(());
        };
        let env_var = &instance.api_key_env_var;
        match std::env::var(env_var) {
            Ok(value) if !value.trim().is_empty() => Ok(()),
            _ => Err(ClientError::MissingApiKey {
                provider: provider_id.to_string(),
                env_var: env_var.clone(),
            }),
        }
    }

    /// Spawns the background poll that keeps both stores warm even when the
    /// model stops touching state tools. The first tick fires immediately,
    /// which doubles as the initial sync after startup.
    pub fn spawn_backup_poll(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let master = Arc::clone(self);
        tokio::spawn(async move {
            // interval panics on a zero period.
            let period = Duration::from_secs(master.config.poll_interval_secs.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = master.game.refresh().await {
                    warn!(error = ?e, "Backup poll: party refresh failed.");
                }
                if let Err(e) = master.combat.refresh().await {
                    warn!(error = ?e, "Backup poll: combat refresh failed.");
                }
            }
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn game(&self) -> Arc<GameStateStore> {
        Arc::clone(&self.game)
    }

    pub fn combat(&self) -> Arc<CombatStore> {
        Arc::clone(&self.combat)
    }

    pub fn watchdog(&self) -> Arc<Watchdog> {
        Arc::clone(&self.watchdog)
    }

    pub fn tool_client(&self) -> Arc<dyn ToolClient> {
        Arc::clone(&self.client)
    }
}

/// Maps a raw tool envelope to an execution outcome. The server flags
/// failures with `isError` on the envelope; some tools answer with an
/// `{"error": ...}` payload instead. Both become [`ToolOutcome::Error`]
/// carrying the server's message.
fn outcome_from_envelope(envelope: Value) -> ToolOutcome {
    let flagged = envelope
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let payload = parse_tool_payload(Some(&envelope), Value::Null);
    if flagged {
        let message = match &payload {
            Value::String(text) => text.clone(),
            Value::Null => "tool reported an error".to_string(),
            other => error_message(other).unwrap_or_else(|| other.to_string()),
        };
        return ToolOutcome::Error(message);
    }
    if is_error_payload(&payload) {
        let message =
            error_message(&payload).unwrap_or_else(|| "tool reported an error".to_string());
        return ToolOutcome::Error(message);
    }
    ToolOutcome::Success(payload)
}

/// OpenRouter's free tier rejects requests that carry tool definitions.
fn is_free_model(instance: &ProviderInstanceConfig) -> bool {
    instance.provider_type == "openrouter" && instance.model_config.model_name.contains(":free")
}
