// questkeeper-core/src/mcp/client.rs
use crate::models::tools::ToolDefinition;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rmcp::{
    model::*,
    service::{Peer, RoleClient},
    transport::TokioChildProcess,
};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fs::File;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Client-side view of the game-state server.
///
/// The turn driver, the stores, and the watchdog all reach the server
/// through this trait; tests substitute an in-memory double.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Lists the tools the server currently exposes.
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;

    /// Invokes a named tool and returns the raw result envelope
    /// (`{"content": [{"type": "text", ...}]}`), not an unwrapped payload.
    async fn call_tool(&self, name: &str, args: Value) -> Result<Value>;

    /// Whether a connection to the server has been established.
    async fn is_connected(&self) -> bool;

    /// Number of tool calls currently in flight.
    fn pending_calls(&self) -> usize;
}

/// Handles server-initiated traffic after the MCP handshake. The game
/// server never asks anything of this client, so requests are refused.
struct PassiveClientService;

impl rmcp::service::Service<RoleClient> for PassiveClientService {
    #[allow(refining_impl_trait)]
    fn handle_request(
        &self,
        _request: rmcp::model::ServerRequest,
        _context: rmcp::service::RequestContext<RoleClient>,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<Output = Result<rmcp::model::ClientResult, rmcp::Error>>
                + Send,
        >,
    > {
        Box::pin(async {
            Err(rmcp::Error::method_not_found::<rmcp::model::InitializeResultMethod>())
        })
    }

    #[allow(refining_impl_trait)]
    fn handle_notification(
        &self,
        _notification: rmcp::model::ServerNotification,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), rmcp::Error>> + Send>> {
        Box::pin(async { Ok(()) })
    }

    fn get_peer(&self) -> Option<Peer<RoleClient>> {
        None
    }

    fn set_peer(&mut self, _peer: Peer<RoleClient>) {}

    fn get_info(&self) -> rmcp::model::ClientInfo {
        rmcp::model::ClientInfo::default()
    }
}

/// Connection to the external game-state server over MCP.
///
/// The server is spawned as a child process on first use; the peer handle
/// is shared so that batched tool calls can run concurrently.
pub struct GameServerClient {
    server_command: String,
    server_args: Vec<String>,
    peer: Arc<Mutex<Option<Peer<RoleClient>>>>,
    in_flight: AtomicUsize,
}

impl GameServerClient {
    pub fn new(server_command: String, server_args: Vec<String>) -> Self {
        Self {
            server_command,
            server_args,
            peer: Arc::new(Mutex::new(None)),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Spawns the server process and performs the MCP handshake, if no
    /// connection exists yet.
    async fn ensure_connected(&self) -> Result<()> {
        let mut peer_guard = self.peer.lock().await;
        if peer_guard.is_some() {
            trace!("Game server connection already established.");
            return Ok(());
        }

        info!(command = %self.server_command, args = ?self.server_args, "Starting game server...");

        let mut cmd = Command::new(&self.server_command);
        cmd.args(&self.server_args);
        // Stdio carries the MCP traffic; stderr goes to a file so the
        // server's own logging stays off the player's terminal.
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        match File::create("/tmp/questkeeper-game-server.stderr.log") {
            Ok(stderr_file) => {
                cmd.stderr(stderr_file);
            }
            Err(e) => {
                error!(error = %e, "Failed to open game server stderr log file, using pipe instead");
                cmd.stderr(std::process::Stdio::piped());
            }
        }

        let transport = match TokioChildProcess::new(&mut cmd) {
            Ok(t) => {
                debug!("Game server process spawned successfully.");
                t
            }
            Err(e) => {
                error!(command = ?cmd, error = %e, "Failed to spawn game server process");
                return Err(anyhow!("Failed to spawn game server process: {}", e));
            }
        };

        let ct = CancellationToken::new();
        match rmcp::service::serve_client_with_ct(PassiveClientService, transport, ct).await {
            Ok(running_service) => {
                *peer_guard = Some(running_service.peer().clone());
                info!("Game server connection established.");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Game server MCP handshake failed");
                Err(anyhow!("Failed to establish game server connection: {}", e))
            }
        }
    }

    /// A cloned peer handle. The mutex is released before any RPC runs so
    /// calls in one batch genuinely overlap.
    async fn peer(&self) -> Result<Peer<RoleClient>> {
        self.ensure_connected().await?;
        let guard = self.peer.lock().await;
        guard
            .as_ref()
            .cloned()
            .ok_or_else(|| anyhow!("Game server connection not established"))
    }
}

#[async_trait]
impl ToolClient for GameServerClient {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let peer = self.peer().await?;
        debug!("Calling peer.list_all_tools().");
        let tools = peer.list_all_tools().await.map_err(|e| {
            error!(error = %e, "peer.list_all_tools() failed");
            anyhow!("Failed to list tools via MCP: {}", e)
        })?;
        Ok(tools.into_iter().map(tool_to_definition).collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        let peer = self.peer().await?;
        let arguments: Option<Map<String, Value>> = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            _ => {
                error!(args = ?args, "Invalid tool arguments type");
                return Err(anyhow!("Tool arguments must be a JSON object or null"));
            }
        };
        let params = CallToolRequestParam {
            name: Cow::Owned(name.to_string()),
            arguments,
        };
        trace!(tool_name = %name, "Calling peer.call_tool().");

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = peer.call_tool(params).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let result = outcome.map_err(|e| {
            error!(tool_name = %name, error = %e, "peer.call_tool() failed");
            anyhow!("Failed to call tool '{}' via MCP: {}", name, e)
        })?;

        let content = serde_json::to_value(result.content).map_err(|e| {
            error!(error = %e, "Failed to serialize tool result content");
            anyhow!("Failed to serialize tool result content: {}", e)
        })?;
        let mut envelope = Map::new();
        envelope.insert("content".to_string(), content);
        if let Some(is_error) = result.is_error {
            envelope.insert("isError".to_string(), Value::Bool(is_error));
        }
        Ok(Value::Object(envelope))
    }

    async fn is_connected(&self) -> bool {
        self.peer.lock().await.is_some()
    }

    fn pending_calls(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

fn tool_to_definition(tool: Tool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name.to_string(),
        description: tool.description.to_string(),
        input_schema: Value::Object(tool.input_schema.as_ref().clone()),
    }
}
