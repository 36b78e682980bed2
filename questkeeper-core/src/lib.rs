// questkeeper-core/src/lib.rs

#![doc = include_str!("../../README.md")]

pub mod config;
pub mod errors;
pub mod game_master;
pub mod mcp;
pub mod models;
pub mod providers;
pub mod stores;
pub mod sync;
pub mod watchdog;


pub use async_trait::async_trait;

pub use config::{ClientConfig, ModelConfig};
pub use errors::ClientError;
pub use game_master::{GameMaster, MAX_TOOL_TURNS};
pub use mcp::client::{GameServerClient, ToolClient};
pub use models::chat::{ChatMessage, LlmResponse};
pub use models::tools::{ToolCall, ToolDefinition, ToolExecution, ToolOutcome};
pub use providers::{build_registry, Provider, ProviderRegistry};
pub use stores::{combat::CombatStore, game::GameStateStore};
pub use sync::{StateSync, SyncReport};
pub use watchdog::{BugReport, LogBuffer, Severity, Watchdog};
