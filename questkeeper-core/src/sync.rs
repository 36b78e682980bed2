// questkeeper-core/src/sync.rs

//! Post-batch state synchronization.
//!
//! After a tool batch finishes, the stores touching the affected state are
//! refreshed: once per category no matter how many matching tools ran, the
//! two categories concurrently. A refresh failure leaves stale state behind
//! and never fails the turn.

use crate::models::tools::ToolExecution;
use crate::stores::combat::CombatStore;
use crate::stores::game::GameStateStore;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Tools whose effects invalidate the cached encounter view.
pub const COMBAT_TOOLS: &[&str] = &[
    "create_encounter",
    "get_encounter_state",
    "execute_combat_action",
    "advance_turn",
    "end_encounter",
    "load_encounter",
    "place_creature",
    "move_creature",
    "initialize_battlefield",
    "batch_place_creatures",
    "batch_move_creatures",
];

/// Tools whose effects invalidate the cached party roster.
pub const GAME_STATE_TOOLS: &[&str] = &[
    "create_character",
    "update_character",
    "delete_character",
    "give_item",
    "remove_item",
    "equip_item",
    "unequip_item",
    "assign_quest",
    "complete_quest",
    "update_objective",
];

pub fn is_combat_tool(name: &str) -> bool {
    COMBAT_TOOLS.contains(&name)
}

pub fn is_game_state_tool(name: &str) -> bool {
    GAME_STATE_TOOLS.contains(&name)
}

/// Which store categories a batch refreshed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub combat_refreshed: bool,
    pub game_refreshed: bool,
}

pub struct StateSync {
    combat: Arc<CombatStore>,
    game: Arc<GameStateStore>,
}

impl StateSync {
    pub fn new(combat: Arc<CombatStore>, game: Arc<GameStateStore>) -> Self {
        Self { combat, game }
    }

    /// Immediate effects of one finished call, applied before any refresh.
    async fn apply_execution(&self, execution: &ToolExecution) {
        match execution.tool_name.as_str() {
            "create_encounter" => {
                if let Some(payload) = execution.payload() {
                    if let Some(id) = payload.get("encounterId").and_then(Value::as_str) {
                        debug!(encounter_id = %id, "Tracking new encounter");
                        self.combat.set_active_encounter(Some(id.to_string())).await;
                    }
                }
            }
            // The local view drops the encounter whatever the call returned.
            "end_encounter" => self.combat.clear().await,
            _ => {}
        }

        if is_combat_tool(&execution.tool_name) {
            if let Some(Value::String(text)) = execution.payload() {
                if self.combat.ingest_narration(text).await {
                    debug!(
                        tool_name = %execution.tool_name,
                        "Applied encounter state embedded in tool response"
                    );
                }
            }
        }
    }

    /// Runs the sync pass for one finished batch.
    pub async fn after_batch(&self, executions: &[ToolExecution]) -> SyncReport {
        for execution in executions {
            self.apply_execution(execution).await;
        }

        let combat_touched = executions.iter().any(|e| is_combat_tool(&e.tool_name));
        let game_touched = executions.iter().any(|e| is_game_state_tool(&e.tool_name));

        let combat_refresh = async {
            if combat_touched {
                debug!("Combat tools used, refreshing encounter state");
                if let Err(e) = self.combat.refresh().await {
                    warn!(error = ?e, "Combat state refresh failed");
                }
            }
        };
        let game_refresh = async {
            if game_touched {
                debug!("Game state tools used, refreshing party roster");
                if let Err(e) = self.game.refresh().await {
                    warn!(error = ?e, "Party roster refresh failed");
                }
            }
        };
        tokio::join!(combat_refresh, game_refresh);

        SyncReport {
            combat_refreshed: combat_touched,
            game_refreshed: game_touched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::client::ToolClient;
    use crate::mcp::envelope::text_envelope;
    use crate::models::tools::{ToolDefinition, ToolOutcome};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    // Counts calls per tool name; every call answers with a null payload so
    // refreshes leave store contents untouched.
    #[derive(Default)]
    struct CountingClient {
        calls: StdMutex<HashMap<String, usize>>,
        total: AtomicUsize,
    }

    impl CountingClient {
        fn count(&self, name: &str) -> usize {
            self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ToolClient for CountingClient {
        async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
            Ok(Vec::new())
        }

        async fn call_tool(&self, name: &str, _args: Value) -> Result<Value> {
            *self.calls.lock().unwrap().entry(name.to_string()).or_insert(0) += 1;
            self.total.fetch_add(1, Ordering::SeqCst);
            Ok(text_envelope("null"))
        }

        async fn is_connected(&self) -> bool {
            true
        }

        fn pending_calls(&self) -> usize {
            0
        }
    }

    fn execution(tool_name: &str, outcome: ToolOutcome) -> ToolExecution {
        ToolExecution {
            call_id: format!("call_{}", tool_name),
            tool_name: tool_name.to_string(),
            arguments: json!({}),
            outcome,
        }
    }

    fn sync_over(client: Arc<CountingClient>) -> (Arc<CombatStore>, Arc<GameStateStore>, StateSync) {
        let game = Arc::new(GameStateStore::new(client.clone()));
        let combat = Arc::new(CombatStore::new(client, game.clone()));
        let sync = StateSync::new(combat.clone(), game.clone());
        (combat, game, sync)
    }

    #[tokio::test]
    async fn test_combat_batch_refreshes_combat_only() {
        let client = Arc::new(CountingClient::default());
        let (combat, _game, sync) = sync_over(client.clone());
        combat.set_active_encounter(Some("enc_1".to_string())).await;

        let report = sync
            .after_batch(&[
                execution("execute_combat_action", ToolOutcome::Success(json!({"hit": true}))),
                execution("dice_roll", ToolOutcome::Success(json!(17))),
            ])
            .await;

        assert_eq!(
            report,
            SyncReport {
                combat_refreshed: true,
                game_refreshed: false
            }
        );
        assert_eq!(client.count("get_encounter_state"), 1);
        assert_eq!(client.count("list_characters"), 0);
    }

    #[tokio::test]
    async fn test_many_matching_tools_refresh_once_per_category() {
        let client = Arc::new(CountingClient::default());
        let (combat, _game, sync) = sync_over(client.clone());
        combat.set_active_encounter(Some("enc_1".to_string())).await;

        let report = sync
            .after_batch(&[
                execution("advance_turn", ToolOutcome::Success(json!({}))),
                execution("move_creature", ToolOutcome::Success(json!({}))),
                execution("give_item", ToolOutcome::Success(json!({}))),
                execution("equip_item", ToolOutcome::Success(json!({}))),
            ])
            .await;

        assert!(report.combat_refreshed);
        assert!(report.game_refreshed);
        assert_eq!(client.count("get_encounter_state"), 1);
        assert_eq!(client.count("list_characters"), 1);
    }

    #[tokio::test]
    async fn test_unrelated_batch_refreshes_nothing() {
        let client = Arc::new(CountingClient::default());
        let (_combat, _game, sync) = sync_over(client.clone());

        let report = sync
            .after_batch(&[execution("dice_roll", ToolOutcome::Success(json!(4)))])
            .await;

        assert_eq!(report, SyncReport::default());
        assert_eq!(client.total.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_create_encounter_captures_new_id() {
        let client = Arc::new(CountingClient::default());
        let (combat, _game, sync) = sync_over(client);

        sync.after_batch(&[execution(
            "create_encounter",
            ToolOutcome::Success(json!({"encounterId": "enc_9", "message": "Encounter started"})),
        )])
        .await;

        assert_eq!(combat.active_encounter_id().await.as_deref(), Some("enc_9"));
    }

    #[tokio::test]
    async fn test_end_encounter_clears_even_on_failure() {
        let client = Arc::new(CountingClient::default());
        let (combat, _game, sync) = sync_over(client);
        combat.set_active_encounter(Some("enc_1".to_string())).await;

        sync.after_batch(&[execution(
            "end_encounter",
            ToolOutcome::Error("server timeout".to_string()),
        )])
        .await;

        assert!(!combat.in_combat().await);
    }

    #[tokio::test]
    async fn test_embedded_state_in_tool_response_is_applied() {
        let client = Arc::new(CountingClient::default());
        let (combat, _game, sync) = sync_over(client);

        let narration = format!(
            "A wild boar charges!\n<!-- STATE_JSON\n{}\nSTATE_JSON -->",
            json!({
                "encounterId": "enc_3",
                "round": 1,
                "currentTurn": { "id": "boar_1", "name": "Boar", "isEnemy": true },
                "turnOrder": ["Boar"],
                "participants": [
                    { "id": "boar_1", "name": "Boar", "hp": 11, "maxHp": 11, "initiative": 14,
                      "isEnemy": true, "conditions": [], "isDefeated": false, "isCurrentTurn": true }
                ]
            })
        );
        sync.after_batch(&[execution(
            "execute_combat_action",
            ToolOutcome::Success(Value::String(narration)),
        )])
        .await;

        assert_eq!(combat.active_encounter_id().await.as_deref(), Some("enc_3"));
        assert_eq!(combat.vitals().await.participant_count, 1);
    }
}
