// questkeeper-core/src/stores/combat.rs

//! Client-side mirror of the active combat encounter.
//!
//! The server owns the real state; this store caches the last
//! `get_encounter_state` answer so the HUD can render without a round trip.
//! Refreshes are rate limited and an encounter that disappears server-side
//! clears the local view.

use crate::mcp::client::ToolClient;
use crate::mcp::envelope::{error_message, is_error_payload, parse_tool_payload};
use crate::stores::game::GameStateStore;
use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

lazy_static! {
    static ref STATE_JSON_RE: Regex =
        Regex::new(r"(?s)<!-- STATE_JSON\n(.*?)\nSTATE_JSON -->")
            .expect("state marker regex should be valid");
}

/// Encounter state as `get_encounter_state` returns it.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EncounterState {
    pub encounter_id: String,
    pub round: u32,
    pub current_turn_index: u32,
    pub current_turn: Option<TurnRef>,
    pub turn_order: Vec<String>,
    pub participants: Vec<Participant>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnRef {
    pub id: String,
    pub name: String,
    pub is_enemy: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub hp: i64,
    pub max_hp: i64,
    pub initiative: i64,
    pub is_enemy: bool,
    pub conditions: Vec<String>,
    pub is_defeated: bool,
    pub is_current_turn: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CombatVitals {
    pub is_combat_active: bool,
    pub participant_count: usize,
    pub round: u32,
    pub current_turn_name: Option<String>,
}

#[derive(Default)]
struct CombatState {
    active_encounter_id: Option<String>,
    round: u32,
    current_turn_name: Option<String>,
    turn_order: Vec<String>,
    participants: Vec<Participant>,
    battlefield_description: Option<String>,
    syncing: bool,
    last_refresh: Option<Instant>,
}

pub struct CombatStore {
    client: Arc<dyn ToolClient>,
    game: Arc<GameStateStore>,
    state: Mutex<CombatState>,
}

impl CombatStore {
    pub fn new(client: Arc<dyn ToolClient>, game: Arc<GameStateStore>) -> Self {
        Self {
            client,
            game,
            state: Mutex::new(CombatState::default()),
        }
    }

    pub async fn set_active_encounter(&self, id: Option<String>) {
        self.state.lock().await.active_encounter_id = id;
    }

    pub async fn active_encounter_id(&self) -> Option<String> {
        self.state.lock().await.active_encounter_id.clone()
    }

    pub async fn in_combat(&self) -> bool {
        self.state.lock().await.active_encounter_id.is_some()
    }

    /// Vital signs for diagnostics and the HUD.
    pub async fn vitals(&self) -> CombatVitals {
        let state = self.state.lock().await;
        CombatVitals {
            is_combat_active: state.active_encounter_id.is_some(),
            participant_count: state.participants.len(),
            round: state.round,
            current_turn_name: state.current_turn_name.clone(),
        }
    }

    pub async fn clear(&self) {
        debug!("Clearing local combat state");
        let mut state = self.state.lock().await;
        state.active_encounter_id = None;
        state.round = 0;
        state.current_turn_name = None;
        state.turn_order.clear();
        state.participants.clear();
        state.battlefield_description = None;
    }

    /// Pulls the encounter from the server. Skipped while a refresh is in
    /// flight, within one second of the last one, or when no encounter is
    /// active. An encounter the server no longer knows clears local state
    /// and is not a failure.
    pub async fn refresh(&self) -> Result<()> {
        let encounter_id = {
            let mut state = self.state.lock().await;
            if state.syncing {
                trace!("Encounter refresh already in flight, skipping");
                return Ok(());
            }
            if let Some(last) = state.last_refresh {
                if last.elapsed() < MIN_REFRESH_INTERVAL {
                    trace!("Encounter refreshed moments ago, skipping");
                    return Ok(());
                }
            }
            let Some(id) = state.active_encounter_id.clone() else {
                debug!("No active encounter to refresh");
                return Ok(());
            };
            state.syncing = true;
            state.last_refresh = Some(Instant::now());
            id
        };

        let result = self.pull(&encounter_id).await;
        self.state.lock().await.syncing = false;
        result
    }

    async fn pull(&self, encounter_id: &str) -> Result<()> {
        let call = self
            .client
            .call_tool("get_encounter_state", json!({ "encounterId": encounter_id }))
            .await;

        let envelope = match call {
            Ok(envelope) => envelope,
            Err(e) => {
                if is_missing_encounter(&e.to_string()) {
                    debug!(encounter_id, "Encounter gone server-side, clearing local combat state");
                    self.clear().await;
                    return Ok(());
                }
                return Err(e);
            }
        };

        let payload = parse_tool_payload(Some(&envelope), Value::Null);
        if is_error_payload(&payload) {
            let message = error_message(&payload).unwrap_or_default();
            if is_missing_encounter(&message) {
                debug!(encounter_id, "Encounter gone server-side, clearing local combat state");
                self.clear().await;
            } else {
                warn!(message = %message, "Encounter state query returned an error");
            }
            return Ok(());
        }

        match decode_encounter(&payload) {
            Some(encounter) => self.apply_state(encounter).await,
            None => warn!("Encounter state response held no usable data"),
        }
        Ok(())
    }

    /// Ingests a full encounter snapshot and writes participant HP back onto
    /// the party roster.
    pub async fn apply_state(&self, encounter: EncounterState) {
        let description = describe_encounter(&encounter);
        {
            let mut state = self.state.lock().await;
            state.active_encounter_id = Some(encounter.encounter_id.clone());
            state.round = encounter.round;
            state.current_turn_name = encounter.current_turn.as_ref().map(|t| t.name.clone());
            state.turn_order = encounter.turn_order.clone();
            state.participants = encounter.participants.clone();
            state.battlefield_description = Some(description);
        }
        debug!(
            encounter_id = %encounter.encounter_id,
            round = encounter.round,
            participants = encounter.participants.len(),
            "Applied encounter state"
        );
        for participant in &encounter.participants {
            self.game
                .update_member_hp(&participant.id, &participant.name, participant.hp)
                .await;
        }
    }

    /// Applies a STATE_JSON block embedded in narration text, if present.
    pub async fn ingest_narration(&self, text: &str) -> bool {
        match extract_embedded_state(text) {
            Some(encounter) => {
                self.apply_state(encounter).await;
                true
            }
            None => false,
        }
    }

    /// One-line battle summary for the prompt HUD. `None` outside combat.
    pub async fn describe(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.active_encounter_id.as_ref()?;
        let turn = state.current_turn_name.as_deref().unwrap_or("unknown");
        let standing = state.participants.iter().filter(|p| !p.is_defeated).count();
        Some(format!(
            "Round {} | Turn: {} | {}/{} combatants standing",
            state.round,
            turn,
            standing,
            state.participants.len()
        ))
    }

    /// Multi-line battle report for the `/combat` command.
    pub async fn battlefield_report(&self) -> Option<String> {
        self.state.lock().await.battlefield_description.clone()
    }
}

fn is_missing_encounter(message: &str) -> bool {
    message.contains("not found") || message.contains("does not exist")
}

/// Accepts either the encounter object itself or narration text with an
/// embedded STATE_JSON block.
fn decode_encounter(payload: &Value) -> Option<EncounterState> {
    match payload {
        Value::Object(map) if map.contains_key("participants") => {
            serde_json::from_value(payload.clone()).ok()
        }
        Value::String(text) => extract_embedded_state(text),
        _ => None,
    }
}

/// Pulls an encounter snapshot out of `<!-- STATE_JSON ... STATE_JSON -->`
/// markers that combat tools embed in their narration.
pub fn extract_embedded_state(text: &str) -> Option<EncounterState> {
    let captured = STATE_JSON_RE.captures(text)?.get(1)?.as_str();
    match serde_json::from_str(captured) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(error = %e, "Failed to parse embedded STATE_JSON block");
            None
        }
    }
}

fn describe_encounter(encounter: &EncounterState) -> String {
    if encounter.participants.is_empty() {
        return "No active combat encounter.".to_string();
    }

    let turn = encounter
        .current_turn
        .as_ref()
        .map(|t| t.name.as_str())
        .unwrap_or("unknown");
    let mut lines = vec![
        format!("Combat Round {} | Turn: {}", encounter.round, turn),
        format!("Initiative: {}", encounter.turn_order.join(" -> ")),
    ];
    for p in &encounter.participants {
        let marker = if p.is_defeated {
            "x"
        } else if p.is_current_turn {
            ">"
        } else {
            " "
        };
        let conditions = if p.conditions.is_empty() {
            String::new()
        } else {
            format!(" [{}]", p.conditions.join(", "))
        };
        lines.push(format!(
            "{} {}: {}/{} HP{}",
            marker, p.name, p.hp, p.max_hp, conditions
        ));
    }
    lines.join("\n")
}
