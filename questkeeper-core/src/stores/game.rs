// questkeeper-core/src/stores/game.rs

//! Client-side mirror of the party roster held by the game server.

use crate::mcp::client::ToolClient;
use crate::mcp::envelope::{error_message, is_error_payload, parse_tool_payload};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HitPoints {
    pub current: i64,
    pub max: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PartyMember {
    pub id: String,
    pub name: String,
    pub class: Option<String>,
    pub race: Option<String>,
    pub level: Option<u32>,
    pub hp: HitPoints,
    pub armor_class: Option<i64>,
    pub conditions: Vec<String>,
}

/// Read-only copy of the roster for the HUD and the watchdog.
#[derive(Serialize, Debug, Clone, Default)]
pub struct PartySnapshot {
    pub party: Vec<PartyMember>,
    pub active_character_id: Option<String>,
}

#[derive(Default)]
struct GameState {
    party: Vec<PartyMember>,
    active_character_id: Option<String>,
    syncing: bool,
}

pub struct GameStateStore {
    client: Arc<dyn ToolClient>,
    state: Mutex<GameState>,
}

impl GameStateStore {
    pub fn new(client: Arc<dyn ToolClient>) -> Self {
        Self {
            client,
            state: Mutex::new(GameState::default()),
        }
    }

    /// Pulls the roster from the server. Skipped while another refresh is in
    /// flight; a payload without usable party data leaves the roster alone.
    pub async fn refresh(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.syncing {
                return Ok(());
            }
            state.syncing = true;
        }
        let result = self.pull().await;
        self.state.lock().await.syncing = false;
        result
    }

    async fn pull(&self) -> Result<()> {
        let envelope = self.client.call_tool("list_characters", json!({})).await?;
        let payload = parse_tool_payload(Some(&envelope), Value::Null);

        if is_error_payload(&payload) {
            warn!(
                message = %error_message(&payload).unwrap_or_default(),
                "Character list query returned an error"
            );
            return Ok(());
        }

        let members = decode_party(&payload);
        if members.is_empty() {
            debug!("Character list query returned no usable party data");
            return Ok(());
        }

        let active = payload
            .get("activeCharacterId")
            .and_then(Value::as_str)
            .map(str::to_string);

        self.apply_party(members).await;
        if active.is_some() {
            self.state.lock().await.active_character_id = active;
        }
        Ok(())
    }

    pub async fn apply_party(&self, party: Vec<PartyMember>) {
        debug!(members = party.len(), "Applying party roster");
        self.state.lock().await.party = party;
    }

    pub async fn set_active_character(&self, id: Option<String>) {
        self.state.lock().await.active_character_id = id;
    }

    /// Writes a combat participant's HP back onto the matching roster member.
    /// Matches by id or by name; returns whether anything changed.
    pub async fn update_member_hp(&self, id: &str, name: &str, current: i64) -> bool {
        let mut state = self.state.lock().await;
        let mut changed = false;
        for member in state.party.iter_mut() {
            if (member.id == id || member.name == name) && member.hp.current != current {
                debug!(
                    member = %member.name,
                    from = member.hp.current,
                    to = current,
                    "Syncing member HP from encounter"
                );
                member.hp.current = current;
                changed = true;
            }
        }
        changed
    }

    pub async fn snapshot(&self) -> PartySnapshot {
        let state = self.state.lock().await;
        PartySnapshot {
            party: state.party.clone(),
            active_character_id: state.active_character_id.clone(),
        }
    }
}

/// Finds party members in whatever shape the server returned: a wrapped
/// `{"characters": [...]}` object, a bare array, or one character object.
/// Entries without an id or a name are discarded.
fn decode_party(payload: &Value) -> Vec<PartyMember> {
    let list = payload
        .get("characters")
        .or_else(|| payload.get("party"))
        .unwrap_or(payload);

    let decoded: Vec<PartyMember> = match list {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        Value::Object(_) => serde_json::from_value::<PartyMember>(list.clone())
            .map(|member| vec![member])
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    decoded
        .into_iter()
        .filter(|m| !m.id.is_empty() || !m.name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::envelope::text_envelope;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubClient {
        payload: Value,
        calls: AtomicUsize,
    }

    impl StubClient {
        fn new(payload: Value) -> Self {
            Self {
                payload,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolClient for StubClient {
        async fn list_tools(&self) -> Result<Vec<crate::models::tools::ToolDefinition>> {
            Ok(Vec::new())
        }

        async fn call_tool(&self, _name: &str, _args: Value) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(text_envelope(self.payload.to_string()))
        }

        async fn is_connected(&self) -> bool {
            true
        }

        fn pending_calls(&self) -> usize {
            0
        }
    }

    fn member(id: &str, name: &str, current: i64, max: i64) -> PartyMember {
        PartyMember {
            id: id.to_string(),
            name: name.to_string(),
            hp: HitPoints { current, max },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_refresh_decodes_wrapped_character_list() {
        let client = Arc::new(StubClient::new(json!({
            "characters": [
                { "id": "pc_1", "name": "Kael", "class": "Fighter", "level": 3,
                  "hp": { "current": 21, "max": 28 }, "armorClass": 16 },
                { "id": "pc_2", "name": "Mira", "hp": { "current": 14, "max": 14 } }
            ],
            "activeCharacterId": "pc_1"
        })));
        let store = GameStateStore::new(client.clone());

        store.refresh().await.unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.party.len(), 2);
        assert_eq!(snapshot.party[0].name, "Kael");
        assert_eq!(snapshot.party[0].armor_class, Some(16));
        assert_eq!(snapshot.active_character_id.as_deref(), Some("pc_1"));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_keeps_roster_on_error_payload() {
        let client = Arc::new(StubClient::new(json!({ "error": "storage offline" })));
        let store = GameStateStore::new(client);
        store.apply_party(vec![member("pc_1", "Kael", 21, 28)]).await;

        store.refresh().await.unwrap();

        assert_eq!(store.snapshot().await.party.len(), 1);
    }

    #[tokio::test]
    async fn test_update_member_hp_matches_by_name() {
        let client = Arc::new(StubClient::new(Value::Null));
        let store = GameStateStore::new(client);
        store
            .apply_party(vec![
                member("pc_1", "Kael", 21, 28),
                member("pc_2", "Mira", 14, 14),
            ])
            .await;

        // Combat participant ids differ from character ids.
        assert!(store.update_member_hp("combatant_7", "Kael", 9).await);
        assert!(!store.update_member_hp("combatant_7", "Kael", 9).await);

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.party[0].hp, HitPoints { current: 9, max: 28 });
        assert_eq!(snapshot.party[1].hp.current, 14);
    }

    #[test]
    fn test_decode_party_accepts_bare_array_and_skips_blank_entries() {
        let payload = json!([
            { "id": "pc_1", "name": "Kael", "hp": { "current": 5, "max": 10 } },
            { "hp": { "current": 1, "max": 1 } }
        ]);
        let members = decode_party(&payload);
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, "pc_1");
    }
}
