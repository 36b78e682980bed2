// questkeeper-core/src/models/tools.rs
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// How long a fetched tool catalog stays valid before the game server is
/// asked again.
pub const DEFAULT_TOOL_CACHE_TTL: Duration = Duration::from_secs(60);

/// A tool invocation requested by the model.
///
/// `id` is provider-issued where the wire format has one (OpenAI, Anthropic)
/// and synthesized otherwise (Gemini). `arguments` is always a parsed JSON
/// object; adapters that speak stringified arguments convert at their own
/// boundary.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Catalog entry for a tool the model may call.
///
/// The schema comes from the game server and is passed through to providers
/// untouched.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Outcome of executing a single tool call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Error(String),
}

/// Execution record for one tool call: at most one per call id.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolExecution {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub outcome: ToolOutcome,
}

impl ToolExecution {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// Payload on a success outcome, if any.
    pub fn payload(&self) -> Option<&Value> {
        match &self.outcome {
            ToolOutcome::Success(value) => Some(value),
            ToolOutcome::Error(_) => None,
        }
    }

    /// Text recorded in the `tool` history message for this execution:
    /// the success payload as compact JSON, or `{"error": message}`.
    pub fn history_content(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success(value) => value.to_string(),
            ToolOutcome::Error(message) => json!({ "error": message }).to_string(),
        }
    }
}

/// Owned cache of the game server's tool catalog with a fixed TTL.
///
/// One instance lives on the turn driver; nothing reads it ambiently.
#[derive(Debug)]
pub struct ToolCatalogCache {
    entries: Option<Vec<ToolDefinition>>,
    fetched_at: Option<Instant>,
    ttl: Duration,
}

impl ToolCatalogCache {
    pub fn new(ttl: Duration) -> Self {
        ToolCatalogCache {
            entries: None,
            fetched_at: None,
            ttl,
        }
    }

    /// Returns the cached catalog while it is still fresh.
    pub fn fresh(&self) -> Option<Vec<ToolDefinition>> {
        match (&self.entries, self.fetched_at) {
            (Some(entries), Some(at)) if at.elapsed() < self.ttl => Some(entries.clone()),
            _ => None,
        }
    }

    pub fn store(&mut self, entries: Vec<ToolDefinition>) {
        self.entries = Some(entries);
        self.fetched_at = Some(Instant::now());
    }

    /// Last stored catalog regardless of freshness. Fetch failures fall
    /// back to this rather than dropping a turn's tools.
    pub fn last_known(&self) -> Option<Vec<ToolDefinition>> {
        self.entries.clone()
    }

    pub fn invalidate(&mut self) {
        self.entries = None;
        self.fetched_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_content_renders_success_payload_as_json() {
        let execution = ToolExecution {
            call_id: "call_1".to_string(),
            tool_name: "dice_roll".to_string(),
            arguments: json!({}),
            outcome: ToolOutcome::Success(json!(17)),
        };
        assert_eq!(execution.history_content(), "17");

        let execution = ToolExecution {
            call_id: "call_2".to_string(),
            tool_name: "get_character".to_string(),
            arguments: json!({"name": "Mira"}),
            outcome: ToolOutcome::Success(json!({"name": "Mira", "hp": 12})),
        };
        assert_eq!(execution.history_content(), r#"{"hp":12,"name":"Mira"}"#);
    }

    #[test]
    fn history_content_wraps_errors() {
        let execution = ToolExecution {
            call_id: "call_3".to_string(),
            tool_name: "give_item".to_string(),
            arguments: json!({"itemId": "x"}),
            outcome: ToolOutcome::Error("Item not found: x".to_string()),
        };
        assert_eq!(
            execution.history_content(),
            r#"{"error":"Item not found: x"}"#
        );
    }

    #[test]
    fn catalog_cache_expires_after_ttl() {
        let mut cache = ToolCatalogCache::new(Duration::from_millis(20));
        assert!(cache.fresh().is_none());

        cache.store(vec![ToolDefinition {
            name: "dice_roll".to_string(),
            description: "Roll dice".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }]);
        let cached = cache.fresh().unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].name, "dice_roll");

        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.fresh().is_none());
    }

    #[test]
    fn catalog_cache_invalidate_clears_entries() {
        let mut cache = ToolCatalogCache::new(Duration::from_secs(60));
        cache.store(Vec::new());
        assert!(cache.fresh().is_some());
        cache.invalidate();
        assert!(cache.fresh().is_none());
    }
}
