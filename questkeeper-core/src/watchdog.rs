// questkeeper-core/src/watchdog.rs

//! Diagnostic log ring and in-process bug reporting.
//!
//! The watchdog keeps the last hundred diagnostic lines and can assemble a
//! bug report with a snapshot of connection and combat state attached. Two
//! local tools ride alongside the game server's catalog so the model can
//! file a report or read the recent diagnostics itself.

use crate::mcp::client::ToolClient;
use crate::mcp::envelope::{error_envelope, text_envelope};
use crate::models::tools::ToolDefinition;
use crate::stores::combat::CombatStore;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

const LOG_BUFFER_CAPACITY: usize = 100;

pub const SUBMIT_BUG_REPORT: &str = "submit_bug_report";
pub const GET_RECENT_LOGS: &str = "get_recent_logs";

/// Ring buffer of the most recent diagnostic lines, oldest evicted first.
pub struct LogBuffer {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(LOG_BUFFER_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Records one line as `[timestamp] [source] message`.
    pub async fn record(&self, source: &str, message: impl AsRef<str>) {
        let line = format!(
            "[{}] [{}] {}",
            Utc::now().to_rfc3339(),
            source,
            message.as_ref()
        );
        let mut entries = self.entries.lock().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(line);
    }

    /// The last `limit` lines in chronological order.
    pub async fn recent(&self, limit: usize) -> Vec<String> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .skip(entries.len().saturating_sub(limit))
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<String> {
        self.entries.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Serialize, Debug, Clone)]
pub struct BugReport {
    pub id: Uuid,
    pub severity: Severity,
    pub description: String,
    pub context: Value,
    pub recent_logs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

pub struct Watchdog {
    logs: Arc<LogBuffer>,
    client: Arc<dyn ToolClient>,
    combat: Arc<CombatStore>,
}

impl Watchdog {
    pub fn new(logs: Arc<LogBuffer>, client: Arc<dyn ToolClient>, combat: Arc<CombatStore>) -> Self {
        Self {
            logs,
            client,
            combat,
        }
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    /// Snapshot of connection and combat state for report context.
    pub async fn capture_context(&self) -> Value {
        let vitals = self.combat.vitals().await;
        json!({
            "timestamp": Utc::now().to_rfc3339(),
            "mcp": {
                "connected": self.client.is_connected().await,
                "pendingRequests": self.client.pending_calls(),
            },
            "combat": {
                "isCombatActive": vitals.is_combat_active,
                "participantCount": vitals.participant_count,
                "round": vitals.round,
                "currentTurnName": vitals.current_turn_name,
            },
        })
    }

    /// Assembles and records a bug report. Caller-supplied context keys
    /// override the captured ones.
    pub async fn submit_report(
        &self,
        severity: Severity,
        description: &str,
        extra_context: Option<Value>,
    ) -> Result<BugReport> {
        let description = description.trim();
        if description.is_empty() {
            bail!("bug report description must not be empty");
        }

        let mut context = self.capture_context().await;
        if let (Value::Object(base), Some(Value::Object(extra))) = (&mut context, extra_context) {
            for (key, value) in extra {
                base.insert(key, value);
            }
        }

        let report = BugReport {
            id: Uuid::new_v4(),
            severity,
            description: description.to_string(),
            context,
            recent_logs: self.logs.all().await,
            created_at: Utc::now(),
        };
        error!(
            report_id = %report.id,
            severity = ?report.severity,
            description = %report.description,
            "Bug report submitted"
        );
        Ok(report)
    }

    /// Runs one of the local tools, answering in the standard envelope.
    pub async fn execute_local_tool(&self, name: &str, args: &Value) -> Value {
        match name {
            SUBMIT_BUG_REPORT => {
                let severity: Severity = match args
                    .get("severity")
                    .cloned()
                    .map(serde_json::from_value)
                {
                    Some(Ok(severity)) => severity,
                    _ => {
                        return error_envelope(
                            "severity must be one of low, medium, high, critical",
                        )
                    }
                };
                let description = args
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match self
                    .submit_report(severity, description, args.get("context").cloned())
                    .await
                {
                    Ok(report) => text_envelope(format!(
                        "Bug report submitted successfully. ID: {}",
                        report.id
                    )),
                    Err(e) => error_envelope(e.to_string()),
                }
            }
            GET_RECENT_LOGS => {
                let logs = match args.get("limit").and_then(Value::as_u64) {
                    Some(limit) => self.logs.recent(limit as usize).await,
                    None => self.logs.all().await,
                };
                match serde_json::to_string_pretty(&logs) {
                    Ok(text) => text_envelope(text),
                    Err(e) => error_envelope(e.to_string()),
                }
            }
            other => error_envelope(format!("unknown local tool: {}", other)),
        }
    }
}

pub fn is_local_tool(name: &str) -> bool {
    name == SUBMIT_BUG_REPORT || name == GET_RECENT_LOGS
}

/// Definitions for the in-process tools merged into the server catalog.
pub fn local_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: SUBMIT_BUG_REPORT.to_string(),
            description: "Submits a bug report with severity, description, and optional \
                          context. Automatically captures recent logs and game state."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "severity": {
                        "type": "string",
                        "enum": ["low", "medium", "high", "critical"],
                        "description": "Severity of the bug"
                    },
                    "description": {
                        "type": "string",
                        "description": "Detailed description of the issue or error"
                    },
                    "context": {
                        "type": "object",
                        "description": "Additional context (JSON object)"
                    }
                },
                "required": ["severity", "description"]
            }),
        },
        ToolDefinition {
            name: GET_RECENT_LOGS.to_string(),
            description: "Retrieves the most recent diagnostic log lines captured by the \
                          watchdog."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": {
                        "type": "number",
                        "description": "Number of log lines to return (default: all)"
                    }
                },
                "required": []
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::envelope::parse_tool_payload;
    use crate::stores::game::GameStateStore;
    use async_trait::async_trait;

    struct OfflineClient;

    #[async_trait]
    impl ToolClient for OfflineClient {
        async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
            Ok(Vec::new())
        }

        async fn call_tool(&self, _name: &str, _args: Value) -> Result<Value> {
            bail!("game server offline")
        }

        async fn is_connected(&self) -> bool {
            false
        }

        fn pending_calls(&self) -> usize {
            3
        }
    }

    fn watchdog() -> Watchdog {
        let client: Arc<dyn ToolClient> = Arc::new(OfflineClient);
        let game = Arc::new(GameStateStore::new(client.clone()));
        let combat = Arc::new(CombatStore::new(client.clone(), game));
        Watchdog::new(Arc::new(LogBuffer::default()), client, combat)
    }

    #[tokio::test]
    async fn test_log_buffer_evicts_oldest_at_capacity() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.record("test", format!("line {}", i)).await;
        }

        assert_eq!(buffer.len().await, 3);
        let lines = buffer.all().await;
        assert!(lines[0].contains("line 2"));
        assert!(lines[2].contains("line 4"));
    }

    #[tokio::test]
    async fn test_recent_returns_last_lines_in_order() {
        let buffer = LogBuffer::new(10);
        for i in 0..4 {
            buffer.record("test", format!("line {}", i)).await;
        }

        let recent = buffer.recent(2).await;
        assert_eq!(recent.len(), 2);
        assert!(recent[0].contains("line 2"));
        assert!(recent[1].contains("line 3"));
        // A limit beyond the buffer returns everything.
        assert_eq!(buffer.recent(100).await.len(), 4);
    }

    #[tokio::test]
    async fn test_capture_context_reports_connection_and_combat() {
        let wd = watchdog();
        let context = wd.capture_context().await;

        assert_eq!(context["mcp"]["connected"], json!(false));
        assert_eq!(context["mcp"]["pendingRequests"], json!(3));
        assert_eq!(context["combat"]["isCombatActive"], json!(false));
    }

    #[tokio::test]
    async fn test_submit_report_attaches_logs_and_context() {
        let wd = watchdog();
        wd.logs().record("mcp", "connection dropped").await;

        let report = wd
            .submit_report(
                Severity::High,
                "Tool calls hang after reconnect",
                Some(json!({ "provider": "openai" })),
            )
            .await
            .unwrap();

        assert_eq!(report.severity, Severity::High);
        assert_eq!(report.recent_logs.len(), 1);
        assert_eq!(report.context["provider"], "openai");
        assert_eq!(report.context["mcp"]["pendingRequests"], json!(3));
    }

    #[tokio::test]
    async fn test_submit_report_rejects_blank_description() {
        let wd = watchdog();
        assert!(wd.submit_report(Severity::Low, "   ", None).await.is_err());
    }

    #[tokio::test]
    async fn test_local_tool_submit_round_trip() {
        let wd = watchdog();
        let envelope = wd
            .execute_local_tool(
                SUBMIT_BUG_REPORT,
                &json!({ "severity": "medium", "description": "Dice totals drift" }),
            )
            .await;

        let payload = parse_tool_payload(Some(&envelope), Value::Null);
        let text = payload.as_str().unwrap_or_default();
        assert!(text.starts_with("Bug report submitted successfully."));
    }

    #[tokio::test]
    async fn test_local_tool_rejects_unknown_severity() {
        let wd = watchdog();
        let envelope = wd
            .execute_local_tool(
                SUBMIT_BUG_REPORT,
                &json!({ "severity": "catastrophic", "description": "x" }),
            )
            .await;

        assert_eq!(envelope["isError"], json!(true));
    }

    #[tokio::test]
    async fn test_local_tool_recent_logs_respects_limit() {
        let wd = watchdog();
        for i in 0..5 {
            wd.logs().record("loop", format!("turn {}", i)).await;
        }

        let envelope = wd
            .execute_local_tool(GET_RECENT_LOGS, &json!({ "limit": 2 }))
            .await;
        let text = envelope["content"][0]["text"].as_str().unwrap();
        let lines: Vec<String> = serde_json::from_str(text).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("turn 4"));
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Severity::Critical).unwrap(), json!("critical"));
    }
}
