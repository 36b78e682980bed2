// questkeeper-core/src/models/chat.rs
use super::tools::ToolCall;
use serde::{Deserialize, Serialize};

/// Represents a message in the chat history sequence sent to/from the AI.
/// Can represent system, user, assistant, or tool messages.
///
/// History order is chronological and passed to providers verbatim. A turn
/// extends its history in place and never rewrites earlier entries.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,
    /// Name of the tool that produced a `tool` message. Gemini requires the
    /// function name (not the call id) when echoing results back.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".to_string(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        ChatMessage {
            role: "assistant".to_string(),
            content,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            ..Default::default()
        }
    }

    /// A `tool` message carrying one call's result back to the model.
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        ChatMessage {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_call_id: Some(call_id.into()),
            name: Some(tool_name.into()),
            ..Default::default()
        }
    }
}

/// One complete model response: narration text and/or requested tool calls.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl LlmResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// The assistant history entry recording this response.
    pub fn to_assistant_message(&self) -> ChatMessage {
        ChatMessage::assistant(self.content.clone(), self.tool_calls.clone())
    }
}
