// questkeeper-core/src/mcp/envelope.rs

//! Unwrapping of game-server tool results.
//!
//! The server answers every tool call with the MCP envelope
//! `{"content": [{"type": "text", "text": <JSON-or-plain-string>}]}`, but
//! some tools (and the in-process watchdog tools) return bare values.
//! Callers always get *something* usable back: a parsed payload when the
//! envelope holds one, the raw text when it is not JSON, or the caller's
//! fallback when nothing can be extracted.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Extracts the payload from a tool result, tolerating every envelope shape
/// the server has been seen to produce.
///
/// Rules, in order: missing or null input returns `fallback`; an object
/// without a `content` key (and any array) is already a payload and is
/// returned as-is; an object with a `content` array yields its first
/// `type == "text"` item, JSON-parsed when possible and as a plain string
/// otherwise; bare scalars pass through; anything else returns `fallback`.
pub fn parse_tool_payload(result: Option<&Value>, fallback: Value) -> Value {
    let value = match result {
        None | Some(Value::Null) => return fallback,
        Some(v) => v,
    };

    match value {
        Value::Object(map) => match map.get("content") {
            None => value.clone(),
            Some(Value::Array(items)) => {
                let text = items.iter().find_map(|item| {
                    if item.get("type").and_then(Value::as_str) == Some("text") {
                        item.get("text").and_then(Value::as_str)
                    } else {
                        None
                    }
                });
                match text {
                    Some(text) => serde_json::from_str(text)
                        .unwrap_or_else(|_| Value::String(text.to_string())),
                    None => {
                        warn!("Tool result envelope had no text content item");
                        fallback
                    }
                }
            }
            Some(other) => {
                warn!(content = ?other, "Tool result 'content' was not an array");
                fallback
            }
        },
        Value::Array(_) | Value::String(_) | Value::Number(_) | Value::Bool(_) => value.clone(),
        Value::Null => fallback,
    }
}

/// Typed variant of [`parse_tool_payload`]: `None` when the payload is
/// missing or does not match `T`.
pub fn decode_payload<T: DeserializeOwned>(result: Option<&Value>) -> Option<T> {
    let value = parse_tool_payload(result, Value::Null);
    if value.is_null() {
        return None;
    }
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            debug!(error = %e, "Tool payload did not match the expected shape");
            None
        }
    }
}

/// Whether an unwrapped payload is the server's `{"error": ...}` shape.
pub fn is_error_payload(payload: &Value) -> bool {
    payload
        .as_object()
        .map_or(false, |map| map.contains_key("error"))
}

/// The message carried by an `{"error": ...}` payload.
pub fn error_message(payload: &Value) -> Option<String> {
    let error = payload.get("error")?;
    Some(match error {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Wraps text in the standard envelope, the way server tools respond.
pub fn text_envelope(text: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": text.into() }] })
}

/// Error variant of [`text_envelope`] with the MCP error flag set.
pub fn error_envelope(message: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": message.into() }], "isError": true })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_result_returns_fallback() {
        let fallback = json!({ "characters": [] });
        assert_eq!(parse_tool_payload(None, fallback.clone()), fallback);
        assert_eq!(
            parse_tool_payload(Some(&Value::Null), fallback.clone()),
            fallback
        );
    }

    #[test]
    fn envelope_round_trips_json_payload() {
        let payload = json!({ "encounterId": "enc-42", "round": 3 });
        let envelope = text_envelope(payload.to_string());
        assert_eq!(parse_tool_payload(Some(&envelope), Value::Null), payload);
    }

    #[test]
    fn object_without_content_key_passes_through() {
        let direct = json!({ "name": "Mira", "hp": 12 });
        assert_eq!(parse_tool_payload(Some(&direct), Value::Null), direct);
    }

    #[test]
    fn plain_text_payload_stays_a_string() {
        let envelope = text_envelope("You rolled a 17!");
        assert_eq!(
            parse_tool_payload(Some(&envelope), Value::Null),
            json!("You rolled a 17!")
        );
    }

    #[test]
    fn numeric_text_parses_as_number() {
        let envelope = text_envelope("17");
        assert_eq!(parse_tool_payload(Some(&envelope), Value::Null), json!(17));
    }

    #[test]
    fn bare_scalars_pass_through() {
        assert_eq!(parse_tool_payload(Some(&json!(42)), Value::Null), json!(42));
        assert_eq!(
            parse_tool_payload(Some(&json!("done")), Value::Null),
            json!("done")
        );
        assert_eq!(
            parse_tool_payload(Some(&json!(true)), Value::Null),
            json!(true)
        );
    }

    #[test]
    fn empty_content_array_returns_fallback() {
        let envelope = json!({ "content": [] });
        let fallback = json!({ "ok": false });
        assert_eq!(
            parse_tool_payload(Some(&envelope), fallback.clone()),
            fallback
        );
    }

    #[test]
    fn non_text_content_returns_fallback() {
        let envelope = json!({ "content": [{ "type": "image", "data": "..." }] });
        assert_eq!(
            parse_tool_payload(Some(&envelope), Value::Null),
            Value::Null
        );
    }

    #[test]
    fn decode_payload_recovers_typed_shapes() {
        #[derive(serde::Deserialize, PartialEq, Debug)]
        struct Roll {
            total: u32,
        }
        let envelope = text_envelope(r#"{"total": 17}"#);
        let decoded: Option<Roll> = decode_payload(Some(&envelope));
        assert_eq!(decoded, Some(Roll { total: 17 }));

        let not_a_roll: Option<Roll> = decode_payload(Some(&text_envelope("nope")));
        assert!(not_a_roll.is_none());
    }

    #[test]
    fn error_payload_helpers() {
        let payload = json!({ "error": "Item not found: x" });
        assert!(is_error_payload(&payload));
        assert_eq!(error_message(&payload), Some("Item not found: x".to_string()));
        assert!(!is_error_payload(&json!({ "ok": true })));

        let envelope = error_envelope("combat engine offline");
        let parsed = parse_tool_payload(Some(&envelope), Value::Null);
        assert_eq!(parsed, json!("combat engine offline"));
    }
}
