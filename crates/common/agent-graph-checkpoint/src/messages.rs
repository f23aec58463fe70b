//! Presentation view of the `messages` channel.
//!
//! This is the only place that interprets payload contents. Messages are
//! accepted in the shapes producers commonly persist: `{"type": ...}`,
//! `{"role": ...}`, and serialized constructors
//! (`{"lc": 1, "id": [..., "HumanMessage"], "kwargs": {...}}`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::Payload;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    /// `user`, `assistant`, `tool`, `system`, or the producer's own type.
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
}

impl MessageView {
    pub fn from_value(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self {
                role: "assistant".to_string(),
                content: render_content(Some(value)),
                tool_calls: None,
            };
        };

        let (kind, fields) = match constructor_fields(object) {
            Some((class, kwargs)) => (Some(class_to_type(class)), kwargs),
            None => (
                object
                    .get("type")
                    .or_else(|| object.get("role"))
                    .and_then(Value::as_str),
                object,
            ),
        };

        let role = normalize_role(kind);
        let tool_calls = if role == "assistant" {
            fields
                .get("tool_calls")
                .and_then(Value::as_array)
                .filter(|calls| !calls.is_empty())
                .cloned()
        } else {
            None
        };

        Self {
            role,
            content: render_content(fields.get("content")),
            tool_calls,
        }
    }
}

/// Message views of a payload's `messages` channel, in order.
pub fn extract_messages(payload: &Payload) -> Vec<MessageView> {
    payload.messages().iter().map(MessageView::from_value).collect()
}

fn constructor_fields(object: &Map<String, Value>) -> Option<(&str, &Map<String, Value>)> {
    let class = object.get("id")?.as_array()?.last()?.as_str()?;
    let kwargs = object.get("kwargs")?.as_object()?;
    Some((class, kwargs))
}

fn class_to_type(class: &str) -> &str {
    match class {
        "HumanMessage" | "HumanMessageChunk" => "human",
        "AIMessage" | "AIMessageChunk" => "ai",
        "ToolMessage" | "ToolMessageChunk" => "tool",
        "SystemMessage" | "SystemMessageChunk" => "system",
        other => other,
    }
}

fn normalize_role(kind: Option<&str>) -> String {
    match kind {
        Some("human" | "user") => "user".to_string(),
        Some("ai" | "assistant") => "assistant".to_string(),
        Some("tool") => "tool".to_string(),
        Some("system") => "system".to_string(),
        Some(other) => other.to_string(),
        None => "assistant".to_string(),
    }
}

fn render_content(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::MESSAGES_CHANNEL;

    #[test]
    fn test_type_and_role_shapes() {
        let payload = Payload::new().with_channel(
            MESSAGES_CHANNEL,
            json!([
                {"type": "human", "content": "Hello"},
                {"role": "assistant", "content": "Hi there!"},
                {"type": "tool", "content": "42", "tool_call_id": "call-1"},
                {"type": "system", "content": "be brief"},
                {"type": "function", "content": "legacy"}
            ]),
        );

        let roles: Vec<_> = extract_messages(&payload)
            .into_iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(roles, ["user", "assistant", "tool", "system", "function"]);
    }

    #[test]
    fn test_constructor_shape_with_tool_calls() {
        let message = json!({
            "lc": 1,
            "type": "constructor",
            "id": ["langchain", "schema", "messages", "AIMessage"],
            "kwargs": {
                "content": "",
                "tool_calls": [{"name": "search", "args": {"q": "rust"}, "id": "call-1"}]
            }
        });

        let view = MessageView::from_value(&message);
        assert_eq!(view.role, "assistant");
        assert_eq!(view.content, "");
        assert_eq!(view.tool_calls.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn test_non_string_content_is_rendered_as_json() {
        let view = MessageView::from_value(&json!({
            "type": "human",
            "content": [{"type": "text", "text": "hi"}]
        }));
        assert_eq!(view.content, r#"[{"type":"text","text":"hi"}]"#);

        let bare = MessageView::from_value(&json!("plain"));
        assert_eq!(bare.role, "assistant");
        assert_eq!(bare.content, "plain");
    }

    #[test]
    fn test_empty_tool_calls_are_dropped() {
        let view = MessageView::from_value(&json!({
            "type": "ai",
            "content": "done",
            "tool_calls": []
        }));
        assert!(view.tool_calls.is_none());
    }
}
