//! Upstream request envelope construction (spec.md §4.5.2).
//!
//! The wire body is one JSON object with a `conversationState` carrying a
//! fresh conversation id, the full history, and the current (last) message.
//! Only the current user message carries the `tools` catalog; every user
//! message (historical or current) may carry `toolResults`.

use base64::Engine;
use serde_json::{json, Value};
use uuid::Uuid;

use super::sanitize::{Message, Role, ToolResult, ToolResultStatus, ToolSpec};

const TRIGGER: &str = "MANUAL";

/// Build the full `generateAssistantResponse` request body for a sanitized
/// message list. `model` of `""` omits the model id (vendor default).
/// `tools` is attached only to the current (last) user message.
pub fn build_envelope(messages: &[Message], model: &str, tools: &[ToolSpec]) -> Value {
    assert!(!messages.is_empty(), "sanitize() never returns an empty list");

    let (history, current) = messages.split_at(messages.len() - 1);
    let current = &current[0];

    let history_json: Vec<Value> = history.iter().map(|m| message_to_json(m, model, &[])).collect();
    let current_json = current_message_to_json(current, model, tools);

    json!({
        "conversationState": {
            "conversationId": Uuid::new_v4().to_string(),
            "chatTriggerType": TRIGGER,
            "history": history_json,
            "currentMessage": current_json,
        }
    })
}

fn message_to_json(message: &Message, model: &str, _tools: &[ToolSpec]) -> Value {
    match message.role {
        Role::User => user_entry(message, model, &[], false),
        Role::Assistant => assistant_entry(message),
    }
}

fn current_message_to_json(message: &Message, model: &str, tools: &[ToolSpec]) -> Value {
    match message.role {
        Role::User => user_entry(message, model, tools, true),
        Role::Assistant => assistant_entry(message),
    }
}

fn user_entry(message: &Message, model: &str, tools: &[ToolSpec], is_current: bool) -> Value {
    let mut user_message = serde_json::Map::new();
    user_message.insert("content".to_string(), json!(message.text));
    if !model.is_empty() {
        user_message.insert("modelId".to_string(), json!(model));
    }
    if !message.images.is_empty() {
        let images: Vec<Value> = message
            .images
            .iter()
            .map(|img| {
                json!({
                    "format": img.format,
                    "bytes": base64::engine::general_purpose::STANDARD.encode(&img.bytes),
                })
            })
            .collect();
        user_message.insert("images".to_string(), json!(images));
    }

    let needs_context = is_current || !message.tool_results.is_empty();
    if needs_context {
        let mut context = serde_json::Map::new();
        if is_current && !tools.is_empty() {
            context.insert("tools".to_string(), json!(tools.iter().map(tool_spec_json).collect::<Vec<_>>()));
        }
        if !message.tool_results.is_empty() {
            context.insert(
                "toolResults".to_string(),
                json!(message.tool_results.iter().map(tool_result_json).collect::<Vec<_>>()),
            );
        }
        if !context.is_empty() {
            user_message.insert("userInputMessageContext".to_string(), Value::Object(context));
        }
    }

    json!({ "userInputMessage": user_message })
}

fn assistant_entry(message: &Message) -> Value {
    let mut assistant_message = serde_json::Map::new();
    assistant_message.insert("content".to_string(), json!(message.text));
    if !message.tool_uses.is_empty() {
        let tool_uses: Vec<Value> = message
            .tool_uses
            .iter()
            .map(|tu| {
                json!({
                    "toolUseId": tu.id,
                    "name": tu.name,
                    "input": tu.input,
                })
            })
            .collect();
        assistant_message.insert("toolUses".to_string(), json!(tool_uses));
    }
    json!({ "assistantResponseMessage": assistant_message })
}

fn tool_spec_json(spec: &ToolSpec) -> Value {
    json!({
        "name": spec.name,
        "description": spec.description,
        "inputSchema": spec.input_schema,
    })
}

fn tool_result_json(result: &ToolResult) -> Value {
    json!({
        "toolUseId": result.tool_use_id,
        "status": match result.status {
            ToolResultStatus::Success => "success",
            ToolResultStatus::Error => "error",
        },
        "content": result.content.iter().map(|text| json!({ "text": text })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::stream::sanitize::{sanitize, ToolUse};

    #[test]
    fn current_user_message_carries_tools_historical_does_not() {
        let messages = vec![
            Message::user("first"),
            Message::assistant("ack"),
            Message::user("second"),
        ];
        let messages = sanitize(messages);
        let tools = vec![ToolSpec {
            name: "web_search".to_string(),
            description: "search the web".to_string(),
            input_schema: json!({"type":"object"}),
        }];
        let envelope = build_envelope(&messages, "", &tools);
        let history = envelope["conversationState"]["history"].as_array().unwrap();
        for entry in history {
            if let Some(user) = entry.get("userInputMessage") {
                assert!(user.get("userInputMessageContext").is_none());
            }
        }
        let current = &envelope["conversationState"]["currentMessage"]["userInputMessage"];
        assert_eq!(
            current["userInputMessageContext"]["tools"][0]["name"],
            "web_search"
        );
    }

    #[test]
    fn tool_results_attach_to_their_own_user_message() {
        let messages = vec![
            Message::user("go"),
            Message {
                role: Role::Assistant,
                text: String::new(),
                images: Vec::new(),
                tool_uses: vec![ToolUse {
                    id: "T1".to_string(),
                    name: "web_search".to_string(),
                    input: Value::Null,
                }],
                tool_results: Vec::new(),
            },
        ];
        let messages = sanitize(messages);
        let envelope = build_envelope(&messages, "", &[]);
        let history = envelope["conversationState"]["history"].as_array().unwrap();
        let result_entry = history
            .iter()
            .find(|e| {
                e.get("userInputMessage")
                    .and_then(|u| u.get("userInputMessageContext"))
                    .and_then(|c| c.get("toolResults"))
                    .is_some()
            });
        assert!(result_entry.is_some());
    }

    #[test]
    fn empty_model_id_is_omitted() {
        let messages = sanitize(vec![Message::user("hi")]);
        let envelope = build_envelope(&messages, "", &[]);
        let current = &envelope["conversationState"]["currentMessage"]["userInputMessage"];
        assert!(current.get("modelId").is_none());
    }
}
