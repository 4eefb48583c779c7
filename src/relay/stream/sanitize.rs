//! Conversation sanitization (spec.md §4.5.1).
//!
//! A pure, I/O-free pipeline of five fixed phases, applied in order since
//! each assumes its predecessors' invariants hold. Purity is what makes the
//! fixed-point and alternation properties (P1, P3) straightforward to test.

use serde_json::Value;

/// A message's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// An inline image attached to a user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBlock {
    pub format: String,
    pub bytes: Vec<u8>,
}

/// One call the assistant made during its turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolResultStatus {
    Success,
    Error,
}

/// The outcome of one tool call, reported back to the model in the next
/// user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub status: ToolResultStatus,
    pub content: Vec<String>,
}

/// A tool definition offered to the model, sent once with the current turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub images: Vec<ImageBlock>,
    pub tool_uses: Vec<ToolUse>,
    pub tool_results: Vec<ToolResult>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            images: Vec::new(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            images: Vec::new(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.text.is_empty() && self.images.is_empty() && self.tool_uses.is_empty()
    }
}

/// Run the full 5-phase sanitization pipeline.
pub fn sanitize(messages: Vec<Message>) -> Vec<Message> {
    let messages = start_with_user(messages);
    let messages = drop_empty_user_messages(messages);
    let messages = ensure_tool_pairing(messages);
    let messages = alternate_roles(messages);
    end_with_user(messages)
}

/// Phase 1 — prepend a synthetic `user: "Hello"` if the conversation opens
/// with an assistant turn.
fn start_with_user(mut messages: Vec<Message>) -> Vec<Message> {
    match messages.first() {
        None => vec![Message::user("Hello")],
        Some(m) if m.role == Role::Assistant => {
            messages.insert(0, Message::user("Hello"));
            messages
        }
        _ => messages,
    }
}

/// Phase 2 — drop empty user messages, except the first message and any user
/// message carrying tool-results.
fn drop_empty_user_messages(messages: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    for (i, m) in messages.into_iter().enumerate() {
        if i > 0 && m.role == Role::User && m.is_empty() && m.tool_results.is_empty() {
            continue;
        }
        out.push(m);
    }
    out
}

/// Phase 3 — every assistant tool-use must be answered, in the immediately
/// following message, by a user tool-result with a matching id. Missing or
/// mismatched coverage synthesizes a user message with one `status: error`
/// result per orphaned id.
fn ensure_tool_pairing(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        let current = messages[i].clone();
        let is_assistant_with_tool_uses =
            current.role == Role::Assistant && !current.tool_uses.is_empty();
        out.push(current.clone());

        if is_assistant_with_tool_uses {
            let next = messages.get(i + 1);
            let covered: Vec<&str> = next
                .filter(|m| m.role == Role::User)
                .map(|m| {
                    m.tool_results
                        .iter()
                        .map(|r| r.tool_use_id.as_str())
                        .collect()
                })
                .unwrap_or_default();

            let orphaned: Vec<&ToolUse> = current
                .tool_uses
                .iter()
                .filter(|tu| !covered.contains(&tu.id.as_str()))
                .collect();

            if !orphaned.is_empty() {
                let synthesized_results = orphaned
                    .iter()
                    .map(|tu| ToolResult {
                        tool_use_id: tu.id.clone(),
                        status: ToolResultStatus::Error,
                        content: vec!["Tool execution failed".to_string()],
                    })
                    .collect::<Vec<_>>();

                match next {
                    Some(n) if n.role == Role::User => {
                        // Existing next user message is missing some ids;
                        // merge the synthesized results into it in-place.
                        let mut merged = messages[i + 1].clone();
                        merged.tool_results.extend(synthesized_results);
                        out.push(merged);
                        i += 2;
                        continue;
                    }
                    _ => {
                        out.push(Message {
                            role: Role::User,
                            text: String::new(),
                            images: Vec::new(),
                            tool_uses: Vec::new(),
                            tool_results: synthesized_results,
                        });
                        i += 1;
                        continue;
                    }
                }
            }
        }
        i += 1;
    }
    out
}

/// Phase 4 — wherever two consecutive messages share a role, insert a
/// minimal placeholder of the opposite role rather than merging (merging
/// would collapse tool-use/tool-result structure).
fn alternate_roles(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for m in messages {
        if let Some(last) = out.last() {
            if last.role == m.role {
                let placeholder = match m.role {
                    Role::User => Message::assistant("Understood."),
                    Role::Assistant => Message::user("Continue."),
                };
                out.push(placeholder);
            }
        }
        out.push(m);
    }
    out
}

/// Phase 5 — append a synthetic `user: "Continue."` if the conversation
/// closes on an assistant turn.
fn end_with_user(mut messages: Vec<Message>) -> Vec<Message> {
    match messages.last() {
        Some(m) if m.role == Role::Assistant => {
            messages.push(Message::user("Continue."));
            messages
        }
        _ => messages,
    }
}
