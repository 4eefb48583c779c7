//! The single inbound operation the core exposes to northbound adapters
//! (spec.md §6): `Chat(ctx, messages, model, tools, priorToolResults) -> events, usage`.

use tokio_util::sync::CancellationToken;

use crate::relay::credential_store::SharedCredentialStore;
use crate::relay::credit_cache::CreditCache;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::health_tracker::HealthTracker;
use crate::relay::scheduler::Scheduler;
use crate::relay::stream::sanitize::{Message, Role, ToolResult, ToolSpec};
use crate::relay::stream::{StreamEngine, StreamEvent};

pub use crate::relay::stream::engine::Usage;

/// One inbound chat turn, as an adapter would build it from its own dialect.
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// `""` means "let the vendor pick its default model".
    pub model: String,
    pub tools: Vec<ToolSpec>,
    /// Results for tool calls the adapter ran on the vendor's behalf since
    /// the last `Chat` call, distinct from any `toolResults` already
    /// embedded in `messages`. Merged onto the trailing user turn (or a new
    /// one, if the conversation doesn't already end on a user turn) before
    /// sanitization runs.
    pub prior_tool_results: Vec<ToolResult>,
}

/// Merge `prior_tool_results` (spec.md §6's `priorToolResults`) onto the
/// trailing user message, synthesizing one if the conversation doesn't
/// already end on a user turn.
fn merge_prior_tool_results(mut messages: Vec<Message>, prior_tool_results: Vec<ToolResult>) -> Vec<Message> {
    if prior_tool_results.is_empty() {
        return messages;
    }
    match messages.last_mut() {
        Some(m) if m.role == Role::User => {
            m.tool_results.extend(prior_tool_results);
        }
        _ => {
            let mut synthesized = Message::user("");
            synthesized.tool_results = prior_tool_results;
            messages.push(synthesized);
        }
    }
    messages
}

/// Result of a completed `Chat` call: final usage plus which account served
/// it, so the adapter can attribute the request without the scheduler
/// having to thread the id through every layer (spec.md §9's redesign note
/// replacing `GetLastSelectedAccountId`).
pub struct ChatResult {
    pub usage: Usage,
    pub account_id: String,
}

/// Picks an account, issues the streamed request, and reports the outcome.
/// `on_event` is invoked once per decoded event in arrival order, and is
/// always terminated by a [`StreamEvent::Done`] call even on error. `cancel`
/// is the caller's context (spec.md §6's `ctx`): cancelling it tears down
/// the in-flight stream and surfaces [`RelayError::Cancelled`].
pub async fn chat(
    store: &SharedCredentialStore,
    health: &HealthTracker,
    credits: &CreditCache,
    cancel: &CancellationToken,
    request: ChatRequest,
    on_event: impl FnMut(StreamEvent),
) -> RelayResult<ChatResult> {
    let accounts = store.list().await?;
    let scheduler = Scheduler::new(health, credits);
    let account_id = scheduler.select(&accounts).await?;
    let account = accounts
        .into_iter()
        .find(|a| a.id == account_id)
        .ok_or_else(|| RelayError::UnknownAccount(account_id.clone()))?;

    let messages = merge_prior_tool_results(request.messages, request.prior_tool_results);

    let engine = StreamEngine::new(health);
    let outcome = engine
        .run(&account, messages, &request.model, &request.tools, cancel, on_event)
        .await?;

    Ok(ChatResult {
        usage: outcome.usage,
        account_id: outcome.account_id,
    })
}
