//! Ties sanitization, envelope construction, request issuance, frame
//! decoding, event dispatch, and outcome reporting together
//! (spec.md §4.5.3, §4.5.5, §4.5.8).

use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::relay::account::Account;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::health_tracker::HealthTracker;
use crate::relay::http_pool::get_or_create_client;

use super::envelope::build_envelope;
use super::events::{extract_raw_string_field, StreamEvent, Utf8ContinuationBuffer};
use super::framing;
use super::sanitize::{sanitize, Message, ToolSpec};
use super::tool_assembly::{FeedResult, ToolUseAssembler};

const USER_AGENT: &str = "KiroIDE/0.1.0 (relay)";

/// Aggregated usage for one `Chat` call, handed back alongside the final
/// `done` callback invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub reasoning: u64,
    pub credits: f64,
}

/// Result of running one full streamed request.
pub struct StreamOutcome {
    pub usage: Usage,
    pub account_id: String,
}

/// Builds and issues the upstream request, decodes its event-stream
/// response, and dispatches typed events to `on_event`.
pub struct StreamEngine<'a> {
    health: &'a HealthTracker,
}

impl<'a> StreamEngine<'a> {
    pub fn new(health: &'a HealthTracker) -> Self {
        Self { health }
    }

    /// Run one chat turn against `account`. `on_event` is invoked for every
    /// decoded event in arrival order; [`StreamEvent::Done`] is always the
    /// last call, even on error (so callers can always finalize UI state).
    /// `cancel` is the caller's context (spec.md §6's `ctx`): if it fires
    /// before the request completes, the in-flight HTTPS call is dropped and
    /// [`RelayError::Cancelled`] is returned without touching the breaker
    /// (spec.md §7's "caller cancellation / deadline" row).
    pub async fn run(
        &self,
        account: &Account,
        messages: Vec<Message>,
        model: &str,
        tools: &[ToolSpec],
        cancel: &CancellationToken,
        mut on_event: impl FnMut(StreamEvent),
    ) -> RelayResult<StreamOutcome> {
        let sanitized = sanitize(messages);
        let body = build_envelope(&sanitized, model, tools);

        let access_token = account
            .access_token
            .as_ref()
            .ok_or_else(|| RelayError::UnknownAccount(account.id.clone()))?;

        let url = format!("https://{}/generateAssistantResponse", account.data_plane_host());
        let client = get_or_create_client(&format!("https://{}", account.data_plane_host()));

        let request = async {
            let response = client
                .post(&url)
                .bearer_auth(access_token)
                .header("Accept", "application/vnd.amazon.eventstream")
                .header("User-Agent", USER_AGENT)
                .json(&body)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(RelayError::UpstreamHttp { status, body });
            }

            dispatch_event_stream(response.bytes_stream(), &mut on_event).await
        };

        let result = tokio::select! {
            r = request => r,
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
        };

        on_event(StreamEvent::Done);

        match &result {
            Ok(_) => self.health.record_success(&account.id).await,
            Err(e) if e.breaks_breaker() => self.health.record_failure(&account.id).await,
            Err(_) => {}
        }

        result.map(|usage| StreamOutcome {
            usage,
            account_id: account.id.clone(),
        })
    }
}

async fn dispatch_event_stream(
    mut byte_stream: impl futures_util::Stream<Item = reqwest::Result<Bytes>> + Unpin,
    on_event: &mut impl FnMut(StreamEvent),
) -> RelayResult<Usage> {
    let mut residual: Vec<u8> = Vec::new();
    let mut text_buffer = Utf8ContinuationBuffer::new();
    let mut reasoning_buffer = Utf8ContinuationBuffer::new();
    let mut tool_assembler = ToolUseAssembler::new();
    let mut usage = Usage::default();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(|e| RelayError::Transport(e.to_string()))?;
        residual.extend_from_slice(&chunk);

        loop {
            if residual.len() < 4 {
                break;
            }
            let total_len = u32::from_be_bytes(residual[0..4].try_into().unwrap()) as usize;
            if residual.len() < total_len {
                break;
            }
            let frame_bytes: Vec<u8> = residual.drain(..total_len).collect();
            let frame = framing::decode(&frame_bytes)?;

            if frame.message_type() == Some("error") {
                let message = String::from_utf8_lossy(&frame.payload).into_owned();
                return Err(RelayError::UpstreamStream { message });
            }
            if frame.message_type() != Some("event") {
                continue;
            }

            dispatch_event(
                frame.event_type().unwrap_or_default(),
                &frame.payload,
                &mut text_buffer,
                &mut reasoning_buffer,
                &mut tool_assembler,
                &mut usage,
                on_event,
            );
        }
    }

    let trailing_text = text_buffer.flush();
    if !trailing_text.is_empty() {
        on_event(StreamEvent::TextDelta(trailing_text));
    }
    let trailing_reasoning = reasoning_buffer.flush();
    if !trailing_reasoning.is_empty() {
        on_event(StreamEvent::ReasoningDelta(trailing_reasoning));
    }

    Ok(usage)
}

fn dispatch_event(
    event_type: &str,
    payload: &[u8],
    text_buffer: &mut Utf8ContinuationBuffer,
    reasoning_buffer: &mut Utf8ContinuationBuffer,
    tool_assembler: &mut ToolUseAssembler,
    usage: &mut Usage,
    on_event: &mut impl FnMut(StreamEvent),
) {
    match event_type {
        "assistantResponseEvent" => {
            if let Some(bytes) = extract_raw_string_field(payload, "content") {
                let delta = text_buffer.push(bytes);
                if !delta.is_empty() {
                    on_event(StreamEvent::TextDelta(delta));
                }
            }
        }
        "reasoningContentEvent" => {
            if let Some(bytes) = extract_raw_string_field(payload, "text") {
                let delta = reasoning_buffer.push(bytes);
                if !delta.is_empty() {
                    on_event(StreamEvent::ReasoningDelta(delta));
                }
            }
        }
        "messageMetadataEvent" => {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
                if let Some(token_usage) = value.get("tokenUsage") {
                    let uncached = token_usage["uncached"].as_u64().unwrap_or(0);
                    let cache_read = token_usage["cacheRead"].as_u64().unwrap_or(0);
                    let cache_write = token_usage["cacheWrite"].as_u64().unwrap_or(0);
                    usage.input_tokens = uncached + cache_read + cache_write;
                    usage.output_tokens = token_usage["outputTokens"].as_u64().unwrap_or(0);
                    usage.cache_read = cache_read;
                    usage.cache_write = cache_write;
                    usage.reasoning = token_usage["reasoning"].as_u64().unwrap_or(0);
                    on_event(StreamEvent::Usage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        cache_read: usage.cache_read,
                        cache_write: usage.cache_write,
                        reasoning: usage.reasoning,
                    });
                }
            }
        }
        "meteringEvent" => {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
                let delta = value["usage"].as_f64().unwrap_or(0.0);
                usage.credits += delta;
                on_event(StreamEvent::CreditsDelta(delta));
            }
        }
        "toolUseEvent" => {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
                let id = value["toolUseId"].as_str().unwrap_or_default().to_string();
                let name = value["name"].as_str().unwrap_or_default().to_string();
                let input_fragment = match value.get("input") {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                let stop = value["stop"].as_bool().unwrap_or(false);
                match tool_assembler.feed(&id, &name, &input_fragment, stop) {
                    FeedResult::Pending => {}
                    FeedResult::Completed(call) => on_event(StreamEvent::ToolUse(call)),
                    FeedResult::Unrecoverable { message, tool_use_id } => {
                        debug!("tool input for {tool_use_id} could not be repaired");
                        on_event(StreamEvent::Advisory(message));
                    }
                }
            }
        }
        "supplementaryWebLinksEvent" | "codeReferenceEvent" | "followupPromptEvent"
        | "citationEvent" | "contextUsageEvent" | "invalidStateEvent" => {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
                on_event(StreamEvent::Advisory(value.to_string()));
            }
        }
        other => {
            warn!("unrecognized event-stream event type: {other}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::account::Account;
    use crate::relay::config::BreakerConfig;
    use crate::relay::health_tracker::CircuitState;
    use chrono::Utc;
    use futures_util::stream;

    fn account() -> Account {
        Account {
            id: "acct1".to_string(),
            access_token: Some("tok".to_string()),
            refresh_token: None,
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            client_id: None,
            client_secret: None,
            profile_arn: None,
            identity: None,
            region: "us-east-1".to_string(),
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    fn event_frame(event_type: &str, payload: &[u8]) -> Vec<u8> {
        let mut headers = Vec::new();
        headers.extend(framing::encode_string_header(":message-type", "event"));
        headers.extend(framing::encode_string_header(":event-type", event_type));
        framing::encode(&headers, payload)
    }

    #[tokio::test]
    async fn dispatch_decodes_text_and_usage_events() {
        let mut frames = Vec::new();
        frames.extend(event_frame("assistantResponseEvent", br#"{"content":"hi"}"#));
        frames.extend(event_frame(
            "messageMetadataEvent",
            br#"{"tokenUsage":{"uncached":10,"cacheRead":0,"cacheWrite":0,"outputTokens":5,"reasoning":0}}"#,
        ));

        let byte_stream = stream::iter(vec![Ok::<_, reqwest::Error>(Bytes::from(frames))]);

        let mut events = Vec::new();
        let usage = dispatch_event_stream(byte_stream, &mut |e| events.push(e))
            .await
            .unwrap();

        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta(t) if t == "hi")));
    }

    #[tokio::test]
    async fn error_message_type_terminates_stream() {
        let mut headers = Vec::new();
        headers.extend(framing::encode_string_header(":message-type", "error"));
        let frame = framing::encode(&headers, b"boom");
        let byte_stream = stream::iter(vec![Ok::<_, reqwest::Error>(Bytes::from(frame))]);
        let mut events = Vec::new();
        let result = dispatch_event_stream(byte_stream, &mut |e| events.push(e)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn crc_failure_propagates_as_error() {
        let mut frame = event_frame("assistantResponseEvent", br#"{"content":"hi"}"#);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let byte_stream = stream::iter(vec![Ok::<_, reqwest::Error>(Bytes::from(frame))]);
        let mut events = Vec::new();
        let result = dispatch_event_stream(byte_stream, &mut |e| events.push(e)).await;
        assert!(matches!(result, Err(RelayError::FrameCrcMismatch)));
    }

    #[tokio::test]
    async fn health_tracker_untouched_on_success() {
        let health = HealthTracker::new(BreakerConfig::default());
        assert_eq!(health.state(&account().id).await, CircuitState::Closed);
        health.record_success(&account().id).await;
        assert_eq!(health.state(&account().id).await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn already_cancelled_token_short_circuits_the_request() {
        let health = HealthTracker::new(BreakerConfig::default());
        let engine = StreamEngine::new(&health);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine
            .run(
                &account(),
                vec![Message::user("hi")],
                "",
                &[],
                &cancel,
                |_| {},
            )
            .await;

        assert!(matches!(result, Err(RelayError::Cancelled)));
        // cancellation is non-breaking (spec.md §7).
        assert_eq!(health.state(&account().id).await, CircuitState::Closed);
    }

    #[test]
    fn upstream_stream_error_honors_non_breaking_phrases() {
        let breaking = RelayError::UpstreamStream {
            message: "boom".to_string(),
        };
        assert!(breaking.breaks_breaker());

        let non_breaking = RelayError::UpstreamStream {
            message: "Model temporarily unavailable".to_string(),
        };
        assert!(!non_breaking.breaks_breaker());
    }
}
