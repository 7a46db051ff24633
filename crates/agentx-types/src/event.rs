// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Event taxonomy: raw driver stream events, layered semantic events, and the
//! bus envelope that carries both.
//!
//! Wire shape of one event (also the `stream.event` notification payload):
//!
//! ```json
//! { "uuid": "...", "timestamp": "...", "type": "text_delta",
//!   "data": { "text": "hi" },
//!   "context": { "agentId": "...", "sessionId": "...", "containerId": "..." } }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::MessageRecord;

// ─── Usage and pricing ────────────────────────────────────────────────────────

/// Token usage reported by a driver for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
    #[serde(default)]
    pub cache_write_tokens: u32,
}

impl Usage {
    /// Merge a partial usage report into the running total.  Providers split
    /// input counts (message_start) from output counts (message_delta), so
    /// each field takes the max rather than summing double-reports.
    pub fn absorb(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.max(other.cache_read_tokens);
        self.cache_write_tokens = self.cache_write_tokens.max(other.cache_write_tokens);
    }
}

/// Per-token prices, USD per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Pricing {
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self { input_per_mtok, output_per_mtok }
    }

    /// Dollar cost of `usage` at these prices.
    pub fn cost_usd(&self, usage: &Usage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_mtok
            + usage.output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

// ─── Driver stream events ─────────────────────────────────────────────────────

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    ContentFilter,
    Other,
}

/// Vendor-neutral streaming event.  Every driver translates its provider's
/// wire format into this taxonomy, in vendor order, and terminates the stream
/// with `MessageStop` (+ a `MessageDelta` carrying the stop reason) or with
/// `Interrupted` / `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DriveableEvent {
    MessageStart,
    TextContentBlockStart {
        index: u32,
    },
    TextDelta {
        text: String,
    },
    TextContentBlockStop {
        index: u32,
    },
    ToolUseContentBlockStart {
        index: u32,
        id: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    InputJsonDelta {
        index: u32,
        partial_json: String,
    },
    ToolUseContentBlockStop {
        index: u32,
    },
    /// Result of a tool execution re-injected into the same call's stream
    /// when the vendor supports in-call tool loops.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename_all = "camelCase")]
    MessageDelta {
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
    },
    MessageStop,
    Interrupted,
    Error {
        message: String,
    },
}

impl DriveableEvent {
    /// Stable leaf name used for subscription matching.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageStart => "message_start",
            Self::TextContentBlockStart { .. } => "text_content_block_start",
            Self::TextDelta { .. } => "text_delta",
            Self::TextContentBlockStop { .. } => "text_content_block_stop",
            Self::ToolUseContentBlockStart { .. } => "tool_use_content_block_start",
            Self::InputJsonDelta { .. } => "input_json_delta",
            Self::ToolUseContentBlockStop { .. } => "tool_use_content_block_stop",
            Self::ToolResult { .. } => "tool_result",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageStop => "message_stop",
            Self::Interrupted => "interrupted",
            Self::Error { .. } => "error",
        }
    }

    /// True for events that end a drive stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MessageStop | Self::Interrupted | Self::Error { .. })
    }
}

// ─── Semantic events ──────────────────────────────────────────────────────────

/// Conversation state as tracked by the engine's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Idle,
    Queued,
    Thinking,
    Responding,
    PlanningTool,
    ExecutingTool,
    Error,
}

/// Events the engine derives from the raw stream: complete messages, state
/// transitions, and turn boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SemanticEvent {
    UserMessage {
        message: MessageRecord,
    },
    AssistantMessage {
        message: MessageRecord,
    },
    ToolResultMessage {
        message: MessageRecord,
    },
    ErrorMessage {
        message: MessageRecord,
    },
    ConversationState {
        from: ConversationStatus,
        to: ConversationStatus,
    },
    #[serde(rename_all = "camelCase")]
    TurnRequest {
        turn_id: String,
    },
    #[serde(rename_all = "camelCase")]
    TurnResponse {
        turn_id: String,
        duration_ms: u64,
        usage: Usage,
        cost_usd: f64,
    },
    /// Terminal turn outcome when the stream ended in `error` or
    /// `interrupted` instead of a clean stop.
    #[serde(rename_all = "camelCase")]
    TurnError {
        turn_id: String,
        message: String,
    },
}

impl SemanticEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::AssistantMessage { .. } => "assistant_message",
            Self::ToolResultMessage { .. } => "tool_result_message",
            Self::ErrorMessage { .. } => "error_message",
            Self::ConversationState { .. } => "conversation_state",
            Self::TurnRequest { .. } => "turn_request",
            Self::TurnResponse { .. } => "turn_response",
            Self::TurnError { .. } => "turn_error",
        }
    }
}

// ─── Bus envelope ─────────────────────────────────────────────────────────────

/// Union of everything that travels on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Stream(DriveableEvent),
    Semantic(SemanticEvent),
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stream(e) => e.kind(),
            Self::Semantic(e) => e.kind(),
        }
    }
}

impl From<DriveableEvent> for EventPayload {
    fn from(e: DriveableEvent) -> Self {
        Self::Stream(e)
    }
}

impl From<SemanticEvent> for EventPayload {
    fn from(e: SemanticEvent) -> Self {
        Self::Semantic(e)
    }
}

/// Scoping ids attached to every event an agent emits, so multi-agent bus
/// consumers can route correctly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

/// The envelope published on the bus and forwarded over `stream.event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub uuid: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<EventContext>,
}

impl Event {
    pub fn new(payload: impl Into<EventPayload>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload: payload.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Session id from the context, if any — the usual fan-out topic.
    pub fn topic(&self) -> Option<&str> {
        self.context.as_ref().and_then(|c| c.session_id.as_deref())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_event_wire_shape() {
        let ev = Event::new(DriveableEvent::TextDelta { text: "hi".into() });
        let j = serde_json::to_value(&ev).unwrap();
        assert_eq!(j["type"], "text_delta");
        assert_eq!(j["data"]["text"], "hi");
        assert!(j.get("uuid").is_some());
        assert!(j.get("timestamp").is_some());
    }

    #[test]
    fn unit_variants_serialize_without_data() {
        let j = serde_json::to_value(DriveableEvent::MessageStop).unwrap();
        assert_eq!(j["type"], "message_stop");
    }

    #[test]
    fn every_event_round_trips() {
        let cases: Vec<EventPayload> = vec![
            DriveableEvent::MessageStart.into(),
            DriveableEvent::TextContentBlockStart { index: 0 }.into(),
            DriveableEvent::TextDelta { text: "x".into() }.into(),
            DriveableEvent::TextContentBlockStop { index: 0 }.into(),
            DriveableEvent::ToolUseContentBlockStart {
                index: 1,
                id: "c1".into(),
                name: "get_weather".into(),
            }
            .into(),
            DriveableEvent::InputJsonDelta { index: 1, partial_json: "{\"ci".into() }.into(),
            DriveableEvent::ToolUseContentBlockStop { index: 1 }.into(),
            DriveableEvent::ToolResult {
                tool_call_id: "c1".into(),
                content: "sunny".into(),
                is_error: false,
            }
            .into(),
            DriveableEvent::MessageDelta {
                stop_reason: Some(StopReason::EndTurn),
                usage: Some(Usage { input_tokens: 3, output_tokens: 7, ..Default::default() }),
            }
            .into(),
            DriveableEvent::MessageStop.into(),
            DriveableEvent::Interrupted.into(),
            DriveableEvent::Error { message: "boom".into() }.into(),
            SemanticEvent::TurnRequest { turn_id: "turn_1".into() }.into(),
            SemanticEvent::TurnResponse {
                turn_id: "turn_1".into(),
                duration_ms: 12,
                usage: Usage::default(),
                cost_usd: 0.0,
            }
            .into(),
            SemanticEvent::ConversationState {
                from: ConversationStatus::Idle,
                to: ConversationStatus::Queued,
            }
            .into(),
            SemanticEvent::TurnError { turn_id: "turn_1".into(), message: "interrupted".into() }
                .into(),
        ];
        for payload in cases {
            let ev = Event::new(payload.clone());
            let json = serde_json::to_string(&ev).unwrap();
            let back: Event = serde_json::from_str(&json).unwrap();
            assert_eq!(back.payload, payload, "round trip failed for {}", ev.kind());
        }
    }

    #[test]
    fn usage_absorb_takes_field_max() {
        let mut total = Usage { input_tokens: 100, ..Default::default() };
        total.absorb(&Usage { output_tokens: 40, ..Default::default() });
        total.absorb(&Usage { output_tokens: 55, ..Default::default() });
        assert_eq!(total.input_tokens, 100);
        assert_eq!(total.output_tokens, 55);
    }

    #[test]
    fn pricing_cost_is_per_million() {
        let p = Pricing::new(3.0, 15.0);
        let usage = Usage { input_tokens: 1_000_000, output_tokens: 1_000_000, ..Default::default() };
        assert!((p.cost_usd(&usage) - 18.0).abs() < 1e-9);
    }

    #[test]
    fn topic_is_session_id() {
        let ev = Event::new(DriveableEvent::MessageStart).with_context(EventContext {
            session_id: Some("sess_1".into()),
            ..Default::default()
        });
        assert_eq!(ev.topic(), Some("sess_1"));
    }
}
