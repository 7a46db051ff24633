// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The engine: a stateless Mealy machine folding driver stream events into
//! layered semantic events.
//!
//! State lives in a [`TurnState`] that exists only for the duration of one
//! `receive`; the engine itself holds nothing but configuration.  Three
//! processors co-reside in the fold:
//!
//! 1. the **assembler** accumulates deltas into content parts and, on the
//!    closing `message_stop`, a complete assistant message;
//! 2. the **state machine** maps stream boundaries onto conversation state
//!    transitions (`idle → queued → thinking → responding →
//!    (planning_tool → executing_tool → responding)* → idle | error`);
//! 3. the **turn tracker** opens a turn on the user message and closes it
//!    with duration, usage, and cost.
//!
//! `message_stop` with `stop_reason == end_turn` is the authoritative close
//! cue; a stop without a reason is tolerated and treated as `end_turn` for
//! providers that never deliver stop metadata.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::trace;

use agentx_types::{
    id, ContentPart, ConversationStatus, DriveableEvent, MessageRecord, Pricing, Role,
    SemanticEvent, StopReason, Usage,
};

// ─── Cost ─────────────────────────────────────────────────────────────────────

/// Pluggable dollar-cost computation.  The default multiplies
/// driver-reported usage by a per-token price table; a driver with
/// vendor-reported billing can substitute its own model.
pub trait CostModel: Send + Sync {
    fn cost_usd(&self, usage: &Usage) -> f64;
}

impl CostModel for Pricing {
    fn cost_usd(&self, usage: &Usage) -> f64 {
        Pricing::cost_usd(self, usage)
    }
}

// ─── Turn state ───────────────────────────────────────────────────────────────

/// A pending tool invocation assembled from a tool-use block.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Default)]
struct ToolBuf {
    id: String,
    name: String,
    json: String,
}

/// All per-turn engine state.  Created at the start of a `receive`, dropped
/// at its end; there is no cross-call state.
pub struct TurnState {
    session_id: String,
    turn_id: String,
    started_at: DateTime<Utc>,
    status: ConversationStatus,
    usage: Usage,
    last_stop: Option<StopReason>,
    /// Parts assembled in the current vendor round.  A tool round is drained
    /// into its own history record; whatever remains at `message_stop`
    /// becomes the assistant message.
    round_parts: Vec<ContentPart>,
    text_buf: Option<String>,
    tool_bufs: HashMap<u32, ToolBuf>,
    closed: bool,
}

impl TurnState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            turn_id: String::new(),
            started_at: Utc::now(),
            status: ConversationStatus::Idle,
            usage: Usage::default(),
            last_stop: None,
            round_parts: Vec::new(),
            text_buf: None,
            tool_bufs: HashMap::new(),
            closed: false,
        }
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub fn status(&self) -> ConversationStatus {
        self.status
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// True once a terminal event closed this turn.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True when the stream stopped to have tools executed: the turn stays
    /// open and the caller owes the driver another round.
    pub fn awaiting_tools(&self) -> bool {
        !self.closed && self.last_stop == Some(StopReason::ToolUse)
    }

    /// Tool calls assembled in the current round.
    pub fn pending_tool_calls(&self) -> Vec<PendingToolCall> {
        self.round_parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall { id, name, input } => Some(PendingToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Drain the current round into a history record for the driver's next
    /// round.  Rounds that requested tools persist under the `tool_call`
    /// role so a resumed session replays to the vendor in vendor order.
    /// `None` when the round produced nothing.
    pub fn take_round_message(&mut self) -> Option<MessageRecord> {
        if self.round_parts.is_empty() {
            return None;
        }
        let parts = std::mem::take(&mut self.round_parts);
        let role = if parts.iter().any(|p| matches!(p, ContentPart::ToolCall { .. })) {
            Role::ToolCall
        } else {
            Role::Assistant
        };
        Some(MessageRecord::new(&self.session_id, role, parts))
    }

    fn transition(&mut self, to: ConversationStatus) -> Option<SemanticEvent> {
        if self.status == to {
            return None;
        }
        let from = self.status;
        self.status = to;
        trace!(?from, ?to, "conversation state");
        Some(SemanticEvent::ConversationState { from, to })
    }

    fn push_part(&mut self, part: ContentPart) {
        self.round_parts.push(part);
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

/// Stateless fold configuration: prices for the cost column.
pub struct TurnEngine {
    cost: Box<dyn CostModel>,
}

impl TurnEngine {
    pub fn new(pricing: Pricing) -> Self {
        Self { cost: Box::new(pricing) }
    }

    pub fn with_cost_model(cost: Box<dyn CostModel>) -> Self {
        Self { cost }
    }

    /// Open a turn for a user message.
    pub fn fold_user(
        &self,
        state: &mut TurnState,
        at: DateTime<Utc>,
        message: &MessageRecord,
    ) -> Vec<SemanticEvent> {
        state.turn_id = id::turn_id();
        state.started_at = at;
        let mut out = vec![
            SemanticEvent::UserMessage { message: message.clone() },
            SemanticEvent::TurnRequest { turn_id: state.turn_id.clone() },
        ];
        out.extend(state.transition(ConversationStatus::Queued));
        out
    }

    /// Fold one driver stream event.  Outputs are ordered so downstream
    /// processors' products (assistant message, turn response) follow the
    /// event that triggered them.
    pub fn fold_stream(
        &self,
        state: &mut TurnState,
        at: DateTime<Utc>,
        event: &DriveableEvent,
    ) -> Vec<SemanticEvent> {
        let mut out = Vec::new();
        match event {
            DriveableEvent::MessageStart => {
                if state.status == ConversationStatus::Queued
                    || state.status == ConversationStatus::Idle
                {
                    out.extend(state.transition(ConversationStatus::Thinking));
                }
            }
            DriveableEvent::TextContentBlockStart { .. } => {
                state.text_buf = Some(String::new());
                out.extend(state.transition(ConversationStatus::Responding));
            }
            DriveableEvent::TextDelta { text } => {
                match &mut state.text_buf {
                    Some(buf) => buf.push_str(text),
                    // Tolerate drivers that skip the explicit block start.
                    None => state.text_buf = Some(text.clone()),
                }
                out.extend(state.transition(ConversationStatus::Responding));
            }
            DriveableEvent::TextContentBlockStop { .. } => {
                let text = state.text_buf.take().unwrap_or_default();
                state.push_part(ContentPart::Text { text });
            }
            DriveableEvent::ToolUseContentBlockStart { index, id, name } => {
                state.tool_bufs.insert(
                    *index,
                    ToolBuf { id: id.clone(), name: name.clone(), json: String::new() },
                );
                out.extend(state.transition(ConversationStatus::PlanningTool));
            }
            DriveableEvent::InputJsonDelta { index, partial_json } => {
                if let Some(buf) = state.tool_bufs.get_mut(index) {
                    buf.json.push_str(partial_json);
                }
            }
            DriveableEvent::ToolUseContentBlockStop { index } => {
                if let Some(buf) = state.tool_bufs.remove(index) {
                    let input = if buf.json.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&buf.json)
                            .unwrap_or(Value::String(buf.json.clone()))
                    };
                    state.push_part(ContentPart::ToolCall { id: buf.id, name: buf.name, input });
                }
                out.extend(state.transition(ConversationStatus::ExecutingTool));
            }
            DriveableEvent::ToolResult { tool_call_id, content, is_error } => {
                let message = MessageRecord::tool_result(
                    &state.session_id,
                    tool_call_id.clone(),
                    content.clone(),
                    *is_error,
                );
                out.push(SemanticEvent::ToolResultMessage { message });
            }
            DriveableEvent::MessageDelta { stop_reason, usage } => {
                if let Some(reason) = stop_reason {
                    state.last_stop = Some(*reason);
                }
                if let Some(u) = usage {
                    state.usage.absorb(u);
                }
            }
            DriveableEvent::MessageStop => {
                // A stop without a reason is tolerated as end_turn.
                let stop = state.last_stop.unwrap_or(StopReason::EndTurn);
                if stop != StopReason::ToolUse {
                    out.extend(self.close_turn(state, at));
                }
            }
            DriveableEvent::Interrupted => {
                if !state.closed {
                    state.closed = true;
                    out.extend(state.transition(ConversationStatus::Idle));
                    out.push(SemanticEvent::TurnError {
                        turn_id: state.turn_id.clone(),
                        message: "interrupted".into(),
                    });
                }
                // After message_stop the turn is already closed; ignore.
            }
            DriveableEvent::Error { message } => {
                if !state.closed {
                    state.closed = true;
                    let record = MessageRecord::error(&state.session_id, message.clone());
                    out.push(SemanticEvent::ErrorMessage { message: record });
                    out.extend(state.transition(ConversationStatus::Error));
                    out.push(SemanticEvent::TurnError {
                        turn_id: state.turn_id.clone(),
                        message: message.clone(),
                    });
                }
            }
        }
        out
    }

    fn close_turn(&self, state: &mut TurnState, at: DateTime<Utc>) -> Vec<SemanticEvent> {
        state.closed = true;

        // Flush an unterminated text block so no streamed text is lost.
        if let Some(text) = state.text_buf.take() {
            state.push_part(ContentPart::Text { text });
        }
        // A stream with zero deltas still yields an assistant message with
        // empty text content.
        if state.round_parts.is_empty() {
            state.push_part(ContentPart::Text { text: String::new() });
        }

        let parts = std::mem::take(&mut state.round_parts);
        let message = MessageRecord::assistant(&state.session_id, parts);
        let duration_ms = (at - state.started_at).num_milliseconds().max(0) as u64;
        let cost_usd = self.cost.cost_usd(&state.usage);

        let mut out = vec![SemanticEvent::AssistantMessage { message }];
        out.extend(state.transition(ConversationStatus::Idle));
        out.push(SemanticEvent::TurnResponse {
            turn_id: state.turn_id.clone(),
            duration_ms,
            usage: state.usage,
            cost_usd,
        });
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn engine() -> TurnEngine {
        TurnEngine::new(Pricing::new(3.0, 15.0))
    }

    fn run(events: &[DriveableEvent]) -> (TurnState, Vec<SemanticEvent>) {
        let engine = engine();
        let mut state = TurnState::new("sess_1");
        let user = MessageRecord::user("sess_1", "hello");
        let mut out = engine.fold_user(&mut state, Utc::now(), &user);
        for ev in events {
            out.extend(engine.fold_stream(&mut state, Utc::now(), ev));
        }
        (state, out)
    }

    fn text_stream(text: &str) -> Vec<DriveableEvent> {
        vec![
            DriveableEvent::MessageStart,
            DriveableEvent::TextContentBlockStart { index: 0 },
            DriveableEvent::TextDelta { text: text[..text.len() / 2].to_string() },
            DriveableEvent::TextDelta { text: text[text.len() / 2..].to_string() },
            DriveableEvent::TextContentBlockStop { index: 0 },
            DriveableEvent::MessageDelta {
                stop_reason: Some(StopReason::EndTurn),
                usage: Some(Usage { input_tokens: 10, output_tokens: 5, ..Default::default() }),
            },
            DriveableEvent::MessageStop,
        ]
    }

    fn kinds(out: &[SemanticEvent]) -> Vec<&'static str> {
        out.iter().map(|e| e.kind()).collect()
    }

    #[test]
    fn text_turn_produces_the_full_event_ladder() {
        let (state, out) = run(&text_stream("hello!"));
        assert!(state.is_closed());
        assert_eq!(
            kinds(&out),
            vec![
                "user_message",
                "turn_request",
                "conversation_state", // idle → queued
                "conversation_state", // queued → thinking
                "conversation_state", // thinking → responding
                "assistant_message",
                "conversation_state", // responding → idle
                "turn_response",
            ]
        );
    }

    #[test]
    fn assistant_text_equals_concatenated_deltas() {
        let (_, out) = run(&text_stream("hello world"));
        let message = out
            .iter()
            .find_map(|e| match e {
                SemanticEvent::AssistantMessage { message } => Some(message),
                _ => None,
            })
            .unwrap();
        assert_eq!(message.text(), "hello world");
    }

    #[test]
    fn turn_ids_match_between_request_and_response() {
        let (_, out) = run(&text_stream("x"));
        let req = out.iter().find_map(|e| match e {
            SemanticEvent::TurnRequest { turn_id } => Some(turn_id.clone()),
            _ => None,
        });
        let resp = out.iter().find_map(|e| match e {
            SemanticEvent::TurnResponse { turn_id, .. } => Some(turn_id.clone()),
            _ => None,
        });
        assert_eq!(req, resp);
        assert!(req.unwrap().starts_with("turn_"));
    }

    #[test]
    fn cost_multiplies_usage_by_pricing() {
        let (_, out) = run(&text_stream("x"));
        let (usage, cost) = out
            .iter()
            .find_map(|e| match e {
                SemanticEvent::TurnResponse { usage, cost_usd, .. } => Some((*usage, *cost_usd)),
                _ => None,
            })
            .unwrap();
        assert_eq!(usage.input_tokens, 10);
        let expected = (10.0 * 3.0 + 5.0 * 15.0) / 1_000_000.0;
        assert!((cost - expected).abs() < 1e-12);
    }

    #[test]
    fn zero_delta_stream_still_closes_with_empty_text() {
        let (state, out) = run(&[
            DriveableEvent::MessageStart,
            DriveableEvent::MessageDelta {
                stop_reason: Some(StopReason::EndTurn),
                usage: None,
            },
            DriveableEvent::MessageStop,
        ]);
        assert!(state.is_closed());
        let message = out
            .iter()
            .find_map(|e| match e {
                SemanticEvent::AssistantMessage { message } => Some(message),
                _ => None,
            })
            .unwrap();
        assert_eq!(message.text(), "");
        assert!(out.iter().any(|e| matches!(e, SemanticEvent::TurnResponse { .. })));
    }

    #[test]
    fn missing_stop_reason_is_tolerated_as_end_turn() {
        let (state, out) = run(&[
            DriveableEvent::MessageStart,
            DriveableEvent::TextDelta { text: "hi".into() },
            DriveableEvent::MessageStop,
        ]);
        assert!(state.is_closed());
        assert!(out.iter().any(|e| matches!(e, SemanticEvent::TurnResponse { .. })));
    }

    #[test]
    fn tool_round_keeps_the_turn_open() {
        let (mut state, out) = run(&[
            DriveableEvent::MessageStart,
            DriveableEvent::ToolUseContentBlockStart {
                index: 1,
                id: "c1".into(),
                name: "get_weather".into(),
            },
            DriveableEvent::InputJsonDelta { index: 1, partial_json: "{\"city\":".into() },
            DriveableEvent::InputJsonDelta { index: 1, partial_json: "\"Paris\"}".into() },
            DriveableEvent::ToolUseContentBlockStop { index: 1 },
            DriveableEvent::MessageDelta {
                stop_reason: Some(StopReason::ToolUse),
                usage: Some(Usage { input_tokens: 9, output_tokens: 4, ..Default::default() }),
            },
            DriveableEvent::MessageStop,
        ]);

        assert!(!state.is_closed());
        assert!(state.awaiting_tools());
        assert!(!out.iter().any(|e| matches!(e, SemanticEvent::AssistantMessage { .. })));

        let calls = state.pending_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].input["city"], "Paris");

        // The round message carries the tool call for next-round history,
        // under the tool_call role so replay stays in vendor order.
        let round = state.take_round_message().unwrap();
        assert_eq!(round.role, Role::ToolCall);
        assert!(matches!(
            &round.content,
            agentx_types::MessageContent::Parts(parts) if parts.len() == 1
        ));
        assert!(state.take_round_message().is_none());
    }

    #[test]
    fn full_tool_loop_state_transitions() {
        let engine = engine();
        let mut state = TurnState::new("sess_1");
        let user = MessageRecord::user("sess_1", "weather in Paris");
        let mut out = engine.fold_user(&mut state, Utc::now(), &user);

        let round1 = [
            DriveableEvent::MessageStart,
            DriveableEvent::ToolUseContentBlockStart {
                index: 1,
                id: "c1".into(),
                name: "get_weather".into(),
            },
            DriveableEvent::InputJsonDelta { index: 1, partial_json: "{}".into() },
            DriveableEvent::ToolUseContentBlockStop { index: 1 },
            DriveableEvent::MessageDelta { stop_reason: Some(StopReason::ToolUse), usage: None },
            DriveableEvent::MessageStop,
            DriveableEvent::ToolResult {
                tool_call_id: "c1".into(),
                content: "sunny, 21C".into(),
                is_error: false,
            },
        ];
        for ev in &round1 {
            out.extend(engine.fold_stream(&mut state, Utc::now(), ev));
        }
        state.take_round_message();

        let round2 = [
            DriveableEvent::MessageStart,
            DriveableEvent::TextContentBlockStart { index: 0 },
            DriveableEvent::TextDelta { text: "It is sunny.".into() },
            DriveableEvent::TextContentBlockStop { index: 0 },
            DriveableEvent::MessageDelta { stop_reason: Some(StopReason::EndTurn), usage: None },
            DriveableEvent::MessageStop,
        ];
        for ev in &round2 {
            out.extend(engine.fold_stream(&mut state, Utc::now(), ev));
        }

        let transitions: Vec<(ConversationStatus, ConversationStatus)> = out
            .iter()
            .filter_map(|e| match e {
                SemanticEvent::ConversationState { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect();
        use ConversationStatus::*;
        assert_eq!(
            transitions,
            vec![
                (Idle, Queued),
                (Queued, Thinking),
                (Thinking, PlanningTool),
                (PlanningTool, ExecutingTool),
                (ExecutingTool, Responding),
                (Responding, Idle),
            ]
        );

        // Tool result message was produced between the rounds.
        assert!(out.iter().any(|e| matches!(e, SemanticEvent::ToolResultMessage { .. })));

        // The closing assistant message carries the final round's text; the
        // tool round was drained into its own history record above.
        let message = out
            .iter()
            .find_map(|e| match e {
                SemanticEvent::AssistantMessage { message } => Some(message),
                _ => None,
            })
            .unwrap();
        assert_eq!(message.text(), "It is sunny.");
    }

    #[test]
    fn error_closes_the_turn_with_turn_error() {
        let (state, out) = run(&[
            DriveableEvent::MessageStart,
            DriveableEvent::TextDelta { text: "par".into() },
            DriveableEvent::Error { message: "quota exceeded".into() },
        ]);
        assert!(state.is_closed());
        assert_eq!(state.status(), ConversationStatus::Error);
        assert!(out.iter().any(|e| matches!(e, SemanticEvent::ErrorMessage { .. })));
        assert!(out.iter().any(
            |e| matches!(e, SemanticEvent::TurnError { message, .. } if message == "quota exceeded")
        ));
        // No assistant message and no turn_response for a failed turn.
        assert!(!out.iter().any(|e| matches!(e, SemanticEvent::AssistantMessage { .. })));
        assert!(!out.iter().any(|e| matches!(e, SemanticEvent::TurnResponse { .. })));
    }

    #[test]
    fn interrupted_after_close_is_ignored() {
        let engine = engine();
        let mut state = TurnState::new("sess_1");
        let user = MessageRecord::user("sess_1", "x");
        engine.fold_user(&mut state, Utc::now(), &user);
        for ev in text_stream("done") {
            engine.fold_stream(&mut state, Utc::now(), &ev);
        }
        assert!(state.is_closed());
        let out = engine.fold_stream(&mut state, Utc::now(), &DriveableEvent::Interrupted);
        assert!(out.is_empty());
    }

    #[test]
    fn interrupt_mid_stream_yields_turn_error() {
        let (state, out) = run(&[
            DriveableEvent::MessageStart,
            DriveableEvent::TextDelta { text: "par".into() },
            DriveableEvent::Interrupted,
        ]);
        assert!(state.is_closed());
        assert!(out.iter().any(
            |e| matches!(e, SemanticEvent::TurnError { message, .. } if message == "interrupted")
        ));
    }

    #[test]
    fn duration_reflects_elapsed_time() {
        let engine = engine();
        let mut state = TurnState::new("sess_1");
        let start = Utc::now();
        let user = MessageRecord::user("sess_1", "x");
        engine.fold_user(&mut state, start, &user);
        let mut out = Vec::new();
        for ev in text_stream("ok") {
            out.extend(engine.fold_stream(&mut state, start + Duration::milliseconds(250), &ev));
        }
        let duration = out
            .iter()
            .find_map(|e| match e {
                SemanticEvent::TurnResponse { duration_ms, .. } => Some(*duration_ms),
                _ => None,
            })
            .unwrap();
        assert_eq!(duration, 250);
    }
}
