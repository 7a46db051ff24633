// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Presentation reducer: folds stream events into a UI state projection.
//!
//! The reducer is a pure function over one agent's event stream.  Streaming
//! text updates the open assistant conversation in place; `message_stop`
//! flushes it into the transcript.  It runs identically against the local
//! bus and against `stream.event` notifications from a remote runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use agentx_types::{
    ConversationStatus, DriveableEvent, Event, EventPayload, SemanticEvent,
};

// ── State shape ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Tool {
        id: String,
        name: String,
        /// Raw argument JSON while streaming; parsed on block stop.
        input_json: String,
        input: Value,
        output: Option<String>,
        is_error: bool,
    },
    Image {
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Conversation {
    User { text: String },
    Assistant { blocks: Vec<Block> },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationStatus {
    Idle,
    Thinking,
    Responding,
    Executing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationState {
    pub conversations: Vec<Conversation>,
    pub streaming: Option<Vec<Block>>,
    pub status: PresentationStatus,
}

impl Default for PresentationState {
    fn default() -> Self {
        Self { conversations: Vec::new(), streaming: None, status: PresentationStatus::Idle }
    }
}

// ── Reducer ───────────────────────────────────────────────────────────────────

/// Fold one event into the projection.
pub fn reduce(mut state: PresentationState, event: &Event) -> PresentationState {
    match &event.payload {
        EventPayload::Semantic(sev) => reduce_semantic(&mut state, sev),
        EventPayload::Stream(ev) => reduce_stream(&mut state, ev),
    }
    state
}

fn reduce_semantic(state: &mut PresentationState, sev: &SemanticEvent) {
    match sev {
        SemanticEvent::UserMessage { message } => {
            state.conversations.push(Conversation::User { text: message.text() });
        }
        SemanticEvent::ErrorMessage { message } => {
            flush_streaming(state);
            state.conversations.push(Conversation::Error { message: message.text() });
            state.status = PresentationStatus::Idle;
        }
        SemanticEvent::ConversationState { to, .. } => {
            state.status = match to {
                ConversationStatus::Idle | ConversationStatus::Error => PresentationStatus::Idle,
                ConversationStatus::Queued | ConversationStatus::Thinking => {
                    PresentationStatus::Thinking
                }
                ConversationStatus::Responding => PresentationStatus::Responding,
                ConversationStatus::PlanningTool | ConversationStatus::ExecutingTool => {
                    PresentationStatus::Executing
                }
            };
        }
        // Message assembly is already projected from the stream events.
        _ => {}
    }
}

fn reduce_stream(state: &mut PresentationState, ev: &DriveableEvent) {
    match ev {
        DriveableEvent::MessageStart => {
            if state.streaming.is_none() {
                state.streaming = Some(Vec::new());
            }
        }
        DriveableEvent::TextContentBlockStart { .. } => {
            let blocks = state.streaming.get_or_insert_with(Vec::new);
            blocks.push(Block::Text { text: String::new() });
        }
        DriveableEvent::TextDelta { text } => {
            let blocks = state.streaming.get_or_insert_with(Vec::new);
            match blocks.last_mut() {
                // Streaming text updates the open block in place.
                Some(Block::Text { text: buf }) => buf.push_str(text),
                _ => blocks.push(Block::Text { text: text.clone() }),
            }
        }
        DriveableEvent::ToolUseContentBlockStart { id, name, .. } => {
            let blocks = state.streaming.get_or_insert_with(Vec::new);
            blocks.push(Block::Tool {
                id: id.clone(),
                name: name.clone(),
                input_json: String::new(),
                input: Value::Null,
                output: None,
                is_error: false,
            });
        }
        DriveableEvent::InputJsonDelta { partial_json, .. } => {
            if let Some(Block::Tool { input_json, .. }) =
                state.streaming.as_mut().and_then(|b| b.last_mut())
            {
                input_json.push_str(partial_json);
            }
        }
        DriveableEvent::ToolUseContentBlockStop { .. } => {
            if let Some(Block::Tool { input_json, input, .. }) =
                state.streaming.as_mut().and_then(|b| b.last_mut())
            {
                *input = serde_json::from_str(input_json).unwrap_or(Value::Null);
            }
        }
        DriveableEvent::ToolResult { tool_call_id, content, is_error } => {
            attach_tool_result(state, tool_call_id, content, *is_error);
        }
        DriveableEvent::MessageStop => flush_streaming(state),
        DriveableEvent::Interrupted => {
            flush_streaming(state);
            state.status = PresentationStatus::Idle;
        }
        DriveableEvent::Error { .. } => {
            // The engine's error_message event renders the failure.
        }
        DriveableEvent::TextContentBlockStop { .. } | DriveableEvent::MessageDelta { .. } => {}
    }
}

fn flush_streaming(state: &mut PresentationState) {
    if let Some(blocks) = state.streaming.take() {
        if !blocks.is_empty() {
            state.conversations.push(Conversation::Assistant { blocks });
        }
    }
}

/// Find the tool block a result belongs to — in the open stream first, then
/// in already-flushed assistant conversations (tool rounds flush on their
/// `message_stop` before the result arrives).
fn attach_tool_result(state: &mut PresentationState, call_id: &str, content: &str, error: bool) {
    let matches_call = |block: &&mut Block| match block {
        Block::Tool { id, .. } => id == call_id,
        _ => false,
    };

    if let Some(block) = state
        .streaming
        .iter_mut()
        .flatten()
        .find(matches_call)
    {
        if let Block::Tool { output, is_error, .. } = block {
            *output = Some(content.to_string());
            *is_error = error;
        }
        return;
    }

    for conv in state.conversations.iter_mut().rev() {
        if let Conversation::Assistant { blocks } = conv {
            if let Some(Block::Tool { output, is_error, .. }) =
                blocks.iter_mut().find(|b| matches!(b, Block::Tool { id, .. } if id == call_id))
            {
                *output = Some(content.to_string());
                *is_error = error;
                return;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use agentx_types::{MessageRecord, StopReason};

    use super::*;

    fn ev(payload: impl Into<EventPayload>) -> Event {
        Event::new(payload)
    }

    fn run(events: Vec<Event>) -> PresentationState {
        events.iter().fold(PresentationState::default(), reduce)
    }

    #[test]
    fn streaming_text_updates_in_place() {
        let state = run(vec![
            ev(DriveableEvent::MessageStart),
            ev(DriveableEvent::TextContentBlockStart { index: 0 }),
            ev(DriveableEvent::TextDelta { text: "hel".into() }),
            ev(DriveableEvent::TextDelta { text: "lo".into() }),
        ]);
        assert_eq!(
            state.streaming,
            Some(vec![Block::Text { text: "hello".into() }])
        );
        assert!(state.conversations.is_empty());
    }

    #[test]
    fn message_stop_flushes_the_streaming_conversation() {
        let state = run(vec![
            ev(SemanticEvent::UserMessage { message: MessageRecord::user("sess_1", "hi") }),
            ev(DriveableEvent::MessageStart),
            ev(DriveableEvent::TextContentBlockStart { index: 0 }),
            ev(DriveableEvent::TextDelta { text: "hello".into() }),
            ev(DriveableEvent::TextContentBlockStop { index: 0 }),
            ev(DriveableEvent::MessageStop),
        ]);
        assert!(state.streaming.is_none());
        assert_eq!(state.conversations.len(), 2);
        assert_eq!(state.conversations[0], Conversation::User { text: "hi".into() });
        assert_eq!(
            state.conversations[1],
            Conversation::Assistant { blocks: vec![Block::Text { text: "hello".into() }] }
        );
    }

    #[test]
    fn status_follows_conversation_state() {
        use agentx_types::ConversationStatus::*;
        let state = run(vec![ev(SemanticEvent::ConversationState {
            from: Thinking,
            to: PlanningTool,
        })]);
        assert_eq!(state.status, PresentationStatus::Executing);

        let state = run(vec![ev(SemanticEvent::ConversationState { from: Thinking, to: Responding })]);
        assert_eq!(state.status, PresentationStatus::Responding);
    }

    #[test]
    fn tool_result_lands_on_the_flushed_round() {
        let state = run(vec![
            ev(DriveableEvent::MessageStart),
            ev(DriveableEvent::ToolUseContentBlockStart {
                index: 1,
                id: "c1".into(),
                name: "get_weather".into(),
            }),
            ev(DriveableEvent::InputJsonDelta {
                index: 1,
                partial_json: "{\"city\":\"Paris\"}".into(),
            }),
            ev(DriveableEvent::ToolUseContentBlockStop { index: 1 }),
            ev(DriveableEvent::MessageDelta {
                stop_reason: Some(StopReason::ToolUse),
                usage: None,
            }),
            ev(DriveableEvent::MessageStop),
            ev(DriveableEvent::ToolResult {
                tool_call_id: "c1".into(),
                content: "sunny".into(),
                is_error: false,
            }),
        ]);

        assert_eq!(state.conversations.len(), 1);
        match &state.conversations[0] {
            Conversation::Assistant { blocks } => match &blocks[0] {
                Block::Tool { name, input, output, .. } => {
                    assert_eq!(name, "get_weather");
                    assert_eq!(input["city"], "Paris");
                    assert_eq!(output.as_deref(), Some("sunny"));
                }
                other => panic!("unexpected block: {other:?}"),
            },
            other => panic!("unexpected conversation: {other:?}"),
        }
    }

    #[test]
    fn error_message_becomes_an_error_conversation() {
        let state = run(vec![
            ev(DriveableEvent::MessageStart),
            ev(DriveableEvent::TextDelta { text: "par".into() }),
            ev(SemanticEvent::ErrorMessage {
                message: MessageRecord::error("sess_1", "quota exceeded"),
            }),
        ]);
        assert!(state.streaming.is_none());
        assert!(matches!(
            state.conversations.last(),
            Some(Conversation::Error { message }) if message.contains("quota exceeded")
        ));
        assert_eq!(state.status, PresentationStatus::Idle);
    }

    #[test]
    fn reducer_is_pure() {
        let before = PresentationState::default();
        let event = ev(DriveableEvent::TextDelta { text: "x".into() });
        let after = reduce(before.clone(), &event);
        // `before` was moved by value; cloning proves no shared mutation.
        assert_ne!(after, PresentationState::default());
    }
}
