// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use agentx_types::{
    DriveableEvent, MessageRecord, Pricing, Role, RuntimeError, StopReason, Usage,
};

use crate::{DriveStream, Driver, DriverCore, DriverState};

/// Deterministic offline driver.  Echoes the last user message back as the
/// assistant response, split across two deltas so consumers exercise
/// accumulation.
pub struct MockDriver {
    core: DriverCore,
}

impl MockDriver {
    pub fn new(session_id: &str) -> Self {
        Self { core: DriverCore::new("mock", session_id) }
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn session_id(&self) -> &str {
        self.core.session_id()
    }

    fn state(&self) -> DriverState {
        self.core.state()
    }

    async fn receive(&self, messages: Vec<MessageRecord>) -> Result<DriveStream, RuntimeError> {
        let token = self.core.begin()?;

        let reply = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.text())
            .unwrap_or_default();

        let input_tokens = (messages.iter().map(|m| m.text().len()).sum::<usize>() / 4).max(1);
        let output_tokens = (reply.len() / 4).max(1);

        let mid = reply.len() / 2;
        // Split on a char boundary; multi-byte text keeps both halves valid.
        let mid = (mid..reply.len()).find(|i| reply.is_char_boundary(*i)).unwrap_or(0);
        let (head, tail) = reply.split_at(mid);

        let mut events = vec![
            DriveableEvent::MessageStart,
            DriveableEvent::TextContentBlockStart { index: 0 },
            DriveableEvent::TextDelta { text: head.to_string() },
        ];
        if !tail.is_empty() {
            events.push(DriveableEvent::TextDelta { text: tail.to_string() });
        }
        events.extend([
            DriveableEvent::TextContentBlockStop { index: 0 },
            DriveableEvent::MessageDelta {
                stop_reason: Some(StopReason::EndTurn),
                usage: Some(Usage {
                    input_tokens: input_tokens as u32,
                    output_tokens: output_tokens as u32,
                    ..Default::default()
                }),
            },
            DriveableEvent::MessageStop,
        ]);

        Ok(self.core.guard(token, futures::stream::iter(events)))
    }

    async fn interrupt(&self) {
        self.core.interrupt();
    }

    async fn dispose(&self) {
        self.core.dispose();
    }
}

/// A pre-scripted driver.  Each `receive` pops the next event script off the
/// front of the queue, which lets tests specify exact sequences — including
/// tool rounds — without network access.
pub struct ScriptedDriver {
    core: DriverCore,
    scripts: Mutex<Vec<Vec<DriveableEvent>>>,
    pricing: Pricing,
    /// The messages seen by the most recent `receive`, for test inspection.
    pub last_messages: Arc<Mutex<Option<Vec<MessageRecord>>>>,
}

impl ScriptedDriver {
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// event sequence for that call.
    pub fn new(session_id: &str, scripts: Vec<Vec<DriveableEvent>>) -> Self {
        Self {
            core: DriverCore::new("scripted-mock", session_id),
            scripts: Mutex::new(scripts),
            pricing: Pricing::default(),
            last_messages: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// Convenience: a single text reply.
    pub fn always_text(session_id: &str, reply: impl Into<String>) -> Self {
        Self::new(session_id, vec![Self::text_script(reply.into())])
    }

    /// Convenience: a tool call round followed by a text round, the shape a
    /// vendor produces when it wants a tool executed before answering.
    pub fn tool_then_text(
        session_id: &str,
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(
            session_id,
            vec![
                vec![
                    DriveableEvent::MessageStart,
                    DriveableEvent::ToolUseContentBlockStart {
                        index: 1,
                        id: tool_id.into(),
                        name: tool_name.into(),
                    },
                    DriveableEvent::InputJsonDelta { index: 1, partial_json: args_json.into() },
                    DriveableEvent::ToolUseContentBlockStop { index: 1 },
                    DriveableEvent::MessageDelta {
                        stop_reason: Some(StopReason::ToolUse),
                        usage: Some(Usage { input_tokens: 9, output_tokens: 4, ..Default::default() }),
                    },
                    DriveableEvent::MessageStop,
                ],
                Self::text_script(final_text.into()),
            ],
        )
    }

    /// Convenience: a stream that fails mid-flight with a vendor error.
    pub fn always_error(session_id: &str, message: impl Into<String>) -> Self {
        Self::new(
            session_id,
            vec![vec![
                DriveableEvent::MessageStart,
                DriveableEvent::Error { message: message.into() },
            ]],
        )
    }

    fn text_script(text: String) -> Vec<DriveableEvent> {
        let output_tokens = (text.len() / 4).max(1) as u32;
        vec![
            DriveableEvent::MessageStart,
            DriveableEvent::TextContentBlockStart { index: 0 },
            DriveableEvent::TextDelta { text },
            DriveableEvent::TextContentBlockStop { index: 0 },
            DriveableEvent::MessageDelta {
                stop_reason: Some(StopReason::EndTurn),
                usage: Some(Usage { input_tokens: 5, output_tokens, ..Default::default() }),
            },
            DriveableEvent::MessageStop,
        ]
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn session_id(&self) -> &str {
        self.core.session_id()
    }

    fn state(&self) -> DriverState {
        self.core.state()
    }

    fn pricing(&self) -> Pricing {
        self.pricing
    }

    async fn receive(&self, messages: Vec<MessageRecord>) -> Result<DriveStream, RuntimeError> {
        let token = self.core.begin()?;
        *self.last_messages.lock().unwrap_or_else(|e| e.into_inner()) = Some(messages);

        let events = {
            let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            if scripts.is_empty() {
                // Fallback when all scripts are consumed.
                Self::text_script("[no more scripts]".into())
            } else {
                scripts.remove(0)
            }
        };

        Ok(self.core.guard(token, futures::stream::iter(events)))
    }

    async fn interrupt(&self) {
        self.core.interrupt();
    }

    async fn dispose(&self) {
        self.core.dispose();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn user(text: &str) -> Vec<MessageRecord> {
        vec![MessageRecord::user("sess_1", text)]
    }

    #[tokio::test]
    async fn mock_echoes_the_last_user_message() {
        let driver = MockDriver::new("sess_1");
        let events: Vec<_> = driver.receive(user("hello")).await.unwrap().collect().await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                DriveableEvent::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello");
        assert_eq!(events.last(), Some(&DriveableEvent::MessageStop));
    }

    #[tokio::test]
    async fn mock_reports_nonzero_usage() {
        let driver = MockDriver::new("sess_1");
        let events: Vec<_> = driver.receive(user("hi")).await.unwrap().collect().await;
        let usage = events
            .iter()
            .find_map(|e| match e {
                DriveableEvent::MessageDelta { usage: Some(u), .. } => Some(*u),
                _ => None,
            })
            .unwrap();
        assert!(usage.input_tokens > 0);
        assert!(usage.output_tokens > 0);
    }

    #[tokio::test]
    async fn mock_is_reusable_after_a_stream() {
        let driver = MockDriver::new("sess_1");
        let first: Vec<_> = driver.receive(user("a")).await.unwrap().collect().await;
        assert!(!first.is_empty());
        assert_eq!(driver.state(), DriverState::Idle);
        let second: Vec<_> = driver.receive(user("b")).await.unwrap().collect().await;
        assert_eq!(second.last(), Some(&DriveableEvent::MessageStop));
    }

    #[tokio::test]
    async fn scripted_pops_scripts_in_order() {
        let driver = ScriptedDriver::new(
            "sess_1",
            vec![
                ScriptedDriver::text_script("one".into()),
                ScriptedDriver::text_script("two".into()),
            ],
        );
        let first: Vec<_> = driver.receive(user("x")).await.unwrap().collect().await;
        assert!(first.iter().any(|e| matches!(e, DriveableEvent::TextDelta { text } if text == "one")));
        let second: Vec<_> = driver.receive(user("y")).await.unwrap().collect().await;
        assert!(second.iter().any(|e| matches!(e, DriveableEvent::TextDelta { text } if text == "two")));
    }

    #[tokio::test]
    async fn scripted_records_the_request_messages() {
        let driver = ScriptedDriver::always_text("sess_1", "ok");
        driver.receive(user("inspect me")).await.unwrap().collect::<Vec<_>>().await;
        let seen = driver.last_messages.lock().unwrap().clone().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].text(), "inspect me");
    }

    #[tokio::test]
    async fn tool_then_text_signals_tool_use_stop() {
        let driver = ScriptedDriver::tool_then_text(
            "sess_1",
            "c1",
            "get_weather",
            r#"{"city":"Paris"}"#,
            "sunny",
        );
        let round1: Vec<_> = driver.receive(user("weather in Paris")).await.unwrap().collect().await;
        assert!(round1.iter().any(|e| matches!(
            e,
            DriveableEvent::MessageDelta { stop_reason: Some(StopReason::ToolUse), .. }
        )));
        let round2: Vec<_> = driver.receive(user("…")).await.unwrap().collect().await;
        assert!(round2.iter().any(|e| matches!(e, DriveableEvent::TextDelta { text } if text == "sunny")));
    }
}
