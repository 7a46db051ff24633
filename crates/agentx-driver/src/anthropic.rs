// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic Messages API driver.
//!
//! The native streaming format maps almost 1:1 onto the driveable taxonomy;
//! the assembler below only has to remember which block kind each index
//! opened with and to merge the input-token count (reported in
//! `message_start`) into the usage that arrives with `message_delta`.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use agentx_types::{
    parse_data_url, ContentPart, DriveableEvent, MessageContent, MessageRecord, Pricing, Role,
    RuntimeError, StopReason, Usage,
};

use crate::{catalog, sse, DriveStream, Driver, DriverCore, DriverState};

pub struct AnthropicDriver {
    core: DriverCore,
    model: String,
    api_key: Option<String>,
    base_url: String,
    system_prompt: Option<String>,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicDriver {
    pub fn new(
        session_id: &str,
        model: String,
        api_key: Option<String>,
        base_url: String,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            core: DriverCore::new("anthropic", session_id),
            model,
            api_key,
            base_url,
            system_prompt,
            max_tokens: 4096,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Driver for AnthropicDriver {
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
        catalog::pricing_for("anthropic", &self.model)
    }

    async fn receive(&self, messages: Vec<MessageRecord>) -> Result<DriveStream, RuntimeError> {
        let token = self.core.begin()?;

        let key = match self.api_key.as_deref() {
            Some(k) => k,
            None => {
                self.core.abort();
                return Err(RuntimeError::Unauthorized("ANTHROPIC_API_KEY not set".into()));
            }
        };

        let (system, wire_messages) = build_messages(self.system_prompt.as_deref(), &messages);
        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
            "max_tokens": self.max_tokens,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }

        debug!(model = %self.model, messages = messages.len(), "sending anthropic request");

        let resp = match self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                self.core.abort();
                return Err(RuntimeError::Driver(format!("anthropic request failed: {e}")));
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            self.core.abort();
            return Err(RuntimeError::Driver(format!("anthropic error {status}: {text}")));
        }

        let mut assembler = Assembler::default();
        let raw = sse::data_lines(resp.bytes_stream()).flat_map(move |line| {
            let events = match line {
                Ok(data) => match serde_json::from_str::<Value>(&data) {
                    Ok(v) => assembler.push(&v),
                    Err(_) => Vec::new(),
                },
                Err(e) => vec![DriveableEvent::Error { message: e }],
            };
            futures::stream::iter(events)
        });

        Ok(self.core.guard(token, raw))
    }

    async fn interrupt(&self) {
        self.core.interrupt();
    }

    async fn dispose(&self) {
        self.core.dispose();
    }
}

// ── Stream assembly ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq)]
enum BlockKind {
    Text,
    ToolUse,
    Thinking,
}

/// Folds raw Anthropic SSE payloads into driveable events.
#[derive(Default)]
struct Assembler {
    blocks: HashMap<u32, BlockKind>,
    input_usage: Usage,
}

impl Assembler {
    fn push(&mut self, v: &Value) -> Vec<DriveableEvent> {
        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(usage) = v["message"].get("usage") {
                    self.input_usage = Usage {
                        input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                        output_tokens: 0,
                        cache_read_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0)
                            as u32,
                        cache_write_tokens: usage["cache_creation_input_tokens"]
                            .as_u64()
                            .unwrap_or(0) as u32,
                    };
                }
                vec![DriveableEvent::MessageStart]
            }
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let block = &v["content_block"];
                match block["type"].as_str().unwrap_or("") {
                    "tool_use" => {
                        self.blocks.insert(index, BlockKind::ToolUse);
                        vec![DriveableEvent::ToolUseContentBlockStart {
                            index,
                            id: block["id"].as_str().unwrap_or("").to_string(),
                            name: block["name"].as_str().unwrap_or("").to_string(),
                        }]
                    }
                    "thinking" => {
                        self.blocks.insert(index, BlockKind::Thinking);
                        Vec::new()
                    }
                    _ => {
                        self.blocks.insert(index, BlockKind::Text);
                        vec![DriveableEvent::TextContentBlockStart { index }]
                    }
                }
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => vec![DriveableEvent::TextDelta {
                        text: delta["text"].as_str().unwrap_or("").to_string(),
                    }],
                    "input_json_delta" => vec![DriveableEvent::InputJsonDelta {
                        index,
                        partial_json: delta["partial_json"].as_str().unwrap_or("").to_string(),
                    }],
                    // Thinking and its signature blob are not part of the
                    // driveable taxonomy; they are dropped here.
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                match self.blocks.remove(&index) {
                    Some(BlockKind::ToolUse) => {
                        vec![DriveableEvent::ToolUseContentBlockStop { index }]
                    }
                    Some(BlockKind::Thinking) => Vec::new(),
                    _ => vec![DriveableEvent::TextContentBlockStop { index }],
                }
            }
            "message_delta" => {
                let mut usage = self.input_usage;
                if let Some(u) = v.get("usage") {
                    usage.output_tokens = u["output_tokens"].as_u64().unwrap_or(0) as u32;
                }
                vec![DriveableEvent::MessageDelta {
                    stop_reason: v["delta"]["stop_reason"].as_str().map(parse_stop_reason),
                    usage: Some(usage),
                }]
            }
            "message_stop" => vec![DriveableEvent::MessageStop],
            "error" => {
                let message = v["error"]["message"].as_str().unwrap_or("provider error");
                warn!(%message, "anthropic stream error");
                vec![DriveableEvent::Error { message: message.to_string() }]
            }
            // ping and future event types
            _ => Vec::new(),
        }
    }
}

fn parse_stop_reason(s: &str) -> StopReason {
    match s {
        "end_turn" => StopReason::EndTurn,
        "max_tokens" => StopReason::MaxTokens,
        "tool_use" => StopReason::ToolUse,
        "refusal" => StopReason::ContentFilter,
        _ => StopReason::Other,
    }
}

// ── Wire conversion ───────────────────────────────────────────────────────────

/// Convert session records into the Anthropic wire format.  Returns
/// `(system_text, messages)`: system-role history joins the configured
/// system prompt as a top-level field rather than a conversation turn.
fn build_messages(
    system_prompt: Option<&str>,
    messages: &[MessageRecord],
) -> (String, Vec<Value>) {
    let mut system: Vec<String> = Vec::new();
    if let Some(prompt) = system_prompt {
        system.push(prompt.to_string());
    }

    let mut wire = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system.push(msg.text()),
            Role::User => wire.push(json!({
                "role": "user",
                "content": content_blocks(&msg.content, "user"),
            })),
            Role::Assistant | Role::ToolCall => wire.push(json!({
                "role": "assistant",
                "content": content_blocks(&msg.content, "assistant"),
            })),
            // Tool results go back as user-role blocks.
            Role::ToolResult => wire.push(json!({
                "role": "user",
                "content": content_blocks(&msg.content, "user"),
            })),
        }
    }
    (system.join("\n\n"), wire)
}

fn content_blocks(content: &MessageContent, role: &str) -> Value {
    match content {
        MessageContent::Text(t) => json!([{ "type": "text", "text": t }]),
        MessageContent::Parts(parts) => {
            let blocks: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
                    ContentPart::Thinking { .. } => None,
                    ContentPart::Image { image_url } => Some(image_block(image_url)),
                    ContentPart::ToolCall { id, name, input } if role == "assistant" => {
                        Some(json!({ "type": "tool_use", "id": id, "name": name, "input": input }))
                    }
                    ContentPart::ToolCall { .. } => None,
                    ContentPart::ToolResult { tool_call_id, content, is_error } => Some(json!({
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": content,
                        "is_error": is_error,
                    })),
                })
                .collect();
            json!(blocks)
        }
    }
}

fn image_block(url: &str) -> Value {
    match parse_data_url(url) {
        Ok((mime, b64)) => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": mime, "data": b64 },
        }),
        Err(_) => json!({
            "type": "image",
            "source": { "type": "url", "url": url },
        }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn push(assembler: &mut Assembler, raw: &str) -> Vec<DriveableEvent> {
        assembler.push(&serde_json::from_str(raw).unwrap())
    }

    #[test]
    fn text_stream_maps_one_to_one() {
        let mut a = Assembler::default();
        assert_eq!(
            push(&mut a, r#"{"type":"message_start","message":{"usage":{"input_tokens":12}}}"#),
            vec![DriveableEvent::MessageStart]
        );
        assert_eq!(
            push(&mut a, r#"{"type":"content_block_start","index":0,"content_block":{"type":"text"}}"#),
            vec![DriveableEvent::TextContentBlockStart { index: 0 }]
        );
        assert_eq!(
            push(&mut a, r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#),
            vec![DriveableEvent::TextDelta { text: "hi".into() }]
        );
        assert_eq!(
            push(&mut a, r#"{"type":"content_block_stop","index":0}"#),
            vec![DriveableEvent::TextContentBlockStop { index: 0 }]
        );
    }

    #[test]
    fn message_delta_merges_input_and_output_usage() {
        let mut a = Assembler::default();
        push(&mut a, r#"{"type":"message_start","message":{"usage":{"input_tokens":12}}}"#);
        let events = push(
            &mut a,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
        );
        match &events[0] {
            DriveableEvent::MessageDelta { stop_reason, usage } => {
                assert_eq!(*stop_reason, Some(StopReason::EndTurn));
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 7);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tool_use_block_tracks_its_index() {
        let mut a = Assembler::default();
        let start = push(
            &mut a,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"c1","name":"get_weather"}}"#,
        );
        assert_eq!(
            start,
            vec![DriveableEvent::ToolUseContentBlockStart {
                index: 1,
                id: "c1".into(),
                name: "get_weather".into(),
            }]
        );
        let delta = push(
            &mut a,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"city\""}}"#,
        );
        assert_eq!(
            delta,
            vec![DriveableEvent::InputJsonDelta { index: 1, partial_json: "{\"city\"".into() }]
        );
        assert_eq!(
            push(&mut a, r#"{"type":"content_block_stop","index":1}"#),
            vec![DriveableEvent::ToolUseContentBlockStop { index: 1 }]
        );
    }

    #[test]
    fn thinking_blocks_are_dropped() {
        let mut a = Assembler::default();
        assert!(push(
            &mut a,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}"#
        )
        .is_empty());
        assert!(push(
            &mut a,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hm"}}"#
        )
        .is_empty());
        assert!(push(&mut a, r#"{"type":"content_block_stop","index":0}"#).is_empty());
    }

    #[test]
    fn error_event_maps_to_terminal_error() {
        let mut a = Assembler::default();
        let events = push(
            &mut a,
            r#"{"type":"error","error":{"type":"overloaded_error","message":"overloaded"}}"#,
        );
        assert_eq!(events, vec![DriveableEvent::Error { message: "overloaded".into() }]);
    }

    #[test]
    fn system_history_joins_the_system_prompt() {
        let messages = vec![
            MessageRecord::system("sess_1", "Extra context."),
            MessageRecord::user("sess_1", "hi"),
        ];
        let (system, wire) = build_messages(Some("Repeat the user verbatim"), &messages);
        assert_eq!(system, "Repeat the user verbatim\n\nExtra context.");
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["role"], "user");
    }

    #[test]
    fn user_images_map_to_anthropic_sources() {
        let messages = vec![MessageRecord::user(
            "sess_1",
            vec![
                ContentPart::text("what is this?"),
                ContentPart::image("data:image/png;base64,iVBORw0KGgo="),
            ],
        )];
        let (_, wire) = build_messages(None, &messages);
        let blocks = &wire[0]["content"];
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["source"]["type"], "base64");
        assert_eq!(blocks[1]["source"]["media_type"], "image/png");

        let remote = vec![MessageRecord::user(
            "sess_1",
            vec![ContentPart::image("https://example.com/cat.png")],
        )];
        let (_, wire) = build_messages(None, &remote);
        assert_eq!(wire[0]["content"][0]["source"]["type"], "url");
    }

    #[test]
    fn tool_result_history_goes_back_as_user_block() {
        let messages = vec![MessageRecord::tool_result("sess_1", "c1", "sunny, 21C", false)];
        let (_, wire) = build_messages(None, &messages);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["type"], "tool_result");
        assert_eq!(wire[0]["content"][0]["tool_use_id"], "c1");
    }
}
