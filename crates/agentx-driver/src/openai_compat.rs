// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Chat-completions driver for OpenAI and every OpenAI-compatible endpoint
//! (xai, deepseek, mistral, local servers, proxies).
//!
//! The chat-completions stream has no block boundaries — deltas just start
//! arriving — so the assembler synthesizes `*_content_block_start/stop`
//! events around delta runs.  Text always occupies block index 0; tool call
//! blocks are shifted by one so the indexes never collide.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use agentx_types::{
    ContentPart, DriveableEvent, MessageContent, MessageRecord, Pricing, Role, RuntimeError,
    StopReason, Usage,
};

use crate::{catalog, sse, DriveStream, Driver, DriverCore, DriverState};

pub struct OpenAiCompatDriver {
    core: DriverCore,
    provider: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatDriver {
    pub fn new(
        provider: &str,
        session_id: &str,
        model: String,
        api_key: Option<String>,
        base_url: String,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            core: DriverCore::new(provider, session_id),
            provider: provider.to_string(),
            model,
            api_key,
            base_url,
            system_prompt,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Driver for OpenAiCompatDriver {
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
        catalog::pricing_for(&self.provider, &self.model)
    }

    async fn receive(&self, messages: Vec<MessageRecord>) -> Result<DriveStream, RuntimeError> {
        let token = self.core.begin()?;

        let body = json!({
            "model": self.model,
            "messages": build_messages(self.system_prompt.as_deref(), &messages),
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        debug!(provider = %self.provider, model = %self.model, "sending chat-completions request");

        let mut request = self.client.post(format!("{}/chat/completions", self.base_url));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = match request.json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.core.abort();
                return Err(RuntimeError::Driver(format!(
                    "{} request failed: {e}",
                    self.provider
                )));
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            self.core.abort();
            return Err(RuntimeError::Driver(format!(
                "{} error {status}: {text}",
                self.provider
            )));
        }

        let mut assembler = Assembler::default();
        let raw = sse::data_lines(resp.bytes_stream()).flat_map(move |line| {
            let events = match line {
                Ok(data) => assembler.push(&data),
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

/// Folds chat-completions `data:` payloads into driveable events.
#[derive(Default)]
pub(crate) struct Assembler {
    started: bool,
    text_open: bool,
    /// Wire index of the currently open tool block, if any.
    tool_open: Option<u32>,
    finish_reason: Option<StopReason>,
    usage: Option<Usage>,
}

impl Assembler {
    pub(crate) fn push(&mut self, data: &str) -> Vec<DriveableEvent> {
        if data == "[DONE]" {
            return self.finish();
        }
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };

        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.push(DriveableEvent::MessageStart);
        }

        // Usage arrives on the final chunk when stream_options ask for it.
        if let Some(u) = v.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(Usage {
                input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
                cache_read_tokens: u["prompt_tokens_details"]["cached_tokens"]
                    .as_u64()
                    .unwrap_or(0) as u32,
                cache_write_tokens: 0,
            });
        }

        let Some(choice) = v["choices"].get(0) else {
            return out;
        };
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                if let Some(idx) = self.tool_open.take() {
                    out.push(DriveableEvent::ToolUseContentBlockStop { index: idx });
                }
                if !self.text_open {
                    self.text_open = true;
                    out.push(DriveableEvent::TextContentBlockStart { index: 0 });
                }
                out.push(DriveableEvent::TextDelta { text: text.to_string() });
            }
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                // Text block index 0 is reserved; shift tool indexes by one.
                let index = tc["index"].as_u64().unwrap_or(0) as u32 + 1;
                let id = tc["id"].as_str().unwrap_or("");
                let name = tc["function"]["name"].as_str().unwrap_or("");
                if !id.is_empty() || !name.is_empty() {
                    if self.text_open {
                        self.text_open = false;
                        out.push(DriveableEvent::TextContentBlockStop { index: 0 });
                    }
                    if let Some(open) = self.tool_open.take() {
                        if open != index {
                            out.push(DriveableEvent::ToolUseContentBlockStop { index: open });
                        }
                    }
                    self.tool_open = Some(index);
                    out.push(DriveableEvent::ToolUseContentBlockStart {
                        index,
                        id: id.to_string(),
                        name: name.to_string(),
                    });
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    if !args.is_empty() {
                        out.push(DriveableEvent::InputJsonDelta {
                            index: self.tool_open.unwrap_or(index),
                            partial_json: args.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(parse_finish_reason(reason));
        }

        out
    }

    /// Close open blocks and terminate — called on the `[DONE]` sentinel.
    fn finish(&mut self) -> Vec<DriveableEvent> {
        let mut out = Vec::new();
        if self.text_open {
            self.text_open = false;
            out.push(DriveableEvent::TextContentBlockStop { index: 0 });
        }
        if let Some(idx) = self.tool_open.take() {
            out.push(DriveableEvent::ToolUseContentBlockStop { index: idx });
        }
        out.push(DriveableEvent::MessageDelta {
            stop_reason: self.finish_reason.take().or(Some(StopReason::EndTurn)),
            usage: self.usage.take(),
        });
        out.push(DriveableEvent::MessageStop);
        out
    }
}

fn parse_finish_reason(s: &str) -> StopReason {
    match s {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::ContentFilter,
        _ => StopReason::Other,
    }
}

// ── Wire conversion ───────────────────────────────────────────────────────────

fn build_messages(system_prompt: Option<&str>, messages: &[MessageRecord]) -> Vec<Value> {
    let mut wire = Vec::new();
    if let Some(prompt) = system_prompt {
        wire.push(json!({ "role": "system", "content": prompt }));
    }
    for msg in messages {
        match msg.role {
            Role::System => wire.push(json!({ "role": "system", "content": msg.text() })),
            Role::User => wire.push(json!({
                "role": "user",
                "content": user_content(&msg.content),
            })),
            Role::Assistant | Role::ToolCall => wire.push(assistant_message(msg)),
            Role::ToolResult => {
                // One wire message per tool result part.
                if let MessageContent::Parts(parts) = &msg.content {
                    for part in parts {
                        if let ContentPart::ToolResult { tool_call_id, content, .. } = part {
                            wire.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_call_id,
                                "content": content,
                            }));
                        }
                    }
                }
            }
        }
    }
    wire
}

/// User content: a plain string, or the vision part array when the message
/// mixes text with images.  Both data URLs and remote URLs ride the
/// `image_url` shape unchanged.
fn user_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(t) => json!(t),
        MessageContent::Parts(parts) => {
            let blocks: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
                    ContentPart::Image { image_url } => Some(json!({
                        "type": "image_url",
                        "image_url": { "url": image_url },
                    })),
                    _ => None,
                })
                .collect();
            if blocks.is_empty() {
                json!("")
            } else {
                json!(blocks)
            }
        }
    }
}

fn assistant_message(msg: &MessageRecord) -> Value {
    let text = msg.text();
    let tool_calls: Vec<Value> = match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall { id, name, input } => Some(json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": input.to_string() },
                })),
                _ => None,
            })
            .collect(),
        MessageContent::Text(_) => Vec::new(),
    };

    let mut wire = json!({ "role": "assistant" });
    wire["content"] = if text.is_empty() { Value::Null } else { json!(text) };
    if !tool_calls.is_empty() {
        wire["tool_calls"] = json!(tool_calls);
    }
    wire
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
