// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Google Generative Language API driver (`streamGenerateContent`).
//!
//! Gemini streams whole parts rather than block-delimited deltas and never
//! sends a `[DONE]` sentinel, so block boundaries are synthesized per part
//! and the terminal events are appended when the byte stream ends.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use agentx_types::{
    parse_data_url, ContentPart, DriveableEvent, MessageContent, MessageRecord, Pricing, Role,
    RuntimeError, StopReason, Usage,
};

use crate::{catalog, sse, DriveStream, Driver, DriverCore, DriverState};

pub struct GoogleDriver {
    core: DriverCore,
    model: String,
    api_key: Option<String>,
    base_url: String,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl GoogleDriver {
    pub fn new(
        session_id: &str,
        model: String,
        api_key: Option<String>,
        base_url: String,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            core: DriverCore::new("google", session_id),
            model,
            api_key,
            base_url,
            system_prompt,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Driver for GoogleDriver {
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
        catalog::pricing_for("google", &self.model)
    }

    async fn receive(&self, messages: Vec<MessageRecord>) -> Result<DriveStream, RuntimeError> {
        let token = self.core.begin()?;

        let key = match self.api_key.as_deref() {
            Some(k) => k,
            None => {
                self.core.abort();
                return Err(RuntimeError::Unauthorized("GEMINI_API_KEY not set".into()));
            }
        };

        let mut body = json!({ "contents": build_contents(&messages) });
        if let Some(prompt) = &self.system_prompt {
            body["systemInstruction"] = json!({ "parts": [{ "text": prompt }] });
        }

        debug!(model = %self.model, "sending gemini request");

        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );
        let resp = match self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                self.core.abort();
                return Err(RuntimeError::Driver(format!("gemini request failed: {e}")));
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            self.core.abort();
            return Err(RuntimeError::Driver(format!("gemini error {status}: {text}")));
        }

        // The assembler is shared with a tail stream that flushes terminal
        // events once the SSE bytes run out.
        let assembler = Arc::new(Mutex::new(Assembler::default()));
        let tail_assembler = Arc::clone(&assembler);

        let main = sse::data_lines(resp.bytes_stream()).flat_map(move |line| {
            let events = match line {
                Ok(data) => match serde_json::from_str::<Value>(&data) {
                    Ok(v) => assembler.lock().unwrap_or_else(|e| e.into_inner()).push(&v),
                    Err(_) => Vec::new(),
                },
                Err(e) => vec![DriveableEvent::Error { message: e }],
            };
            futures::stream::iter(events)
        });
        let tail = futures::stream::once(async move {
            let events = tail_assembler.lock().unwrap_or_else(|e| e.into_inner()).finish();
            futures::stream::iter(events)
        })
        .flatten();

        Ok(self.core.guard(token, main.chain(tail)))
    }

    async fn interrupt(&self) {
        self.core.interrupt();
    }

    async fn dispose(&self) {
        self.core.dispose();
    }
}

// ── Stream assembly ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Assembler {
    started: bool,
    text_open: bool,
    tool_count: u32,
    finish_reason: Option<StopReason>,
    usage: Option<Usage>,
    failed: bool,
}

impl Assembler {
    fn push(&mut self, v: &Value) -> Vec<DriveableEvent> {
        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.push(DriveableEvent::MessageStart);
        }

        if let Some(u) = v.get("usageMetadata") {
            self.usage = Some(Usage {
                input_tokens: u["promptTokenCount"].as_u64().unwrap_or(0) as u32,
                output_tokens: u["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
                cache_read_tokens: u["cachedContentTokenCount"].as_u64().unwrap_or(0) as u32,
                cache_write_tokens: 0,
            });
        }

        if let Some(error) = v.get("error") {
            self.failed = true;
            out.push(DriveableEvent::Error {
                message: error["message"].as_str().unwrap_or("provider error").to_string(),
            });
            return out;
        }

        let Some(candidate) = v["candidates"].get(0) else {
            return out;
        };

        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(text) = part["text"].as_str() {
                    if !text.is_empty() {
                        if !self.text_open {
                            self.text_open = true;
                            out.push(DriveableEvent::TextContentBlockStart { index: 0 });
                        }
                        out.push(DriveableEvent::TextDelta { text: text.to_string() });
                    }
                }
                if let Some(call) = part.get("functionCall") {
                    if self.text_open {
                        self.text_open = false;
                        out.push(DriveableEvent::TextContentBlockStop { index: 0 });
                    }
                    self.tool_count += 1;
                    let index = self.tool_count;
                    let name = call["name"].as_str().unwrap_or("").to_string();
                    // Gemini has no call ids; synthesize stable ones.
                    let id = format!("call_{index}");
                    out.push(DriveableEvent::ToolUseContentBlockStart {
                        index,
                        id,
                        name,
                    });
                    out.push(DriveableEvent::InputJsonDelta {
                        index,
                        partial_json: call["args"].to_string(),
                    });
                    out.push(DriveableEvent::ToolUseContentBlockStop { index });
                }
            }
        }

        if let Some(reason) = candidate["finishReason"].as_str() {
            self.finish_reason = Some(match reason {
                "STOP" => {
                    if self.tool_count > 0 { StopReason::ToolUse } else { StopReason::EndTurn }
                }
                "MAX_TOKENS" => StopReason::MaxTokens,
                "SAFETY" | "PROHIBITED_CONTENT" => StopReason::ContentFilter,
                _ => StopReason::Other,
            });
        }

        out
    }

    /// Terminal events, appended when the SSE stream ends (Gemini sends no
    /// `[DONE]` sentinel).
    fn finish(&mut self) -> Vec<DriveableEvent> {
        if self.failed || !self.started {
            // guard() turns an empty tail into a terminal error
            return Vec::new();
        }
        let mut out = Vec::new();
        if self.text_open {
            self.text_open = false;
            out.push(DriveableEvent::TextContentBlockStop { index: 0 });
        }
        out.push(DriveableEvent::MessageDelta {
            stop_reason: self.finish_reason.take().or(Some(StopReason::EndTurn)),
            usage: self.usage.take(),
        });
        out.push(DriveableEvent::MessageStop);
        out
    }
}

// ── Wire conversion ───────────────────────────────────────────────────────────

fn build_contents(messages: &[MessageRecord]) -> Vec<Value> {
    let mut contents = Vec::new();
    for msg in messages {
        match msg.role {
            // System history rides as user turns; the configured prompt uses
            // systemInstruction.
            Role::System | Role::User => contents.push(json!({
                "role": "user",
                "parts": user_parts(&msg.content),
            })),
            Role::Assistant | Role::ToolCall => {
                let mut parts: Vec<Value> = Vec::new();
                match &msg.content {
                    MessageContent::Text(t) => parts.push(json!({ "text": t })),
                    MessageContent::Parts(content_parts) => {
                        for p in content_parts {
                            match p {
                                ContentPart::Text { text } => parts.push(json!({ "text": text })),
                                ContentPart::ToolCall { name, input, .. } => parts.push(json!({
                                    "functionCall": { "name": name, "args": input },
                                })),
                                _ => {}
                            }
                        }
                    }
                }
                contents.push(json!({ "role": "model", "parts": parts }));
            }
            Role::ToolResult => {
                if let MessageContent::Parts(parts) = &msg.content {
                    for p in parts {
                        if let ContentPart::ToolResult { content, .. } = p {
                            contents.push(json!({
                                "role": "user",
                                "parts": [{
                                    "functionResponse": {
                                        "name": "tool",
                                        "response": { "content": content },
                                    }
                                }],
                            }));
                        }
                    }
                }
            }
        }
    }
    contents
}

fn user_parts(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(t) => vec![json!({ "text": t })],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(json!({ "text": text })),
                ContentPart::Image { image_url } => Some(image_part(image_url)),
                _ => None,
            })
            .collect(),
    }
}

/// Data URLs upload inline; anything else is passed by reference.
fn image_part(url: &str) -> Value {
    match parse_data_url(url) {
        Ok((mime, data)) => json!({ "inlineData": { "mimeType": mime, "data": data } }),
        Err(_) => json!({ "fileData": { "fileUri": url } }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
