// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! JSON-RPC 2.0 wire types plus the reliable-delivery envelope.
//!
//! Everything is JSON over WebSocket text frames.  A sender that wants
//! reliable delivery wraps its message as `{"msgId": "...", "payload": ...}`
//! and retains it until the peer acknowledges with `control.ack {msgId}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use agentx_types::RuntimeError;

pub const JSONRPC_VERSION: &str = "2.0";

// ── Method names ──────────────────────────────────────────────────────────────

pub mod methods {
    pub const CONTAINER_CREATE: &str = "container.create";
    pub const CONTAINER_GET: &str = "container.get";
    pub const CONTAINER_LIST: &str = "container.list";

    pub const IMAGE_CREATE: &str = "image.create";
    pub const IMAGE_GET: &str = "image.get";
    pub const IMAGE_LIST: &str = "image.list";
    pub const IMAGE_DELETE: &str = "image.delete";
    pub const IMAGE_RUN: &str = "image.run";
    pub const IMAGE_STOP: &str = "image.stop";
    pub const IMAGE_UPDATE: &str = "image.update";
    pub const IMAGE_MESSAGES: &str = "image.messages";

    pub const AGENT_GET: &str = "agent.get";
    pub const AGENT_LIST: &str = "agent.list";
    pub const AGENT_DESTROY: &str = "agent.destroy";
    pub const AGENT_DESTROY_ALL: &str = "agent.destroyAll";
    pub const AGENT_INTERRUPT: &str = "agent.interrupt";

    pub const MESSAGE_SEND: &str = "message.send";

    pub const SESSION_GET: &str = "session.get";
    pub const SESSION_LIST: &str = "session.list";
    pub const SESSION_MESSAGES: &str = "session.messages";
    pub const SESSION_FORK: &str = "session.fork";

    pub const DEFINITION_REGISTER: &str = "definition.register";
    pub const DEFINITION_UNREGISTER: &str = "definition.unregister";
    pub const DEFINITION_GET: &str = "definition.get";
    pub const DEFINITION_LIST: &str = "definition.list";

    // Reserved notifications.
    pub const STREAM_EVENT: &str = "stream.event";
    pub const CONTROL_ACK: &str = "control.ack";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const AUTH: &str = "auth";
}

// ── Error codes ───────────────────────────────────────────────────────────────

pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_ERROR: i64 = -32000;
    pub const UNAUTHORIZED: i64 = 401;
    pub const FORBIDDEN: i64 = 403;
    pub const NOT_FOUND: i64 = 404;
    pub const TIMEOUT: i64 = 408;
}

// ── Message kinds ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&RuntimeError> for RpcErrorBody {
    fn from(e: &RuntimeError) -> Self {
        Self { code: e.rpc_code(), message: e.to_string(), data: None }
    }
}

impl RpcErrorBody {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn into_runtime_error(self) -> RuntimeError {
        RuntimeError::from_rpc(self.code, &self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.into(), id, result: Some(result), error: None }
    }

    pub fn failure(id: Value, error: RpcErrorBody) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.into(), id, result: None, error: Some(error) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.into(), method: method.into(), params }
    }
}

/// One JSON-RPC message.  Kind is decided by shape: `id`+`method` is a
/// request, `id` without `method` is a response, `method` without `id` is a
/// notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
    Notification(RpcNotification),
}

// ── Reliable envelope ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReliableEnvelope {
    #[serde(rename = "msgId")]
    pub msg_id: String,
    pub payload: RpcMessage,
}

/// One WebSocket text frame: either a reliable-wrapped message or a bare one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Frame {
    Reliable(ReliableEnvelope),
    Bare(RpcMessage),
}

impl Frame {
    pub fn decode(text: &str) -> Result<Frame, RuntimeError> {
        serde_json::from_str(text)
            .map_err(|e| RuntimeError::Protocol(format!("malformed frame: {e}")))
    }

    pub fn encode(&self) -> String {
        // Wire types contain only JSON-representable data.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// `control.ack` notification for one message id.
pub fn ack_notification(msg_id: &str) -> RpcNotification {
    RpcNotification::new(methods::CONTROL_ACK, serde_json::json!({ "msgId": msg_id }))
}

/// `stream.event` notification payload.
pub fn stream_event_notification(topic: &str, event: &agentx_types::Event) -> RpcNotification {
    RpcNotification::new(
        methods::STREAM_EVENT,
        serde_json::json!({ "topic": topic, "event": event }),
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_shape_decides_message_kind() {
        let req = Frame::decode(r#"{"jsonrpc":"2.0","id":1,"method":"agent.list","params":{}}"#)
            .unwrap();
        assert!(matches!(req, Frame::Bare(RpcMessage::Request(_))));

        let resp = Frame::decode(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#).unwrap();
        assert!(matches!(resp, Frame::Bare(RpcMessage::Response(_))));

        let notif = Frame::decode(r#"{"jsonrpc":"2.0","method":"subscribe","params":{"topic":"sess_1"}}"#)
            .unwrap();
        assert!(matches!(notif, Frame::Bare(RpcMessage::Notification(_))));
    }

    #[test]
    fn reliable_envelope_round_trips() {
        let frame = Frame::Reliable(ReliableEnvelope {
            msg_id: "m-1".into(),
            payload: RpcMessage::Request(RpcRequest::new(7, "message.send", json!({"x":1}))),
        });
        let text = frame.encode();
        assert!(text.contains("\"msgId\":\"m-1\""));
        let back = Frame::decode(&text).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn error_response_round_trips_through_runtime_error() {
        let e = RuntimeError::NotFound("agent agent_1 not found".into());
        let body = RpcErrorBody::from(&e);
        assert_eq!(body.code, codes::NOT_FOUND);
        let back = body.into_runtime_error();
        assert!(matches!(back, RuntimeError::NotFound(_)));
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        assert!(matches!(
            Frame::decode("{nope"),
            Err(RuntimeError::Protocol(_))
        ));
    }

    #[test]
    fn ack_carries_the_msg_id() {
        let ack = ack_notification("m-42");
        assert_eq!(ack.method, "control.ack");
        assert_eq!(ack.params["msgId"], "m-42");
    }
}
