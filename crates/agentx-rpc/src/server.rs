// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket RPC server — bridges browser and node clients to the platform.
//!
//! # Wire format
//!
//! JSON-RPC 2.0 over WebSocket text frames (§ wire module).  Browsers cannot
//! set WebSocket headers, so the first frame on a fresh connection must be an
//! `auth` notification carrying the token; the server rejects any other
//! traffic until authentication succeeds.
//!
//! # Fan-out
//!
//! A `subscribe {topic}` notification registers interest in a topic
//! (typically a session id).  Every bus event scoped to that topic is
//! forwarded as a `stream.event` notification, in server emit order, to
//! every subscribed socket — and to nobody else.
//!
//! # Reliable delivery
//!
//! A client may wrap any message as `{msgId, payload}`.  The server always
//! acks, executes each `msgId` at most once, and replays the recorded
//! response when a retry re-delivers a message whose ACK got lost.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use agentx_runtime::{CreateImageParams, Platform, SendTarget};
use agentx_types::{Definition, MessageContent, RuntimeError};

use crate::wire::{
    ack_notification, codes, methods, stream_event_notification, Frame, RpcErrorBody, RpcMessage,
    RpcRequest, RpcResponse,
};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Token clients must present in their `auth` frame.  `None` disables
    /// authentication (trusted/local deployments).
    pub auth_token: Option<String>,
    /// Interrupt agents whose sole subscriber disconnects.  Opt-in.
    pub interrupt_on_disconnect: bool,
}

struct ServerState {
    platform: Arc<Platform>,
    config: ServerConfig,
    /// Reliable msg ids already handled, with the recorded response frame
    /// (None while the request is still executing).
    processed: StdMutex<HashMap<String, Option<String>>>,
}

pub struct RpcServer {
    state: Arc<ServerState>,
}

impl RpcServer {
    pub fn new(platform: Arc<Platform>, config: ServerConfig) -> Self {
        Self {
            state: Arc::new(ServerState {
                platform,
                config,
                processed: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new().route("/ws", get(ws_handler)).with_state(Arc::clone(&self.state))
    }

    /// Bind and serve until the process exits.
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "rpc server listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Bind on an ephemeral port and serve in the background (tests).
    pub async fn spawn(self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let router = self.router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!("rpc server stopped: {e}");
            }
        });
        Ok(local)
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// ── Per-connection state ──────────────────────────────────────────────────────

struct Connection {
    state: Arc<ServerState>,
    out_tx: mpsc::UnboundedSender<String>,
    authed: AtomicBool,
    topics: StdMutex<HashSet<String>>,
}

impl Connection {
    fn send_frame(&self, frame: &Frame) {
        let _ = self.out_tx.send(frame.encode());
    }

    fn send_message(&self, msg: RpcMessage) {
        self.send_frame(&Frame::Bare(msg));
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    info!("websocket client connected");
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let conn = Arc::new(Connection {
        authed: AtomicBool::new(state.config.auth_token.is_none()),
        state,
        out_tx,
        topics: StdMutex::new(HashSet::new()),
    });

    // Forward bus events for subscribed topics, in server emit order.
    let bus = conn.state.platform.bus().clone();
    let forwarder = {
        let conn = Arc::clone(&conn);
        bus.on_any(move |event| {
            let Some(topic) = event.topic() else { return };
            let subscribed = conn
                .topics
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(topic);
            if subscribed {
                let notification = stream_event_notification(topic, event);
                conn.send_message(RpcMessage::Notification(notification));
            }
        })
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_frame(&conn, &text),
                Some(Ok(Message::Ping(data))) => {
                    if ws_tx.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary frames ignored
                Some(Err(e)) => {
                    debug!("websocket recv error: {e}");
                    break;
                }
            },
        }
    }

    bus.off(forwarder);

    if conn.state.config.interrupt_on_disconnect {
        let topics: Vec<String> =
            conn.topics.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect();
        for topic in topics {
            if let Some(agent) = conn.state.platform.agent_by_session(&topic) {
                debug!(session = %topic, "interrupting agent after disconnect");
                agent.interrupt().await;
            }
        }
    }

    info!("websocket client disconnected");
}

// ── Frame handling ────────────────────────────────────────────────────────────

fn handle_frame(conn: &Arc<Connection>, text: &str) {
    let frame = match Frame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("malformed frame: {e}");
            conn.send_message(RpcMessage::Response(RpcResponse::failure(
                Value::Null,
                RpcErrorBody::new(codes::PARSE_ERROR, e.to_string()),
            )));
            return;
        }
    };

    match frame {
        Frame::Reliable(envelope) => {
            // Ack first — delivery and execution are separate concerns.
            conn.send_message(RpcMessage::Notification(ack_notification(&envelope.msg_id)));

            let replay = {
                let mut processed =
                    conn.state.processed.lock().unwrap_or_else(|e| e.into_inner());
                match processed.get(&envelope.msg_id) {
                    // Retry of a finished request: replay the response.
                    Some(Some(response)) => Some(response.clone()),
                    // Still executing; the ack above is all the retry needs.
                    Some(None) => return,
                    None => {
                        processed.insert(envelope.msg_id.clone(), None);
                        None
                    }
                }
            };
            if let Some(response) = replay {
                let _ = conn.out_tx.send(response);
                return;
            }
            process_message(conn, envelope.payload, Some(envelope.msg_id));
        }
        Frame::Bare(msg) => process_message(conn, msg, None),
    }
}

fn process_message(conn: &Arc<Connection>, msg: RpcMessage, reliable_id: Option<String>) {
    match msg {
        RpcMessage::Notification(n) => handle_notification(conn, n.method.as_str(), n.params),
        RpcMessage::Request(request) => {
            if !conn.authed.load(Ordering::SeqCst) {
                conn.send_message(RpcMessage::Response(RpcResponse::failure(
                    request.id,
                    RpcErrorBody::new(codes::UNAUTHORIZED, "authenticate first"),
                )));
                return;
            }
            // Requests run on their own task so a long turn (message.send)
            // never blocks the socket loop.
            let conn = Arc::clone(conn);
            tokio::spawn(async move {
                let response = dispatch_request(&conn, request).await;
                let text = Frame::Bare(RpcMessage::Response(response)).encode();
                if let Some(msg_id) = reliable_id {
                    conn.state
                        .processed
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(msg_id, Some(text.clone()));
                }
                let _ = conn.out_tx.send(text);
            });
        }
        RpcMessage::Response(_) => {
            // The server issues no requests, so responses are unexpected.
            debug!("ignoring unsolicited response frame");
        }
    }
}

#[derive(Deserialize)]
struct AuthParams {
    token: String,
}

#[derive(Deserialize)]
struct TopicParams {
    topic: String,
}

fn handle_notification(conn: &Arc<Connection>, method: &str, params: Value) {
    if method == methods::AUTH {
        let presented = serde_json::from_value::<AuthParams>(params).ok().map(|p| p.token);
        let expected = conn.state.config.auth_token.as_deref();
        match (presented.as_deref(), expected) {
            (_, None) => conn.authed.store(true, Ordering::SeqCst),
            (Some(token), Some(expected)) if token == expected => {
                debug!("client authenticated");
                conn.authed.store(true, Ordering::SeqCst);
            }
            _ => warn!("auth rejected"),
        }
        return;
    }

    if !conn.authed.load(Ordering::SeqCst) {
        warn!(method, "dropping pre-auth notification");
        return;
    }

    match method {
        methods::SUBSCRIBE => {
            if let Ok(p) = serde_json::from_value::<TopicParams>(params) {
                debug!(topic = %p.topic, "subscribed");
                conn.topics.lock().unwrap_or_else(|e| e.into_inner()).insert(p.topic);
            }
        }
        methods::UNSUBSCRIBE => {
            if let Ok(p) = serde_json::from_value::<TopicParams>(params) {
                conn.topics.lock().unwrap_or_else(|e| e.into_inner()).remove(&p.topic);
            }
        }
        methods::CONTROL_ACK => {
            // Server→client reliable delivery is not enabled; nothing to clear.
        }
        other => debug!(method = other, "ignoring unknown notification"),
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerCreateParams {
    #[serde(default)]
    container_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerIdParams {
    container_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageIdParams {
    image_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageListParams {
    #[serde(default)]
    definition_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageRunParams {
    image_id: String,
    #[serde(default)]
    container_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageUpdateParams {
    image_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    custom_data: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentIdParams {
    agent_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageSendParams {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    content: MessageContent,
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIdParams {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionListParams {
    #[serde(default)]
    image_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionForkParams {
    session_id: String,
    #[serde(default)]
    at_message_id: Option<String>,
}

async fn dispatch_request(conn: &Arc<Connection>, request: RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    match dispatch(&conn.state.platform, &request.method, request.params).await {
        Ok(result) => RpcResponse::success(id, result),
        Err(e) => RpcResponse::failure(id, e),
    }
}

fn params<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, RpcErrorBody> {
    serde_json::from_value(value)
        .map_err(|e| RpcErrorBody::new(codes::INVALID_PARAMS, format!("invalid params: {e}")))
}

fn ok<T: serde::Serialize>(value: T) -> Result<Value, RpcErrorBody> {
    serde_json::to_value(value)
        .map_err(|e| RpcErrorBody::new(codes::INTERNAL_ERROR, e.to_string()))
}

fn rpc_err(e: RuntimeError) -> RpcErrorBody {
    RpcErrorBody::from(&e)
}

async fn dispatch(
    platform: &Arc<Platform>,
    method: &str,
    raw: Value,
) -> Result<Value, RpcErrorBody> {
    match method {
        methods::CONTAINER_CREATE => {
            let p: ContainerCreateParams = params(raw)?;
            let container =
                platform.container_create(p.container_id).await.map_err(rpc_err)?;
            ok(container.record())
        }
        methods::CONTAINER_GET => {
            let p: ContainerIdParams = params(raw)?;
            let container = platform.container_get(&p.container_id).ok_or_else(|| {
                rpc_err(RuntimeError::NotFound(format!(
                    "container {} not found",
                    p.container_id
                )))
            })?;
            ok(container.record())
        }
        methods::CONTAINER_LIST => ok(platform.container_list().await.map_err(rpc_err)?),

        methods::IMAGE_CREATE => {
            let p: CreateImageParams = params(raw)?;
            ok(platform.image_create(p).await.map_err(rpc_err)?)
        }
        methods::IMAGE_GET => {
            let p: ImageIdParams = params(raw)?;
            ok(platform.image_get(&p.image_id).await.map_err(rpc_err)?)
        }
        methods::IMAGE_LIST => {
            let p: ImageListParams = params(raw)?;
            ok(platform
                .image_list(p.definition_name.as_deref())
                .await
                .map_err(rpc_err)?)
        }
        methods::IMAGE_DELETE => {
            let p: ImageIdParams = params(raw)?;
            platform.image_delete(&p.image_id).await.map_err(rpc_err)?;
            ok(true)
        }
        methods::IMAGE_RUN => {
            let p: ImageRunParams = params(raw)?;
            let agent = platform
                .image_run(&p.image_id, p.container_id.as_deref())
                .await
                .map_err(rpc_err)?;
            ok(agent.info())
        }
        methods::IMAGE_STOP => {
            let p: ImageIdParams = params(raw)?;
            platform.image_stop(&p.image_id).await.map_err(rpc_err)?;
            ok(true)
        }
        methods::IMAGE_UPDATE => {
            let p: ImageUpdateParams = params(raw)?;
            ok(platform
                .image_update(&p.image_id, p.name, p.custom_data)
                .await
                .map_err(rpc_err)?)
        }
        methods::IMAGE_MESSAGES => {
            let p: ImageIdParams = params(raw)?;
            ok(platform.image_messages(&p.image_id).await.map_err(rpc_err)?)
        }

        methods::AGENT_GET => {
            let p: AgentIdParams = params(raw)?;
            let agent = platform.agent_get(&p.agent_id).ok_or_else(|| {
                rpc_err(RuntimeError::NotFound(format!("agent {} not found", p.agent_id)))
            })?;
            ok(agent.info())
        }
        methods::AGENT_LIST => ok(platform.agent_list()),
        methods::AGENT_DESTROY => {
            let p: AgentIdParams = params(raw)?;
            platform.agent_destroy(&p.agent_id).await.map_err(rpc_err)?;
            ok(true)
        }
        methods::AGENT_DESTROY_ALL => {
            platform.agent_destroy_all().await;
            ok(true)
        }
        methods::AGENT_INTERRUPT => {
            let p: AgentIdParams = params(raw)?;
            platform.agent_interrupt(&p.agent_id).await.map_err(rpc_err)?;
            ok(true)
        }

        methods::MESSAGE_SEND => {
            let p: MessageSendParams = params(raw)?;
            let target = match (p.agent_id, p.session_id) {
                (Some(agent_id), _) => SendTarget::Agent(agent_id),
                (None, Some(session_id)) => SendTarget::Session(session_id),
                (None, None) => {
                    return Err(RpcErrorBody::new(
                        codes::INVALID_PARAMS,
                        "message.send needs agentId or sessionId",
                    ));
                }
            };
            platform.message_send(target, p.content).await.map_err(rpc_err)?;
            ok(true)
        }

        methods::SESSION_GET => {
            let p: SessionIdParams = params(raw)?;
            let handle = platform.session_get(&p.session_id).await.map_err(rpc_err)?;
            ok(handle.record())
        }
        methods::SESSION_LIST => {
            let p: SessionListParams = params(raw)?;
            ok(platform.session_list(p.image_id.as_deref()).await.map_err(rpc_err)?)
        }
        methods::SESSION_MESSAGES => {
            let p: SessionIdParams = params(raw)?;
            let handle = platform.session_get(&p.session_id).await.map_err(rpc_err)?;
            ok(handle.messages().await.map_err(rpc_err)?)
        }
        methods::SESSION_FORK => {
            let p: SessionForkParams = params(raw)?;
            let handle = platform.session_get(&p.session_id).await.map_err(rpc_err)?;
            let forked = handle.fork(p.at_message_id.as_deref()).await.map_err(rpc_err)?;
            ok(forked.record())
        }

        methods::DEFINITION_REGISTER => {
            let definition: Definition = params(raw)?;
            ok(platform.register_definition(definition).await.map_err(rpc_err)?)
        }
        methods::DEFINITION_UNREGISTER => {
            let p: NameParams = params(raw)?;
            platform.unregister_definition(&p.name).await.map_err(rpc_err)?;
            ok(true)
        }
        methods::DEFINITION_GET => {
            let p: NameParams = params(raw)?;
            ok(platform.get_definition(&p.name).await.map_err(rpc_err)?)
        }
        methods::DEFINITION_LIST => ok(platform.list_definitions().await.map_err(rpc_err)?),

        unknown => Err(RpcErrorBody::new(
            codes::METHOD_NOT_FOUND,
            format!("unknown method '{unknown}'"),
        )),
    }
}
