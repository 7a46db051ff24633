// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket RPC client.
//!
//! Mirrors the platform API over a socket: pending calls matched by id with
//! a per-call timeout, reliable sends retained until `control.ack`,
//! exponential-backoff reconnect that resends unacked messages and restores
//! subscriptions, and `stream.event` notifications re-emitted on a local bus
//! so remote consumers read events exactly like local ones.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use agentx_bus::EventBus;
use agentx_types::{Event, RuntimeError};

use crate::wire::{
    ack_notification, methods, Frame, ReliableEnvelope, RpcMessage, RpcNotification, RpcRequest,
};

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ClientOptions {
    /// `ws://host:port/ws` endpoint.
    pub url: String,
    pub token: Option<String>,
    /// Per-call timeout.
    pub timeout: Duration,
    pub auto_reconnect: bool,
    /// Reliable-delivery retry budget.
    pub ack_attempts: u32,
    pub ack_base_delay: Duration,
    pub ack_max_delay: Duration,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout: Duration::from_secs(30),
            auto_reconnect: true,
            ack_attempts: 3,
            ack_base_delay: Duration::from_secs(1),
            ack_max_delay: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

struct Unacked {
    text: String,
    attempts: u32,
    next_retry: Instant,
    /// Pending call to fail when the retry budget runs out.
    request_id: Option<u64>,
}

struct ClientInner {
    opts: ClientOptions,
    bus: EventBus,
    next_id: AtomicU64,
    pending: StdMutex<HashMap<u64, oneshot::Sender<Result<Value, RuntimeError>>>>,
    unacked: StdMutex<HashMap<String, Unacked>>,
    topics: StdMutex<HashSet<String>>,
    out: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    /// Reliable msg ids already processed (incoming dedupe).
    seen: StdMutex<HashSet<String>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Connect, authenticate, and start the IO and retry tasks.  Fails if
    /// the first connection attempt fails; reconnects after that are
    /// automatic (unless disabled).
    pub async fn connect(opts: ClientOptions) -> Result<Self, RuntimeError> {
        let inner = Arc::new(ClientInner {
            opts,
            bus: EventBus::new(),
            next_id: AtomicU64::new(1),
            pending: StdMutex::new(HashMap::new()),
            unacked: StdMutex::new(HashMap::new()),
            topics: StdMutex::new(HashSet::new()),
            out: StdMutex::new(None),
            seen: StdMutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(connection_loop(Arc::clone(&inner), ready_tx));
        tokio::spawn(retry_loop(Arc::clone(&inner)));

        ready_rx
            .await
            .map_err(|_| RuntimeError::Transport("connection task died".into()))??;
        Ok(Self { inner })
    }

    /// Events forwarded from the server (`stream.event`) surface here.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Issue one request and await its response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RuntimeError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let request = RpcMessage::Request(RpcRequest::new(id, method, params));
        self.inner.send_reliable(request, Some(id));

        match tokio::time::timeout(self.inner.opts.timeout, rx).await {
            Err(_) => {
                self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                Err(RuntimeError::Timeout(format!("{method} timed out")))
            }
            Ok(Err(_)) => Err(RuntimeError::Transport("connection closed".into())),
            Ok(Ok(result)) => result,
        }
    }

    /// Fire-and-forget notification (best effort, no reliable wrapper).
    pub fn notify(&self, method: &str, params: Value) {
        self.inner
            .send_raw(Frame::Bare(RpcMessage::Notification(RpcNotification::new(method, params))).encode());
    }

    /// Fire a notification with reliable delivery.
    pub fn notify_reliable(&self, method: &str, params: Value) {
        self.inner
            .send_reliable(RpcMessage::Notification(RpcNotification::new(method, params)), None);
    }

    /// Start receiving `stream.event` notifications for a topic.
    pub fn subscribe(&self, topic: impl Into<String>) {
        let topic = topic.into();
        self.inner
            .topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.clone());
        self.notify(methods::SUBSCRIBE, serde_json::json!({ "topic": topic }));
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.inner.topics.lock().unwrap_or_else(|e| e.into_inner()).remove(topic);
        self.notify(methods::UNSUBSCRIBE, serde_json::json!({ "topic": topic }));
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        *self.inner.out.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl ClientInner {
    fn send_raw(&self, text: String) {
        if let Some(out) = self.out.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = out.send(text);
        }
        // Disconnected: reliable messages are resent on reconnect; bare
        // notifications are best effort by contract.
    }

    fn send_reliable(&self, msg: RpcMessage, request_id: Option<u64>) {
        let msg_id = Uuid::new_v4().to_string();
        let text = Frame::Reliable(ReliableEnvelope { msg_id: msg_id.clone(), payload: msg }).encode();
        self.unacked.lock().unwrap_or_else(|e| e.into_inner()).insert(
            msg_id,
            Unacked {
                text: text.clone(),
                attempts: 1,
                next_retry: Instant::now() + self.opts.ack_base_delay,
                request_id,
            },
        );
        self.send_raw(text);
    }

    fn fail_pending(&self, request_id: u64, error: RuntimeError) {
        if let Some(tx) = self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&request_id)
        {
            let _ = tx.send(Err(error));
        }
    }
}

// ── Connection management ─────────────────────────────────────────────────────

async fn connection_loop(
    inner: Arc<ClientInner>,
    ready: oneshot::Sender<Result<(), RuntimeError>>,
) {
    let mut ready = Some(ready);
    let mut backoff = Duration::from_secs(1);

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        match connect_async(inner.opts.url.as_str()).await {
            Ok((socket, _)) => {
                info!(url = %inner.opts.url, "rpc client connected");
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
                backoff = Duration::from_secs(1);
                run_connection(&inner, socket).await;
                warn!("rpc connection lost");
            }
            Err(e) => {
                if let Some(tx) = ready.take() {
                    // First attempt failed: surface it and stop.
                    let _ = tx.send(Err(RuntimeError::Transport(format!(
                        "connect to {} failed: {e}",
                        inner.opts.url
                    ))));
                    return;
                }
                debug!("reconnect failed: {e}");
            }
        }

        if inner.closed.load(Ordering::SeqCst) || !inner.opts.auto_reconnect {
            // Fail whatever is still waiting.
            let pending: Vec<u64> = inner
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .copied()
                .collect();
            for id in pending {
                inner.fail_pending(id, RuntimeError::Transport("connection closed".into()));
            }
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(10));
    }
}

async fn run_connection(
    inner: &Arc<ClientInner>,
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    *inner.out.lock().unwrap_or_else(|e| e.into_inner()) = Some(out_tx);

    // Browsers cannot set headers, so the token rides the first frame.
    if let Some(token) = &inner.opts.token {
        let auth = Frame::Bare(RpcMessage::Notification(RpcNotification::new(
            methods::AUTH,
            serde_json::json!({ "token": token }),
        )));
        inner.send_raw(auth.encode());
    }

    // Resend unacked messages and restore subscriptions.
    let resend: Vec<String> = inner
        .unacked
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .values()
        .map(|u| u.text.clone())
        .collect();
    for text in resend {
        inner.send_raw(text);
    }
    let topics: Vec<String> = inner
        .topics
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    for topic in topics {
        let sub = Frame::Bare(RpcMessage::Notification(RpcNotification::new(
            methods::SUBSCRIBE,
            serde_json::json!({ "topic": topic }),
        )));
        inner.send_raw(sub.encode());
    }

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
                Some(Ok(Message::Text(text))) => handle_incoming(inner, &text),
                Some(Ok(Message::Ping(_))) => {} // tungstenite answers pings itself
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("rpc recv error: {e}");
                    break;
                }
            },
        }
    }

    *inner.out.lock().unwrap_or_else(|e| e.into_inner()) = None;
}

fn handle_incoming(inner: &Arc<ClientInner>, text: &str) {
    let frame = match Frame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("dropping malformed frame: {e}");
            return;
        }
    };

    match frame {
        Frame::Reliable(envelope) => {
            inner.send_raw(
                Frame::Bare(RpcMessage::Notification(ack_notification(&envelope.msg_id))).encode(),
            );
            let fresh = inner
                .seen
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(envelope.msg_id);
            if fresh {
                handle_message(inner, envelope.payload);
            }
        }
        Frame::Bare(msg) => handle_message(inner, msg),
    }
}

fn handle_message(inner: &Arc<ClientInner>, msg: RpcMessage) {
    match msg {
        RpcMessage::Response(response) => {
            let Some(id) = response.id.as_u64() else { return };
            // A response is an implicit ack for the request that caused it.
            inner
                .unacked
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|_, u| u.request_id != Some(id));
            let waiter = inner.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            if let Some(tx) = waiter {
                let result = match (response.result, response.error) {
                    (_, Some(error)) => Err(error.into_runtime_error()),
                    (Some(result), None) => Ok(result),
                    (None, None) => Ok(Value::Null),
                };
                let _ = tx.send(result);
            }
        }
        RpcMessage::Notification(n) => match n.method.as_str() {
            methods::CONTROL_ACK => {
                if let Some(msg_id) = n.params.get("msgId").and_then(Value::as_str) {
                    inner.unacked.lock().unwrap_or_else(|e| e.into_inner()).remove(msg_id);
                }
            }
            methods::STREAM_EVENT => {
                match serde_json::from_value::<Event>(n.params["event"].clone()) {
                    Ok(event) => inner.bus.emit(event),
                    Err(e) => warn!("undecodable stream event: {e}"),
                }
            }
            other => debug!(method = other, "ignoring notification"),
        },
        RpcMessage::Request(_) => {
            // Server→client requests are not part of the protocol surface yet.
            debug!("ignoring server-initiated request");
        }
    }
}

// ── Ack retry ─────────────────────────────────────────────────────────────────

async fn retry_loop(inner: Arc<ClientInner>) {
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    loop {
        tick.tick().await;
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let now = Instant::now();
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();
        {
            let mut unacked = inner.unacked.lock().unwrap_or_else(|e| e.into_inner());
            for (msg_id, entry) in unacked.iter_mut() {
                if entry.next_retry > now {
                    continue;
                }
                if entry.attempts >= inner.opts.ack_attempts {
                    exhausted.push((msg_id.clone(), entry.request_id));
                    continue;
                }
                entry.attempts += 1;
                let delay = inner
                    .opts
                    .ack_base_delay
                    .checked_mul(1 << (entry.attempts - 1))
                    .unwrap_or(inner.opts.ack_max_delay)
                    .min(inner.opts.ack_max_delay);
                entry.next_retry = now + delay;
                resend.push(entry.text.clone());
            }
            for (msg_id, _) in &exhausted {
                unacked.remove(msg_id);
            }
        }

        for text in resend {
            debug!("resending unacked message");
            inner.send_raw(text);
        }
        for (_, request_id) in exhausted {
            warn!("reliable delivery exhausted its retry budget");
            if let Some(id) = request_id {
                inner.fail_pending(
                    id,
                    RuntimeError::Transport("ack retries exhausted".into()),
                );
            }
        }
    }
}
