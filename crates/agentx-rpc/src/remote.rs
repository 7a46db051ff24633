// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Remote runtime: the factory whose drivers are RPC stubs.
//!
//! A [`RemoteDriver`] forwards `receive` over the transport and replays the
//! server's `stream.event` notifications as its own drive stream, so the
//! agent machinery above it cannot tell a remote vendor from a local one.
//! Session history lives server-side; only the newest user message crosses
//! the wire.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use agentx_driver::{DriveStream, Driver, DriverCore, DriverState};
use agentx_store::{MemoryStore, Store};
use agentx_runtime::{Runtime, Sandbox};
use agentx_types::{
    DriveableEvent, EventPayload, ImageRecord, MessageRecord, Role, RuntimeError,
};

use crate::client::RpcClient;
use crate::wire::methods;

/// Driver stub that forwards `receive` calls over the transport.
pub struct RemoteDriver {
    core: DriverCore,
    client: RpcClient,
}

impl RemoteDriver {
    pub fn new(client: RpcClient, session_id: &str) -> Self {
        client.subscribe(session_id);
        Self { core: DriverCore::new("remote", session_id), client }
    }
}

#[async_trait]
impl Driver for RemoteDriver {
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

        let Some(user) = messages.iter().rev().find(|m| matches!(m.role, Role::User)) else {
            self.core.abort();
            return Err(RuntimeError::Protocol("receive without a user message".into()));
        };

        // Replay the session's forwarded stream events as the drive stream.
        let (tx, rx) = mpsc::channel::<DriveableEvent>(64);
        let session_id = self.core.session_id().to_string();
        let subscription = self.client.bus().on_any(move |event| {
            if event.topic() != Some(session_id.as_str()) {
                return;
            }
            if let EventPayload::Stream(ev) = &event.payload {
                if tx.try_send(ev.clone()).is_err() {
                    warn!("remote drive stream lagged; event dropped");
                }
            }
        });

        let params = serde_json::json!({
            "sessionId": self.core.session_id(),
            "content": &user.content,
        });
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.call(methods::MESSAGE_SEND, params).await {
                debug!("remote message.send failed: {e}");
            }
            // The terminal stream event has been forwarded by now (per-topic
            // delivery is in server emit order); tear the tap down.
            client.bus().off(subscription);
        });

        Ok(self.core.guard(token, ReceiverStream::new(rx)))
    }

    async fn interrupt(&self) {
        if let Some(agent_id) = self.find_agent_id().await {
            let _ = self
                .client
                .call(methods::AGENT_INTERRUPT, serde_json::json!({ "agentId": agent_id }))
                .await;
        }
        self.core.interrupt();
    }

    async fn dispose(&self) {
        self.client.unsubscribe(self.core.session_id());
        self.core.dispose();
    }
}

impl RemoteDriver {
    /// The server tracks agents by id; resolve ours through the session.
    async fn find_agent_id(&self) -> Option<String> {
        let agents = self.client.call(methods::AGENT_LIST, serde_json::json!({})).await.ok()?;
        agents
            .as_array()?
            .iter()
            .find(|a| a["sessionId"] == self.core.session_id())
            .and_then(|a| a["agentId"].as_str())
            .map(str::to_string)
    }
}

/// Runtime whose drivers are RPC stubs and whose repositories are a local
/// cache.  The server owns the durable store; this side only keeps what it
/// has seen.
pub struct RemoteRuntime {
    client: RpcClient,
    store: Arc<dyn Store>,
}

impl RemoteRuntime {
    pub fn new(client: RpcClient) -> Self {
        Self { client, store: Arc::new(MemoryStore::new()) }
    }
}

impl Runtime for RemoteRuntime {
    fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    fn create_driver(
        &self,
        session_id: &str,
        _image: &ImageRecord,
    ) -> Result<Arc<dyn Driver>, RuntimeError> {
        Ok(Arc::new(RemoteDriver::new(self.client.clone(), session_id)))
    }

    fn create_sandbox(&self, container_id: &str) -> Result<Sandbox, RuntimeError> {
        // Tools run server-side; the local sandbox is inert.
        Ok(Sandbox::new(container_id, std::env::temp_dir()))
    }
}
