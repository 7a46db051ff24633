// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The `AgentX` façade: one API, two backings.
//!
//! With an `api_key` the façade runs a local platform in-process; with a
//! `server_url` it speaks JSON-RPC to a remote one.  Namespace handles
//! (`containers()`, `images()`, `agents()`, `sessions()`, `presentations()`)
//! expose the same operations either way, and `on`/`on_any`/`subscribe`
//! surface the same event stream a local consumer would see.

pub mod presentation;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use agentx_bus::{EventBus, SubscribeOpts, SubscriptionId};
use agentx_rpc::wire::methods;
use agentx_rpc::{ClientOptions, RpcClient};
use agentx_runtime::{
    AgentInfo, CreateImageParams, LocalRuntime, Platform, RuntimeOptions, SendTarget,
};
use agentx_types::{
    ContainerRecord, Definition, Event, ImageRecord, MessageContent, MessageRecord, RuntimeError,
    SessionRecord,
};

pub use presentation::{
    reduce, Block, Conversation, PresentationState, PresentationStatus,
};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Client configuration.  Mode selection: a `server_url` means remote, an
/// `api_key` means local; `server_url` wins when both are set.
#[derive(Clone)]
pub struct AgentXConfig {
    pub server_url: Option<String>,
    /// Auth token presented in the first frame (remote mode).
    pub token: Option<String>,
    pub api_key: Option<String>,
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Local repository location; `":memory:"` allowed.
    pub data_path: String,
    pub timeout: Duration,
    pub auto_reconnect: bool,
    pub debug: bool,
}

impl Default for AgentXConfig {
    fn default() -> Self {
        let data_path = dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".agentx/data/agentx.db")
            .to_string_lossy()
            .into_owned();
        Self {
            server_url: None,
            token: None,
            api_key: None,
            provider: "anthropic".into(),
            model: None,
            base_url: None,
            data_path,
            timeout: Duration::from_secs(30),
            auto_reconnect: true,
            debug: false,
        }
    }
}

enum Backing {
    Local(Arc<Platform>),
    Remote(RpcClient),
}

/// The platform façade.
pub struct AgentX {
    backing: Backing,
}

impl AgentX {
    pub async fn connect(config: AgentXConfig) -> Result<Self, RuntimeError> {
        match &config.server_url {
            Some(url) => {
                debug!(%url, "agentx in remote mode");
                let mut opts = ClientOptions::new(url.clone());
                opts.token = config.token.clone();
                opts.timeout = config.timeout;
                opts.auto_reconnect = config.auto_reconnect;
                let client = RpcClient::connect(opts).await?;
                Ok(Self { backing: Backing::Remote(client) })
            }
            None => {
                debug!("agentx in local mode");
                let options = RuntimeOptions {
                    provider: config.provider.clone(),
                    model: config.model.clone(),
                    api_key: config.api_key.clone(),
                    base_url: config.base_url.clone(),
                    data_path: config.data_path.clone(),
                    ..Default::default()
                };
                let runtime = Arc::new(LocalRuntime::new(options)?);
                Ok(Self { backing: Backing::Local(Platform::new(runtime)) })
            }
        }
    }

    /// Wrap an existing platform (embedders and tests).
    pub fn local(platform: Arc<Platform>) -> Self {
        Self { backing: Backing::Local(platform) }
    }

    /// The event bus this façade observes: the platform's own bus locally,
    /// the forwarded `stream.event` bus remotely.
    pub fn bus(&self) -> &EventBus {
        match &self.backing {
            Backing::Local(platform) => platform.bus(),
            Backing::Remote(client) => client.bus(),
        }
    }

    pub fn on<I, S>(
        &self,
        kinds: I,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> SubscriptionId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bus().on(kinds, handler, SubscribeOpts::default())
    }

    pub fn on_any(&self, handler: impl Fn(&Event) + Send + Sync + 'static) -> SubscriptionId {
        self.bus().on_any(handler)
    }

    pub fn off(&self, id: SubscriptionId) {
        self.bus().off(id);
    }

    /// Start receiving a session's events.  Locally every event is already
    /// on the bus; remotely this subscribes the socket to the topic.
    pub fn subscribe(&self, session_id: &str) {
        if let Backing::Remote(client) = &self.backing {
            client.subscribe(session_id);
        }
    }

    pub fn unsubscribe(&self, session_id: &str) {
        if let Backing::Remote(client) = &self.backing {
            client.unsubscribe(session_id);
        }
    }

    // ── Namespaces ────────────────────────────────────────────────────────────

    pub fn definitions(&self) -> Definitions<'_> {
        Definitions { ax: self }
    }

    pub fn containers(&self) -> Containers<'_> {
        Containers { ax: self }
    }

    pub fn images(&self) -> Images<'_> {
        Images { ax: self }
    }

    pub fn agents(&self) -> Agents<'_> {
        Agents { ax: self }
    }

    pub fn sessions(&self) -> Sessions<'_> {
        Sessions { ax: self }
    }

    pub fn presentations(&self) -> Presentations<'_> {
        Presentations { ax: self }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        client: &RpcClient,
        method: &str,
        params: Value,
    ) -> Result<T, RuntimeError> {
        let result = client.call(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| RuntimeError::Protocol(format!("bad {method} result: {e}")))
    }
}

// ── Definitions ───────────────────────────────────────────────────────────────

pub struct Definitions<'a> {
    ax: &'a AgentX,
}

impl Definitions<'_> {
    /// Register a definition; its meta image comes back.
    pub async fn register(&self, definition: Definition) -> Result<ImageRecord, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.register_definition(definition).await,
            Backing::Remote(c) => {
                let params = serde_json::to_value(&definition)
                    .map_err(|e| RuntimeError::Internal(e.to_string()))?;
                self.ax.call(c, methods::DEFINITION_REGISTER, params).await
            }
        }
    }

    pub async fn unregister(&self, name: &str) -> Result<(), RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.unregister_definition(name).await,
            Backing::Remote(c) => {
                c.call(methods::DEFINITION_UNREGISTER, json!({ "name": name })).await?;
                Ok(())
            }
        }
    }

    pub async fn get(&self, name: &str) -> Result<Definition, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.get_definition(name).await,
            Backing::Remote(c) => {
                self.ax.call(c, methods::DEFINITION_GET, json!({ "name": name })).await
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<Definition>, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.list_definitions().await,
            Backing::Remote(c) => self.ax.call(c, methods::DEFINITION_LIST, json!({})).await,
        }
    }
}

// ── Containers ────────────────────────────────────────────────────────────────

pub struct Containers<'a> {
    ax: &'a AgentX,
}

impl Containers<'_> {
    /// Create a container; passing an id makes the call idempotent.
    pub async fn create(&self, container_id: Option<&str>) -> Result<ContainerRecord, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => {
                let container = p.container_create(container_id.map(str::to_string)).await?;
                Ok(container.record().clone())
            }
            Backing::Remote(c) => {
                self.ax
                    .call(c, methods::CONTAINER_CREATE, json!({ "containerId": container_id }))
                    .await
            }
        }
    }

    pub async fn get(&self, container_id: &str) -> Result<ContainerRecord, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p
                .container_get(container_id)
                .map(|c| c.record().clone())
                .ok_or_else(|| {
                    RuntimeError::NotFound(format!("container {container_id} not found"))
                }),
            Backing::Remote(c) => {
                self.ax
                    .call(c, methods::CONTAINER_GET, json!({ "containerId": container_id }))
                    .await
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<ContainerRecord>, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.container_list().await,
            Backing::Remote(c) => self.ax.call(c, methods::CONTAINER_LIST, json!({})).await,
        }
    }
}

// ── Images ────────────────────────────────────────────────────────────────────

pub struct Images<'a> {
    ax: &'a AgentX,
}

impl Images<'_> {
    pub async fn create(&self, params: CreateImageParams) -> Result<ImageRecord, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.image_create(params).await,
            Backing::Remote(c) => {
                let params = serde_json::to_value(&params)
                    .map_err(|e| RuntimeError::Internal(e.to_string()))?;
                self.ax.call(c, methods::IMAGE_CREATE, params).await
            }
        }
    }

    /// The auto-built meta image of a definition.
    pub async fn meta(&self, definition_name: &str) -> Result<ImageRecord, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.meta_image(definition_name).await,
            Backing::Remote(_) => {
                let images = self.list(Some(definition_name)).await?;
                images.into_iter().find(|i| i.is_meta()).ok_or_else(|| {
                    RuntimeError::NotFound(format!("no meta image for '{definition_name}'"))
                })
            }
        }
    }

    pub async fn get(&self, image_id: &str) -> Result<ImageRecord, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.image_get(image_id).await,
            Backing::Remote(c) => {
                self.ax.call(c, methods::IMAGE_GET, json!({ "imageId": image_id })).await
            }
        }
    }

    pub async fn list(
        &self,
        definition_name: Option<&str>,
    ) -> Result<Vec<ImageRecord>, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.image_list(definition_name).await,
            Backing::Remote(c) => {
                self.ax
                    .call(c, methods::IMAGE_LIST, json!({ "definitionName": definition_name }))
                    .await
            }
        }
    }

    pub async fn delete(&self, image_id: &str) -> Result<(), RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.image_delete(image_id).await,
            Backing::Remote(c) => {
                c.call(methods::IMAGE_DELETE, json!({ "imageId": image_id })).await?;
                Ok(())
            }
        }
    }

    /// Start an agent from this image (fresh run or snapshot resume).
    pub async fn run(
        &self,
        image_id: &str,
        container_id: Option<&str>,
    ) -> Result<AgentInfo, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => {
                let agent = p.image_run(image_id, container_id).await?;
                Ok(agent.info())
            }
            Backing::Remote(c) => {
                self.ax
                    .call(
                        c,
                        methods::IMAGE_RUN,
                        json!({ "imageId": image_id, "containerId": container_id }),
                    )
                    .await
            }
        }
    }

    pub async fn stop(&self, image_id: &str) -> Result<(), RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.image_stop(image_id).await,
            Backing::Remote(c) => {
                c.call(methods::IMAGE_STOP, json!({ "imageId": image_id })).await?;
                Ok(())
            }
        }
    }

    /// Patch `name` / `customData` — the only mutable image fields.
    pub async fn update(
        &self,
        image_id: &str,
        name: Option<String>,
        custom_data: Option<Value>,
    ) -> Result<ImageRecord, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.image_update(image_id, name, custom_data).await,
            Backing::Remote(c) => {
                self.ax
                    .call(
                        c,
                        methods::IMAGE_UPDATE,
                        json!({ "imageId": image_id, "name": name, "customData": custom_data }),
                    )
                    .await
            }
        }
    }

    pub async fn messages(&self, image_id: &str) -> Result<Vec<MessageRecord>, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.image_messages(image_id).await,
            Backing::Remote(c) => {
                self.ax.call(c, methods::IMAGE_MESSAGES, json!({ "imageId": image_id })).await
            }
        }
    }
}

// ── Agents ────────────────────────────────────────────────────────────────────

pub struct Agents<'a> {
    ax: &'a AgentX,
}

impl Agents<'_> {
    pub async fn get(&self, agent_id: &str) -> Result<AgentInfo, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p
                .agent_get(agent_id)
                .map(|a| a.info())
                .ok_or_else(|| RuntimeError::NotFound(format!("agent {agent_id} not found"))),
            Backing::Remote(c) => {
                self.ax.call(c, methods::AGENT_GET, json!({ "agentId": agent_id })).await
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<AgentInfo>, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => Ok(p.agent_list()),
            Backing::Remote(c) => self.ax.call(c, methods::AGENT_LIST, json!({})).await,
        }
    }

    pub async fn destroy(&self, agent_id: &str) -> Result<(), RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.agent_destroy(agent_id).await,
            Backing::Remote(c) => {
                c.call(methods::AGENT_DESTROY, json!({ "agentId": agent_id })).await?;
                Ok(())
            }
        }
    }

    pub async fn destroy_all(&self) -> Result<(), RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => {
                p.agent_destroy_all().await;
                Ok(())
            }
            Backing::Remote(c) => {
                c.call(methods::AGENT_DESTROY_ALL, json!({})).await?;
                Ok(())
            }
        }
    }

    pub async fn interrupt(&self, agent_id: &str) -> Result<(), RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.agent_interrupt(agent_id).await,
            Backing::Remote(c) => {
                c.call(methods::AGENT_INTERRUPT, json!({ "agentId": agent_id })).await?;
                Ok(())
            }
        }
    }

    /// Send one user utterance to a live agent and await the whole turn.
    pub async fn send(
        &self,
        agent_id: &str,
        content: impl Into<MessageContent>,
    ) -> Result<(), RuntimeError> {
        let content = content.into();
        match &self.ax.backing {
            Backing::Local(p) => {
                p.message_send(SendTarget::Agent(agent_id.to_string()), content).await
            }
            Backing::Remote(c) => {
                c.call(
                    methods::MESSAGE_SEND,
                    json!({ "agentId": agent_id, "content": content }),
                )
                .await?;
                Ok(())
            }
        }
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

pub struct Sessions<'a> {
    ax: &'a AgentX,
}

impl Sessions<'_> {
    pub async fn get(&self, session_id: &str) -> Result<SessionRecord, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => Ok(p.session_get(session_id).await?.record().clone()),
            Backing::Remote(c) => {
                self.ax.call(c, methods::SESSION_GET, json!({ "sessionId": session_id })).await
            }
        }
    }

    pub async fn list(&self, image_id: Option<&str>) -> Result<Vec<SessionRecord>, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.session_list(image_id).await,
            Backing::Remote(c) => {
                self.ax.call(c, methods::SESSION_LIST, json!({ "imageId": image_id })).await
            }
        }
    }

    pub async fn messages(&self, session_id: &str) -> Result<Vec<MessageRecord>, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => p.session_get(session_id).await?.messages().await,
            Backing::Remote(c) => {
                self.ax
                    .call(c, methods::SESSION_MESSAGES, json!({ "sessionId": session_id }))
                    .await
            }
        }
    }

    /// Fork at a message (or the whole log); returns the new session.
    pub async fn fork(
        &self,
        session_id: &str,
        at_message_id: Option<&str>,
    ) -> Result<SessionRecord, RuntimeError> {
        match &self.ax.backing {
            Backing::Local(p) => {
                let forked = p.session_get(session_id).await?.fork(at_message_id).await?;
                Ok(forked.record().clone())
            }
            Backing::Remote(c) => {
                self.ax
                    .call(
                        c,
                        methods::SESSION_FORK,
                        json!({ "sessionId": session_id, "atMessageId": at_message_id }),
                    )
                    .await
            }
        }
    }

    /// Resume-if-needed convenience: route a message by session id.
    pub async fn send(
        &self,
        session_id: &str,
        content: impl Into<MessageContent>,
    ) -> Result<(), RuntimeError> {
        let content = content.into();
        match &self.ax.backing {
            Backing::Local(p) => {
                p.message_send(SendTarget::Session(session_id.to_string()), content).await
            }
            Backing::Remote(c) => {
                c.call(
                    methods::MESSAGE_SEND,
                    json!({ "sessionId": session_id, "content": content }),
                )
                .await?;
                Ok(())
            }
        }
    }
}

// ── Presentations ─────────────────────────────────────────────────────────────

pub struct Presentations<'a> {
    ax: &'a AgentX,
}

/// A live projection of one session's events into UI state.
pub struct Presentation {
    state: Arc<StdMutex<PresentationState>>,
    subscription: SubscriptionId,
}

impl Presentation {
    /// Current projection snapshot.
    pub fn state(&self) -> PresentationState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }
}

impl Presentations<'_> {
    /// Attach a reducer to one session's event stream.  Detach with
    /// [`AgentX::off`] using [`Presentation::subscription`].
    pub fn attach(&self, session_id: &str) -> Presentation {
        self.ax.subscribe(session_id);
        let state = Arc::new(StdMutex::new(PresentationState::default()));
        let shared = Arc::clone(&state);
        let topic = session_id.to_string();
        let subscription = self.ax.bus().on_any(move |event| {
            if event.topic() != Some(topic.as_str()) {
                return;
            }
            let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
            let next = reduce(guard.clone(), event);
            *guard = next;
        });
        Presentation { state, subscription }
    }

    pub fn detach(&self, presentation: Presentation) {
        self.ax.off(presentation.subscription);
    }
}
