// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The platform: one runtime, one bus, and every operation the external API
//! surfaces.
//!
//! Both the local façade and the RPC server sit on top of this type, so a
//! browser client and an embedded client drive exactly the same code.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use agentx_bus::EventBus;
use agentx_store::Store;
use agentx_types::{
    id, ContainerRecord, Definition, ImageRecord, MessageContent, MessageRecord, RuntimeError,
    SessionRecord,
};

use crate::agent::{Agent, AgentInfo};
use crate::container::Container;
use crate::runtime::Runtime;
use crate::session::SessionHandle;

/// Parameters for snapshotting a live agent into an image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateImageParams {
    pub definition_name: String,
    pub container_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<Vec<agentx_types::McpServerConfig>>,
}

/// Where `message.send` routes.
#[derive(Debug, Clone)]
pub enum SendTarget {
    Agent(String),
    Session(String),
}

pub struct Platform {
    runtime: Arc<dyn Runtime>,
    bus: EventBus,
    containers: StdMutex<HashMap<String, Arc<Container>>>,
}

impl Platform {
    pub fn new(runtime: Arc<dyn Runtime>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            bus: EventBus::new(),
            containers: StdMutex::new(HashMap::new()),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.runtime.store()
    }

    // ── Definitions ───────────────────────────────────────────────────────────

    /// Register a definition and auto-materialize its meta image.
    pub async fn register_definition(
        &self,
        definition: Definition,
    ) -> Result<ImageRecord, RuntimeError> {
        let store = self.store();
        if store.definitions().exists(&definition.name).await? {
            return Err(RuntimeError::Conflict(format!(
                "definition '{}' already registered",
                definition.name
            )));
        }
        store.definitions().upsert(&definition).await?;
        let meta = ImageRecord::meta(id::image_id(), &definition);
        store.images().upsert(&meta).await?;
        info!(definition = %definition.name, image = %meta.image_id, "definition registered");
        Ok(meta)
    }

    pub async fn unregister_definition(&self, name: &str) -> Result<(), RuntimeError> {
        let store = self.store();
        if !store.definitions().exists(name).await? {
            return Err(RuntimeError::NotFound(format!("definition '{name}' not found")));
        }
        // The auto-built meta image goes with it; snapshots stay.
        for image in store.images().list(Some(name)).await? {
            if image.is_meta() {
                store.images().delete(&image.image_id).await?;
            }
        }
        store.definitions().delete(name).await
    }

    pub async fn get_definition(&self, name: &str) -> Result<Definition, RuntimeError> {
        self.store()
            .definitions()
            .find_by_name(name)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("definition '{name}' not found")))
    }

    pub async fn list_definitions(&self) -> Result<Vec<Definition>, RuntimeError> {
        self.store().definitions().list().await
    }

    // ── Containers ────────────────────────────────────────────────────────────

    /// Create (or return) a container.  Passing an id makes the call
    /// idempotent: an existing container with that id is returned as-is.
    pub async fn container_create(
        self: &Arc<Self>,
        container_id: Option<String>,
    ) -> Result<Arc<Container>, RuntimeError> {
        if let Some(id) = &container_id {
            if let Some(existing) = self.container_get(id) {
                return Ok(existing);
            }
        }
        let container_id = container_id.unwrap_or_else(id::container_id);
        let record = ContainerRecord::new(&container_id);
        self.store().containers().upsert(&record).await?;

        let sandbox = self.runtime.create_sandbox(&container_id)?;
        let container = Arc::new(Container::new(
            record,
            Arc::clone(&self.runtime),
            self.bus.clone(),
            sandbox,
            self.runtime.driver_init_timeout(),
            self.runtime.idle_timeout(),
        ));
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(container_id.clone(), Arc::clone(&container));
        info!(container = %container_id, "container created");
        Ok(container)
    }

    pub fn container_get(&self, container_id: &str) -> Option<Arc<Container>> {
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(container_id)
            .cloned()
    }

    pub async fn container_list(&self) -> Result<Vec<ContainerRecord>, RuntimeError> {
        self.store().containers().list().await
    }

    /// Delete a container: destroys every agent it owns and removes its
    /// sessions and their messages.
    pub async fn container_destroy(&self, container_id: &str) -> Result<(), RuntimeError> {
        let container = self
            .containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(container_id);
        let store = self.store();
        if let Some(container) = &container {
            for agent in container.list() {
                store.sessions().delete(agent.session_id()).await?;
                store.messages().delete_by_session(agent.session_id()).await?;
            }
            container.destroy_all().await;
        }
        store.containers().delete(container_id).await?;
        info!(container = %container_id, "container destroyed");
        Ok(())
    }

    fn live_containers(&self) -> Vec<Arc<Container>> {
        let mut list: Vec<_> = self
            .containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.container_id().cmp(b.container_id()));
        list
    }

    /// Resolve a target container: an explicit id, the image's own, any
    /// live one, or a fresh container as a last resort.
    async fn resolve_container(
        self: &Arc<Self>,
        explicit: Option<&str>,
        image: Option<&ImageRecord>,
    ) -> Result<Arc<Container>, RuntimeError> {
        if let Some(id) = explicit {
            return self
                .container_get(id)
                .ok_or_else(|| RuntimeError::NotFound(format!("container {id} not found")));
        }
        if let Some(id) = image.and_then(|i| i.container_id.as_deref()) {
            if let Some(container) = self.container_get(id) {
                return Ok(container);
            }
        }
        if let Some(container) = self.live_containers().into_iter().next() {
            return Ok(container);
        }
        self.container_create(None).await
    }

    // ── Images ────────────────────────────────────────────────────────────────

    /// The auto-built meta image of a definition.
    pub async fn meta_image(&self, definition_name: &str) -> Result<ImageRecord, RuntimeError> {
        self.store()
            .images()
            .list(Some(definition_name))
            .await?
            .into_iter()
            .find(|i| i.is_meta())
            .ok_or_else(|| {
                RuntimeError::NotFound(format!("no meta image for '{definition_name}'"))
            })
    }

    pub async fn image_get(&self, image_id: &str) -> Result<ImageRecord, RuntimeError> {
        self.store()
            .images()
            .find_by_id(image_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("image {image_id} not found")))
    }

    pub async fn image_list(
        &self,
        definition_name: Option<&str>,
    ) -> Result<Vec<ImageRecord>, RuntimeError> {
        self.store().images().list(definition_name).await
    }

    /// Snapshot a live agent into an image that carries its session.
    pub async fn image_create(
        &self,
        params: CreateImageParams,
    ) -> Result<ImageRecord, RuntimeError> {
        let container = self.container_get(&params.container_id).ok_or_else(|| {
            RuntimeError::NotFound(format!("container {} not found", params.container_id))
        })?;
        let agent = container
            .find_by_definition(&params.definition_name)
            .ok_or_else(|| {
                RuntimeError::NotFound(format!(
                    "no live agent for '{}' in container {}",
                    params.definition_name, params.container_id
                ))
            })?;

        let now = Utc::now();
        let image = ImageRecord {
            image_id: id::image_id(),
            definition_name: params.definition_name,
            container_id: Some(params.container_id),
            name: params.name,
            system_prompt: params
                .system_prompt
                .or_else(|| agent.definition().system_prompt.clone()),
            mcp_servers: params.mcp_servers.or_else(|| agent.definition().mcp_servers.clone()),
            session_id: Some(agent.session_id().to_string()),
            custom_data: None,
            created_at: now,
            updated_at: now,
        };
        self.store().images().upsert(&image).await?;
        info!(image = %image.image_id, session = %agent.session_id(), "snapshot image created");
        Ok(image)
    }

    /// Patch the mutable fields of an image: `name` and `custom_data` only.
    pub async fn image_update(
        &self,
        image_id: &str,
        name: Option<String>,
        custom_data: Option<Value>,
    ) -> Result<ImageRecord, RuntimeError> {
        let mut image = self.image_get(image_id).await?;
        if let Some(name) = name {
            image.name = Some(name);
        }
        if let Some(data) = custom_data {
            image.custom_data = Some(data);
        }
        image.updated_at = Utc::now();
        self.store().images().upsert(&image).await?;
        Ok(image)
    }

    /// Delete an image.  Meta images are protected while a live agent runs
    /// from them.
    pub async fn image_delete(&self, image_id: &str) -> Result<(), RuntimeError> {
        let image = self.image_get(image_id).await?;
        if image.is_meta() {
            let referenced = self
                .live_containers()
                .iter()
                .any(|c| c.find_by_image(image_id).is_some());
            if referenced {
                return Err(RuntimeError::Conflict(format!(
                    "image {image_id} is referenced by a live agent"
                )));
            }
        }
        self.store().images().delete(image_id).await
    }

    /// Start an agent from an image: a fresh run for meta images, a resume
    /// of the carried session for snapshots.
    pub async fn image_run(
        self: &Arc<Self>,
        image_id: &str,
        container_id: Option<&str>,
    ) -> Result<Arc<Agent>, RuntimeError> {
        let image = self.image_get(image_id).await?;
        let container = self.resolve_container(container_id, Some(&image)).await?;
        match &image.session_id {
            Some(session_id) => {
                let session = self
                    .store()
                    .sessions()
                    .find_by_id(session_id)
                    .await?
                    .ok_or_else(|| {
                        RuntimeError::NotFound(format!("session {session_id} not found"))
                    })?;
                container.resume(&session).await
            }
            None => container.run(&image).await,
        }
    }

    /// Stop the agent running from an image, if any.
    pub async fn image_stop(&self, image_id: &str) -> Result<(), RuntimeError> {
        for container in self.live_containers() {
            if let Some(agent) = container.find_by_image(image_id) {
                container.destroy(agent.agent_id()).await;
                return Ok(());
            }
        }
        Err(RuntimeError::NotFound(format!("no live agent for image {image_id}")))
    }

    /// Messages of the session an image carries.
    pub async fn image_messages(
        &self,
        image_id: &str,
    ) -> Result<Vec<MessageRecord>, RuntimeError> {
        let image = self.image_get(image_id).await?;
        match &image.session_id {
            Some(session_id) => self.store().messages().list_by_session(session_id).await,
            None => Ok(Vec::new()),
        }
    }

    // ── Agents ────────────────────────────────────────────────────────────────

    pub fn agent_get(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.live_containers().iter().find_map(|c| c.get(agent_id))
    }

    pub fn agent_list(&self) -> Vec<AgentInfo> {
        self.live_containers()
            .iter()
            .flat_map(|c| c.list())
            .map(|a| a.info())
            .collect()
    }

    pub async fn agent_destroy(&self, agent_id: &str) -> Result<(), RuntimeError> {
        for container in self.live_containers() {
            if container.has(agent_id) {
                container.destroy(agent_id).await;
                return Ok(());
            }
        }
        Err(RuntimeError::NotFound(format!("agent {agent_id} not found")))
    }

    pub async fn agent_destroy_all(&self) {
        for container in self.live_containers() {
            container.destroy_all().await;
        }
    }

    pub async fn agent_interrupt(&self, agent_id: &str) -> Result<(), RuntimeError> {
        let agent = self
            .agent_get(agent_id)
            .ok_or_else(|| RuntimeError::NotFound(format!("agent {agent_id} not found")))?;
        agent.interrupt().await;
        Ok(())
    }

    pub fn agent_by_session(&self, session_id: &str) -> Option<Arc<Agent>> {
        self.live_containers()
            .iter()
            .flat_map(|c| c.list())
            .find(|a| a.session_id() == session_id)
    }

    // ── Messages & sessions ───────────────────────────────────────────────────

    /// Route one user utterance to an agent, resuming the session first when
    /// only a session id is known.
    pub async fn message_send(
        self: &Arc<Self>,
        target: SendTarget,
        content: MessageContent,
    ) -> Result<(), RuntimeError> {
        let agent = match &target {
            SendTarget::Agent(agent_id) => self.agent_get(agent_id).ok_or_else(|| {
                RuntimeError::NotFound(format!("agent {agent_id} not found"))
            })?,
            SendTarget::Session(session_id) => self.resume_session(session_id, None).await?,
        };
        agent.receive(content).await
    }

    /// The live agent for a session, or a fresh resume.
    pub async fn resume_session(
        self: &Arc<Self>,
        session_id: &str,
        container_id: Option<&str>,
    ) -> Result<Arc<Agent>, RuntimeError> {
        if let Some(agent) = self.agent_by_session(session_id) {
            return Ok(agent);
        }
        let session = self
            .store()
            .sessions()
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("session {session_id} not found")))?;
        let image = self.store().images().find_by_id(&session.image_id).await?;
        let container = self.resolve_container(container_id, image.as_ref()).await?;
        container.resume(&session).await
    }

    pub async fn session_get(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<SessionHandle, RuntimeError> {
        let record = self
            .store()
            .sessions()
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("session {session_id} not found")))?;
        Ok(SessionHandle::new(record, Arc::clone(self)))
    }

    pub async fn session_list(
        &self,
        image_id: Option<&str>,
    ) -> Result<Vec<SessionRecord>, RuntimeError> {
        self.store().sessions().list(image_id).await
    }

    /// Tear everything down: agents, containers, subscriptions.
    pub async fn shutdown(&self) {
        self.agent_destroy_all().await;
        self.containers.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.bus.destroy();
        warn!("platform shut down");
    }
}
