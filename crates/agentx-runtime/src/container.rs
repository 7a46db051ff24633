// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Containers: the isolation boundary that owns live agents.
//!
//! `run` starts an agent from an image with a fresh session; `resume`
//! re-materializes an agent on top of an existing session's history so the
//! next `receive` behaves as a continuation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tracing::{debug, info};

use agentx_bus::EventBus;
use agentx_store::Store;
use agentx_types::{
    id, ContainerRecord, ImageRecord, RuntimeError, SessionRecord,
};

use crate::agent::Agent;
use crate::runtime::Runtime;
use crate::sandbox::Sandbox;

pub struct Container {
    record: ContainerRecord,
    runtime: Arc<dyn Runtime>,
    bus: EventBus,
    sandbox: Arc<Sandbox>,
    agents: StdMutex<HashMap<String, Arc<Agent>>>,
    driver_init_timeout: Duration,
    idle_timeout: Duration,
}

impl Container {
    pub(crate) fn new(
        record: ContainerRecord,
        runtime: Arc<dyn Runtime>,
        bus: EventBus,
        sandbox: Sandbox,
        driver_init_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            record,
            runtime,
            bus,
            sandbox: Arc::new(sandbox),
            agents: StdMutex::new(HashMap::new()),
            driver_init_timeout,
            idle_timeout,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.record.container_id
    }

    pub fn record(&self) -> &ContainerRecord {
        &self.record
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    // ── Spawning ──────────────────────────────────────────────────────────────

    /// Start a fresh agent from an image: new session, no prior messages.
    pub async fn run(&self, image: &ImageRecord) -> Result<Arc<Agent>, RuntimeError> {
        let session = SessionRecord::new(id::session_id(), &image.image_id);
        self.runtime.store().sessions().upsert(&session).await?;
        self.spawn(image, session, Vec::new()).await
    }

    /// Re-materialize an agent on an existing session.  The session's
    /// messages are pre-loaded into the driver's context.
    pub async fn resume(&self, session: &SessionRecord) -> Result<Arc<Agent>, RuntimeError> {
        let image = self
            .runtime
            .store()
            .images()
            .find_by_id(&session.image_id)
            .await?
            .ok_or_else(|| {
                RuntimeError::NotFound(format!("image {} not found", session.image_id))
            })?;
        let history = self
            .runtime
            .store()
            .messages()
            .list_by_session(&session.session_id)
            .await?;
        debug!(
            session = %session.session_id,
            messages = history.len(),
            "resuming session"
        );
        self.spawn(&image, session.clone(), history).await
    }

    async fn spawn(
        &self,
        image: &ImageRecord,
        session: SessionRecord,
        history: Vec<agentx_types::MessageRecord>,
    ) -> Result<Arc<Agent>, RuntimeError> {
        let definition = self
            .runtime
            .store()
            .definitions()
            .find_by_name(&image.definition_name)
            .await?
            .ok_or_else(|| {
                RuntimeError::NotFound(format!("definition '{}' not found", image.definition_name))
            })?;

        let driver = self.runtime.create_driver(&session.session_id, image)?;
        tokio::time::timeout(self.driver_init_timeout, driver.initialize())
            .await
            .map_err(|_| RuntimeError::Timeout("driver initialization timed out".into()))??;

        let agent = Arc::new(Agent::new(
            self.record.container_id.clone(),
            image.image_id.clone(),
            definition,
            session.session_id.clone(),
            driver,
            Arc::clone(&self.sandbox),
            self.bus.clone(),
            self.runtime.store(),
            history,
            self.idle_timeout,
        ));
        agent.mark_ready();

        info!(
            agent = %agent.agent_id(),
            container = %self.record.container_id,
            definition = %image.definition_name,
            "agent started"
        );

        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent.agent_id().to_string(), Arc::clone(&agent));
        Ok(agent)
    }

    // ── Bookkeeping ───────────────────────────────────────────────────────────

    pub fn get(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner()).get(agent_id).cloned()
    }

    pub fn has(&self, agent_id: &str) -> bool {
        self.agents.lock().unwrap_or_else(|e| e.into_inner()).contains_key(agent_id)
    }

    pub fn list(&self) -> Vec<Arc<Agent>> {
        let mut agents: Vec<_> =
            self.agents.lock().unwrap_or_else(|e| e.into_inner()).values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id().cmp(b.agent_id()));
        agents
    }

    /// Find the live agent running a given image, if any.
    pub fn find_by_image(&self, image_id: &str) -> Option<Arc<Agent>> {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|a| a.image_id() == image_id)
            .cloned()
    }

    /// Find a live agent bound to a definition, if any.
    pub fn find_by_definition(&self, definition_name: &str) -> Option<Arc<Agent>> {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|a| a.definition().name == definition_name)
            .cloned()
    }

    /// Destroy one agent.  Unknown ids are not an error.
    pub async fn destroy(&self, agent_id: &str) {
        let agent = self.agents.lock().unwrap_or_else(|e| e.into_inner()).remove(agent_id);
        if let Some(agent) = agent {
            agent.destroy().await;
        }
    }

    /// Destroy every agent this container owns.
    pub async fn destroy_all(&self) {
        let agents: Vec<_> = {
            let mut map = self.agents.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, a)| a).collect()
        };
        for agent in agents {
            agent.destroy().await;
        }
    }
}
