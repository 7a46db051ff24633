// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The live agent: binds a definition, a session history, a driver, and the
//! engine to the bus.
//!
//! `receive` is the whole data path of one turn: append the user message,
//! stream the driver, fold every event through the engine, run requested
//! tools through the sandbox, persist the turn's messages atomically, and
//! emit everything on the bus scoped with `{agent_id, session_id,
//! container_id}`.  Only one `receive` is in flight per agent; a second
//! caller fails fast with `AgentBusy`.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use agentx_bus::EventBus;
use agentx_engine::{TurnEngine, TurnState};
use agentx_store::Store;
use agentx_types::{
    id, Definition, DriveableEvent, Event, EventContext, MessageContent, MessageRecord,
    RuntimeError, SemanticEvent,
};

use agentx_driver::Driver;

use crate::sandbox::Sandbox;

/// Lifecycle of a live agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLifecycle {
    Initializing,
    Ready,
    Busy,
    Destroyed,
}

/// Serializable snapshot of an agent, returned by the platform API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub agent_id: String,
    pub container_id: String,
    pub image_id: String,
    pub session_id: String,
    pub definition_name: String,
    pub lifecycle: AgentLifecycle,
}

/// Turn rounds are bounded so a model that keeps requesting tools cannot
/// spin forever.
const MAX_TOOL_ROUNDS: usize = 8;

pub struct Agent {
    agent_id: String,
    container_id: String,
    image_id: String,
    definition: Definition,
    session_id: String,
    driver: Arc<dyn Driver>,
    sandbox: Arc<Sandbox>,
    bus: EventBus,
    store: Arc<dyn Store>,
    engine: TurnEngine,
    lifecycle: StdMutex<AgentLifecycle>,
    /// Session history as the driver sees it, preloaded on resume.
    history: Mutex<Vec<MessageRecord>>,
    idle_timeout: Duration,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        container_id: impl Into<String>,
        image_id: impl Into<String>,
        definition: Definition,
        session_id: impl Into<String>,
        driver: Arc<dyn Driver>,
        sandbox: Arc<Sandbox>,
        bus: EventBus,
        store: Arc<dyn Store>,
        history: Vec<MessageRecord>,
        idle_timeout: Duration,
    ) -> Self {
        let engine = TurnEngine::new(driver.pricing());
        Self {
            agent_id: id::agent_id(),
            container_id: container_id.into(),
            image_id: image_id.into(),
            definition,
            session_id: session_id.into(),
            driver,
            sandbox,
            bus,
            store,
            engine,
            lifecycle: StdMutex::new(AgentLifecycle::Initializing),
            history: Mutex::new(history),
            idle_timeout,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn lifecycle(&self) -> AgentLifecycle {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            agent_id: self.agent_id.clone(),
            container_id: self.container_id.clone(),
            image_id: self.image_id.clone(),
            session_id: self.session_id.clone(),
            definition_name: self.definition.name.clone(),
            lifecycle: self.lifecycle(),
        }
    }

    pub(crate) fn mark_ready(&self) {
        let mut lc = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if *lc == AgentLifecycle::Initializing {
            *lc = AgentLifecycle::Ready;
        }
    }

    // ── Turn pipeline ─────────────────────────────────────────────────────────

    /// Process one user utterance to completion (including tool rounds).
    pub async fn receive(&self, content: impl Into<MessageContent>) -> Result<(), RuntimeError> {
        let _slot = self.claim()?;

        let user = MessageRecord::user(&self.session_id, content);
        let mut turn = TurnState::new(&self.session_id);
        // Records persisted at the end of the turn, in creation order.
        let mut pending: Vec<MessageRecord> = vec![user.clone()];
        let mut driver_history = { self.history.lock().await.clone() };
        driver_history.push(user.clone());

        for sev in self.engine.fold_user(&mut turn, Utc::now(), &user) {
            self.emit_semantic(&sev);
        }

        let mut failure: Option<RuntimeError> = None;
        let mut rounds = 0;
        'turn: while !turn.is_closed() {
            rounds += 1;
            if rounds > MAX_TOOL_ROUNDS {
                let message = format!("tool loop exceeded {MAX_TOOL_ROUNDS} rounds");
                warn!(agent = %self.agent_id, "{message}");
                self.ingest(&mut turn, &mut pending, &DriveableEvent::Error { message: message.clone() });
                failure = Some(RuntimeError::Driver(message));
                break;
            }

            let mut stream = match self.driver.receive(driver_history.clone()).await {
                Ok(stream) => stream,
                Err(e) => {
                    let message = e.to_string();
                    self.ingest(&mut turn, &mut pending, &DriveableEvent::Error { message });
                    failure = Some(e);
                    break;
                }
            };

            loop {
                match tokio::time::timeout(self.idle_timeout, stream.next()).await {
                    Err(_) => {
                        let message = "turn idle timeout".to_string();
                        warn!(agent = %self.agent_id, "{message}");
                        self.driver.interrupt().await;
                        self.ingest(&mut turn, &mut pending, &DriveableEvent::Error {
                            message: message.clone(),
                        });
                        failure = Some(RuntimeError::Timeout(message));
                        break 'turn;
                    }
                    Ok(None) => break,
                    Ok(Some(ev)) => {
                        self.ingest(&mut turn, &mut pending, &ev);
                        if let DriveableEvent::Error { message } = &ev {
                            failure = Some(RuntimeError::Driver(message.clone()));
                        }
                    }
                }
            }

            if turn.awaiting_tools() {
                let calls = turn.pending_tool_calls();
                if let Some(round) = turn.take_round_message() {
                    pending.push(round.clone());
                    driver_history.push(round);
                }
                for call in calls {
                    debug!(agent = %self.agent_id, tool = %call.name, "executing tool");
                    let (output, is_error) = self.sandbox.execute(&call.name, &call.input).await;
                    let ev = DriveableEvent::ToolResult {
                        tool_call_id: call.id,
                        content: output,
                        is_error,
                    };
                    for record in self.ingest(&mut turn, &mut pending, &ev) {
                        driver_history.push(record);
                    }
                }
            }
        }

        self.store
            .messages()
            .append_batch(&pending)
            .await
            .map_err(|e| {
                error!(agent = %self.agent_id, "failed to persist turn: {e}");
                e
            })?;
        self.touch_session().await;

        let mut history = self.history.lock().await;
        history.extend(pending);

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Feed one stream event through the engine: emit it on the bus, emit
    /// the engine's semantic outputs right behind it, and queue produced
    /// message records for persistence.  Returns the records this event
    /// produced (the tool loop feeds them back into driver history).
    fn ingest(
        &self,
        turn: &mut TurnState,
        pending: &mut Vec<MessageRecord>,
        ev: &DriveableEvent,
    ) -> Vec<MessageRecord> {
        self.emit_stream(ev);
        let mut produced = Vec::new();
        for sev in self.engine.fold_stream(turn, Utc::now(), ev) {
            match &sev {
                SemanticEvent::AssistantMessage { message }
                | SemanticEvent::ToolResultMessage { message }
                | SemanticEvent::ErrorMessage { message } => {
                    pending.push(message.clone());
                    produced.push(message.clone());
                }
                _ => {}
            }
            self.emit_semantic(&sev);
        }
        produced
    }

    fn context(&self) -> EventContext {
        EventContext {
            agent_id: Some(self.agent_id.clone()),
            session_id: Some(self.session_id.clone()),
            container_id: Some(self.container_id.clone()),
        }
    }

    fn emit_stream(&self, ev: &DriveableEvent) {
        self.bus.emit(Event::new(ev.clone()).with_context(self.context()));
    }

    fn emit_semantic(&self, sev: &SemanticEvent) {
        self.bus.emit(Event::new(sev.clone()).with_context(self.context()));
    }

    async fn touch_session(&self) {
        if let Ok(Some(mut session)) = self.store.sessions().find_by_id(&self.session_id).await {
            session.updated_at = Utc::now();
            if let Err(e) = self.store.sessions().upsert(&session).await {
                warn!(session = %self.session_id, "failed to touch session: {e}");
            }
        }
    }

    fn claim(&self) -> Result<BusySlot<'_>, RuntimeError> {
        let mut lc = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        match *lc {
            AgentLifecycle::Ready => {
                *lc = AgentLifecycle::Busy;
                Ok(BusySlot(self))
            }
            AgentLifecycle::Busy | AgentLifecycle::Initializing => Err(RuntimeError::AgentBusy),
            AgentLifecycle::Destroyed => {
                Err(RuntimeError::NotFound(format!("agent {} destroyed", self.agent_id)))
            }
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Abort the in-flight turn, if any.  The outstanding `receive` ends
    /// cleanly once the driver emits `interrupted`.
    pub async fn interrupt(&self) {
        info!(agent = %self.agent_id, "interrupt requested");
        self.driver.interrupt().await;
    }

    /// Dispose the driver and mark this agent destroyed.  A turn that is
    /// still streaming is interrupted first.
    pub async fn destroy(&self) {
        {
            let mut lc = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if *lc == AgentLifecycle::Destroyed {
                return;
            }
            *lc = AgentLifecycle::Destroyed;
        }
        self.driver.dispose().await;
        info!(agent = %self.agent_id, "agent destroyed");
    }
}

/// Returns the agent to `ready` when the turn finishes, unless it was
/// destroyed mid-turn.
struct BusySlot<'a>(&'a Agent);

impl Drop for BusySlot<'_> {
    fn drop(&mut self) {
        let mut lc = self.0.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if *lc == AgentLifecycle::Busy {
            *lc = AgentLifecycle::Ready;
        }
    }
}
