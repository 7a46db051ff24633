// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session handle: the external wrapper around one image's message log.
//!
//! Sessions reference agents by id and resolve them through the platform,
//! never by direct pointer; `fork` snapshots a prefix into a new image and a
//! fresh session and leaves the original untouched.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use agentx_bus::{SubscribeOpts, SubscriptionId};
use agentx_types::{
    id, ImageRecord, MessageContent, MessageRecord, RuntimeError, SessionRecord,
};

use crate::agent::Agent;
use crate::platform::Platform;

/// Handle to one session.  Cheap to clone; all state lives in the store.
#[derive(Clone)]
pub struct SessionHandle {
    record: SessionRecord,
    platform: Arc<Platform>,
}

impl SessionHandle {
    pub(crate) fn new(record: SessionRecord, platform: Arc<Platform>) -> Self {
        Self { record, platform }
    }

    pub fn session_id(&self) -> &str {
        &self.record.session_id
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// The session's messages, ordered by `created_at` then insertion order.
    pub async fn messages(&self) -> Result<Vec<MessageRecord>, RuntimeError> {
        self.platform
            .store()
            .messages()
            .list_by_session(&self.record.session_id)
            .await
    }

    /// Re-materialize an agent for this session (or return the live one).
    pub async fn resume(&self) -> Result<Arc<Agent>, RuntimeError> {
        self.platform.resume_session(&self.record.session_id, None).await
    }

    /// Convenience: resume if needed, then receive.
    pub async fn send(&self, content: impl Into<MessageContent>) -> Result<(), RuntimeError> {
        let agent = self.resume().await?;
        agent.receive(content).await
    }

    /// Snapshot the prefix up to (and including) `at_message_id` — or the
    /// whole log — into a new snapshot image and a fresh session pointing at
    /// it.  The original session is untouched.
    pub async fn fork(&self, at_message_id: Option<&str>) -> Result<SessionHandle, RuntimeError> {
        let store = self.platform.store();
        let messages = store.messages().list_by_session(&self.record.session_id).await?;

        let prefix: Vec<MessageRecord> = match at_message_id {
            Some(at) => {
                let cut = messages
                    .iter()
                    .position(|m| m.message_id == at)
                    .ok_or_else(|| {
                        RuntimeError::NotFound(format!("message {at} not in session"))
                    })?;
                messages[..=cut].to_vec()
            }
            None => messages,
        };

        let base_image = store
            .images()
            .find_by_id(&self.record.image_id)
            .await?
            .ok_or_else(|| {
                RuntimeError::NotFound(format!("image {} not found", self.record.image_id))
            })?;

        let new_session_id = id::session_id();
        let new_image_id = id::image_id();
        let now = Utc::now();

        let image = ImageRecord {
            image_id: new_image_id.clone(),
            definition_name: base_image.definition_name.clone(),
            container_id: base_image.container_id.clone(),
            name: base_image.name.clone().map(|n| format!("{n}-fork")),
            system_prompt: base_image.system_prompt.clone(),
            mcp_servers: base_image.mcp_servers.clone(),
            session_id: Some(new_session_id.clone()),
            custom_data: None,
            created_at: now,
            updated_at: now,
        };
        let mut session = SessionRecord::new(&new_session_id, &new_image_id);
        session.user_id = self.record.user_id.clone();
        session.title = self.record.title.clone();

        // Copies keep role, content, and created_at; ids are fresh so the
        // two sessions never share rows.
        let copies: Vec<MessageRecord> = prefix
            .iter()
            .map(|m| MessageRecord {
                message_id: id::message_id(),
                session_id: new_session_id.clone(),
                role: m.role,
                content: m.content.clone(),
                created_at: m.created_at,
            })
            .collect();

        store.images().upsert(&image).await?;
        store.sessions().upsert(&session).await?;
        store.messages().append_batch(&copies).await?;

        debug!(
            from = %self.record.session_id,
            to = %new_session_id,
            messages = copies.len(),
            "session forked"
        );

        Ok(SessionHandle::new(session, Arc::clone(&self.platform)))
    }

    /// Subscribe this session to an agent's message events so activity
    /// refreshes the session record.  Returns the subscription id for
    /// teardown.
    pub fn collect(&self, agent: &Agent) -> SubscriptionId {
        let session_id = self.record.session_id.clone();
        let agent_id = agent.agent_id().to_string();
        let platform = Arc::clone(&self.platform);
        self.platform.bus().on(
            ["user_message", "assistant_message", "tool_result_message", "error_message"],
            move |event| {
                let from_agent = event
                    .context
                    .as_ref()
                    .and_then(|c| c.agent_id.as_deref())
                    .is_some_and(|a| a == agent_id);
                if !from_agent {
                    return;
                }
                let platform = Arc::clone(&platform);
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    let store = platform.store();
                    if let Ok(Some(mut session)) =
                        store.sessions().find_by_id(&session_id).await
                    {
                        session.updated_at = Utc::now();
                        if let Err(e) = store.sessions().upsert(&session).await {
                            warn!(session = %session_id, "collect failed to touch session: {e}");
                        }
                    }
                });
            },
            SubscribeOpts::default(),
        )
    }
}
