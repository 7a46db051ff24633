// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-memory binding of the repository traits.
//!
//! Used by tests and by the remote runtime as a session-message cache.
//! Message insertion order is tracked explicitly so ordering ties resolve
//! the same way the SQLite store resolves them.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use agentx_types::{
    ContainerRecord, Definition, ImageRecord, MessageRecord, RuntimeError, SessionRecord,
};

use crate::{ContainerRepo, DefinitionRepo, ImageRepo, MessageRepo, SessionRepo, Store};

type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Default)]
struct Inner {
    definitions: HashMap<String, Definition>,
    images: HashMap<String, ImageRecord>,
    containers: HashMap<String, ContainerRecord>,
    sessions: HashMap<String, SessionRecord>,
    /// message_id → (insertion seq, record)
    messages: HashMap<String, (u64, MessageRecord)>,
    next_seq: u64,
}

/// Volatile store; everything is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemoryStore {
    fn definitions(&self) -> &dyn DefinitionRepo {
        self
    }
    fn images(&self) -> &dyn ImageRepo {
        self
    }
    fn containers(&self) -> &dyn ContainerRepo {
        self
    }
    fn sessions(&self) -> &dyn SessionRepo {
        self
    }
    fn messages(&self) -> &dyn MessageRepo {
        self
    }
}

#[async_trait]
impl DefinitionRepo for MemoryStore {
    async fn upsert(&self, def: &Definition) -> Result<()> {
        self.lock().definitions.insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Definition>> {
        Ok(self.lock().definitions.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Definition>> {
        let mut defs: Vec<_> = self.lock().definitions.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.lock().definitions.remove(name);
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.lock().definitions.len() as u64)
    }
}

#[async_trait]
impl ImageRepo for MemoryStore {
    async fn upsert(&self, image: &ImageRecord) -> Result<()> {
        self.lock().images.insert(image.image_id.clone(), image.clone());
        Ok(())
    }

    async fn find_by_id(&self, image_id: &str) -> Result<Option<ImageRecord>> {
        Ok(self.lock().images.get(image_id).cloned())
    }

    async fn list(&self, definition_name: Option<&str>) -> Result<Vec<ImageRecord>> {
        let mut images: Vec<_> = self
            .lock()
            .images
            .values()
            .filter(|img| definition_name.is_none_or(|d| img.definition_name == d))
            .cloned()
            .collect();
        images.sort_by(|a, b| a.image_id.cmp(&b.image_id));
        Ok(images)
    }

    async fn delete(&self, image_id: &str) -> Result<()> {
        self.lock().images.remove(image_id);
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.lock().images.len() as u64)
    }
}

#[async_trait]
impl ContainerRepo for MemoryStore {
    async fn upsert(&self, container: &ContainerRecord) -> Result<()> {
        self.lock().containers.insert(container.container_id.clone(), container.clone());
        Ok(())
    }

    async fn find_by_id(&self, container_id: &str) -> Result<Option<ContainerRecord>> {
        Ok(self.lock().containers.get(container_id).cloned())
    }

    async fn list(&self) -> Result<Vec<ContainerRecord>> {
        let mut containers: Vec<_> = self.lock().containers.values().cloned().collect();
        containers.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        Ok(containers)
    }

    async fn delete(&self, container_id: &str) -> Result<()> {
        self.lock().containers.remove(container_id);
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.lock().containers.len() as u64)
    }
}

#[async_trait]
impl SessionRepo for MemoryStore {
    async fn upsert(&self, session: &SessionRecord) -> Result<()> {
        self.lock().sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.lock().sessions.get(session_id).cloned())
    }

    async fn list(&self, image_id: Option<&str>) -> Result<Vec<SessionRecord>> {
        let mut sessions: Vec<_> = self
            .lock()
            .sessions
            .values()
            .filter(|s| image_id.is_none_or(|img| s.image_id == img))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.lock().sessions.remove(session_id);
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.lock().sessions.len() as u64)
    }
}

#[async_trait]
impl MessageRepo for MemoryStore {
    async fn upsert(&self, message: &MessageRecord) -> Result<()> {
        let mut inner = self.lock();
        let seq = match inner.messages.get(&message.message_id) {
            // Keep the original insertion position on idempotent re-upsert.
            Some((seq, _)) => *seq,
            None => {
                inner.next_seq += 1;
                inner.next_seq
            }
        };
        inner.messages.insert(message.message_id.clone(), (seq, message.clone()));
        Ok(())
    }

    async fn append_batch(&self, messages: &[MessageRecord]) -> Result<()> {
        let mut inner = self.lock();
        for message in messages {
            inner.next_seq += 1;
            let seq = inner.next_seq;
            inner.messages.insert(message.message_id.clone(), (seq, message.clone()));
        }
        Ok(())
    }

    async fn find_by_id(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        Ok(self.lock().messages.get(message_id).map(|(_, m)| m.clone()))
    }

    async fn list_by_session(&self, session_id: &str) -> Result<Vec<MessageRecord>> {
        let mut rows: Vec<(u64, MessageRecord)> = self
            .lock()
            .messages
            .values()
            .filter(|(_, m)| m.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b))
        });
        Ok(rows.into_iter().map(|(_, m)| m).collect())
    }

    async fn delete(&self, message_id: &str) -> Result<()> {
        self.lock().messages.remove(message_id);
        Ok(())
    }

    async fn delete_by_session(&self, session_id: &str) -> Result<()> {
        self.lock().messages.retain(|_, (_, m)| m.session_id != session_id);
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.lock().messages.len() as u64)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use agentx_types::id;
    use chrono::{Duration, Utc};

    use super::*;

    #[tokio::test]
    async fn ordering_matches_sqlite_semantics() {
        let store = MemoryStore::new();
        let sess = id::session_id();
        let base = Utc::now();

        let mut m1 = MessageRecord::user(&sess, "a");
        m1.created_at = base;
        let mut m2 = MessageRecord::assistant(&sess, "b");
        m2.created_at = base; // tie — insertion order decides

        MessageRepo::upsert(&store, &m1).await.unwrap();
        MessageRepo::upsert(&store, &m2).await.unwrap();

        let texts: Vec<String> =
            store.list_by_session(&sess).await.unwrap().iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["a", "b"]);

        // Re-upserting m1 must not move it to the back.
        MessageRepo::upsert(&store, &m1).await.unwrap();
        let texts: Vec<String> =
            store.list_by_session(&sess).await.unwrap().iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn created_at_dominates_insertion_order() {
        let store = MemoryStore::new();
        let sess = id::session_id();
        let base = Utc::now();

        let mut late = MessageRecord::user(&sess, "late");
        late.created_at = base + Duration::seconds(1);
        let mut early = MessageRecord::user(&sess, "early");
        early.created_at = base;

        MessageRepo::upsert(&store, &late).await.unwrap();
        MessageRepo::upsert(&store, &early).await.unwrap();

        let texts: Vec<String> =
            store.list_by_session(&sess).await.unwrap().iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["early", "late"]);
    }
}
