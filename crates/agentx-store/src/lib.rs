// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Persistence contract for the five object stores.
//!
//! Repositories are CRUD only — lifecycle logic (cascade deletes, snapshot
//! consistency) lives in the runtime layer.  Two bindings ship here: a
//! SQLite store for the local runtime (`:memory:` honored for tests and
//! ephemeral use) and a plain in-memory store.  A remote runtime binds the
//! same traits to an HTTP client instead; nothing in the core depends on SQL
//! specifics.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use agentx_types::{
    ContainerRecord, Definition, ImageRecord, MessageRecord, RuntimeError, SessionRecord,
};

type Result<T> = std::result::Result<T, RuntimeError>;

// ─── Repository traits ────────────────────────────────────────────────────────

#[async_trait]
pub trait DefinitionRepo: Send + Sync {
    /// Insert or replace.  Idempotent.
    async fn upsert(&self, def: &Definition) -> Result<()>;
    async fn find_by_name(&self, name: &str) -> Result<Option<Definition>>;
    async fn list(&self) -> Result<Vec<Definition>>;
    async fn delete(&self, name: &str) -> Result<()>;
    async fn count(&self) -> Result<u64>;

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.find_by_name(name).await?.is_some())
    }
}

#[async_trait]
pub trait ImageRepo: Send + Sync {
    async fn upsert(&self, image: &ImageRecord) -> Result<()>;
    async fn find_by_id(&self, image_id: &str) -> Result<Option<ImageRecord>>;
    /// All images, optionally restricted to one definition.
    async fn list(&self, definition_name: Option<&str>) -> Result<Vec<ImageRecord>>;
    async fn delete(&self, image_id: &str) -> Result<()>;
    async fn count(&self) -> Result<u64>;

    async fn exists(&self, image_id: &str) -> Result<bool> {
        Ok(self.find_by_id(image_id).await?.is_some())
    }
}

#[async_trait]
pub trait ContainerRepo: Send + Sync {
    async fn upsert(&self, container: &ContainerRecord) -> Result<()>;
    async fn find_by_id(&self, container_id: &str) -> Result<Option<ContainerRecord>>;
    async fn list(&self) -> Result<Vec<ContainerRecord>>;
    async fn delete(&self, container_id: &str) -> Result<()>;
    async fn count(&self) -> Result<u64>;

    async fn exists(&self, container_id: &str) -> Result<bool> {
        Ok(self.find_by_id(container_id).await?.is_some())
    }
}

#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn upsert(&self, session: &SessionRecord) -> Result<()>;
    async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>>;
    /// All sessions, optionally restricted to one image.
    async fn list(&self, image_id: Option<&str>) -> Result<Vec<SessionRecord>>;
    async fn delete(&self, session_id: &str) -> Result<()>;
    async fn count(&self) -> Result<u64>;

    async fn exists(&self, session_id: &str) -> Result<bool> {
        Ok(self.find_by_id(session_id).await?.is_some())
    }
}

#[async_trait]
pub trait MessageRepo: Send + Sync {
    async fn upsert(&self, message: &MessageRecord) -> Result<()>;
    /// Append a batch atomically — all committed or none.  One user action
    /// (user message + assistant message + tool results) is one batch.
    async fn append_batch(&self, messages: &[MessageRecord]) -> Result<()>;
    async fn find_by_id(&self, message_id: &str) -> Result<Option<MessageRecord>>;
    /// Messages of one session, ordered by `created_at` ascending,
    /// tie-broken by insertion order.
    async fn list_by_session(&self, session_id: &str) -> Result<Vec<MessageRecord>>;
    async fn delete(&self, message_id: &str) -> Result<()>;
    async fn delete_by_session(&self, session_id: &str) -> Result<()>;
    async fn count(&self) -> Result<u64>;
}

/// The five repositories behind one handle.
pub trait Store: Send + Sync {
    fn definitions(&self) -> &dyn DefinitionRepo;
    fn images(&self) -> &dyn ImageRepo;
    fn containers(&self) -> &dyn ContainerRepo;
    fn sessions(&self) -> &dyn SessionRepo;
    fn messages(&self) -> &dyn MessageRepo;
}
