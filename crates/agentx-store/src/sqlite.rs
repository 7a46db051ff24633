// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SQLite binding of the repository traits.
//!
//! Records are stored as JSON bodies with the query keys denormalized into
//! indexed columns.  Message ordering uses an integer microsecond timestamp
//! plus `rowid` so ties resolve in insertion order.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::debug;

use agentx_types::{
    ContainerRecord, Definition, ImageRecord, MessageRecord, RuntimeError, SessionRecord,
};

use crate::{
    ContainerRepo, DefinitionRepo, ImageRepo, MessageRepo, SessionRepo, Store,
};

type Result<T> = std::result::Result<T, RuntimeError>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS definitions (
    name TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS images (
    image_id        TEXT PRIMARY KEY,
    definition_name TEXT NOT NULL,
    session_id      TEXT,
    body            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_images_definition ON images(definition_name);
CREATE TABLE IF NOT EXISTS containers (
    container_id TEXT PRIMARY KEY,
    body         TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    image_id   TEXT NOT NULL,
    body       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_image ON sessions(image_id);
CREATE TABLE IF NOT EXISTS messages (
    message_id    TEXT PRIMARY KEY,
    session_id    TEXT NOT NULL,
    created_at_us INTEGER NOT NULL,
    body          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at_us);
";

fn db_err(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Storage(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(db_err)
}

fn from_json<T: serde::de::DeserializeOwned>(body: String) -> Result<T> {
    serde_json::from_str(&body).map_err(db_err)
}

/// Local repository, one SQLite database behind an async mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (and migrate) a database.  `":memory:"` opens an ephemeral one.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().map_err(db_err)?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent).map_err(db_err)?;
            }
            Connection::open(path).map_err(db_err)?
        };
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!(path, "sqlite store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Ephemeral store for tests.
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

impl Store for SqliteStore {
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

// ── Definitions ───────────────────────────────────────────────────────────────

#[async_trait]
impl DefinitionRepo for SqliteStore {
    async fn upsert(&self, def: &Definition) -> Result<()> {
        let body = to_json(def)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO definitions (name, body) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET body = excluded.body",
            params![def.name, body],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Definition>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row("SELECT body FROM definitions WHERE name = ?1", params![name], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)?;
        body.map(from_json).transpose()
    }

    async fn list(&self) -> Result<Vec<Definition>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT body FROM definitions ORDER BY name").map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(from_json).collect()
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM definitions WHERE name = ?1", params![name]).map_err(db_err)?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT COUNT(*) FROM definitions", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(db_err)
    }
}

// ── Images ────────────────────────────────────────────────────────────────────

#[async_trait]
impl ImageRepo for SqliteStore {
    async fn upsert(&self, image: &ImageRecord) -> Result<()> {
        let body = to_json(image)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO images (image_id, definition_name, session_id, body)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(image_id) DO UPDATE SET
                 definition_name = excluded.definition_name,
                 session_id = excluded.session_id,
                 body = excluded.body",
            params![image.image_id, image.definition_name, image.session_id, body],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_by_id(&self, image_id: &str) -> Result<Option<ImageRecord>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row("SELECT body FROM images WHERE image_id = ?1", params![image_id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)?;
        body.map(from_json).transpose()
    }

    async fn list(&self, definition_name: Option<&str>) -> Result<Vec<ImageRecord>> {
        let conn = self.conn.lock().await;
        let rows = match definition_name {
            Some(def) => {
                let mut stmt = conn
                    .prepare("SELECT body FROM images WHERE definition_name = ?1 ORDER BY image_id")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![def], |row| row.get::<_, String>(0))
                    .map_err(db_err)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(db_err)?;
                rows
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT body FROM images ORDER BY image_id").map_err(db_err)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(db_err)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(db_err)?;
                rows
            }
        };
        rows.into_iter().map(from_json).collect()
    }

    async fn delete(&self, image_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM images WHERE image_id = ?1", params![image_id])
            .map_err(db_err)?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(db_err)
    }
}

// ── Containers ────────────────────────────────────────────────────────────────

#[async_trait]
impl ContainerRepo for SqliteStore {
    async fn upsert(&self, container: &ContainerRecord) -> Result<()> {
        let body = to_json(container)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO containers (container_id, body) VALUES (?1, ?2)
             ON CONFLICT(container_id) DO UPDATE SET body = excluded.body",
            params![container.container_id, body],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_by_id(&self, container_id: &str) -> Result<Option<ContainerRecord>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM containers WHERE container_id = ?1",
                params![container_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        body.map(from_json).transpose()
    }

    async fn list(&self) -> Result<Vec<ContainerRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT body FROM containers ORDER BY container_id").map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(from_json).collect()
    }

    async fn delete(&self, container_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM containers WHERE container_id = ?1", params![container_id])
            .map_err(db_err)?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT COUNT(*) FROM containers", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(db_err)
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[async_trait]
impl SessionRepo for SqliteStore {
    async fn upsert(&self, session: &SessionRecord) -> Result<()> {
        let body = to_json(session)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (session_id, image_id, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET
                 image_id = excluded.image_id,
                 body = excluded.body",
            params![session.session_id, session.image_id, body],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        body.map(from_json).transpose()
    }

    async fn list(&self, image_id: Option<&str>) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock().await;
        let rows = match image_id {
            Some(img) => {
                let mut stmt = conn
                    .prepare("SELECT body FROM sessions WHERE image_id = ?1 ORDER BY session_id")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![img], |row| row.get::<_, String>(0))
                    .map_err(db_err)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(db_err)?;
                rows
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT body FROM sessions ORDER BY session_id")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(db_err)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(db_err)?;
                rows
            }
        };
        rows.into_iter().map(from_json).collect()
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM sessions WHERE session_id = ?1", params![session_id])
            .map_err(db_err)?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(db_err)
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[async_trait]
impl MessageRepo for SqliteStore {
    async fn upsert(&self, message: &MessageRecord) -> Result<()> {
        let body = to_json(message)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (message_id, session_id, created_at_us, body)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(message_id) DO UPDATE SET body = excluded.body",
            params![
                message.message_id,
                message.session_id,
                message.created_at.timestamp_micros(),
                body
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn append_batch(&self, messages: &[MessageRecord]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        for message in messages {
            let body = to_json(message)?;
            tx.execute(
                "INSERT INTO messages (message_id, session_id, created_at_us, body)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(message_id) DO UPDATE SET body = excluded.body",
                params![
                    message.message_id,
                    message.session_id,
                    message.created_at.timestamp_micros(),
                    body
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }

    async fn find_by_id(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM messages WHERE message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        body.map(from_json).transpose()
    }

    async fn list_by_session(&self, session_id: &str) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT body FROM messages WHERE session_id = ?1
                 ORDER BY created_at_us ASC, rowid ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(from_json).collect()
    }

    async fn delete(&self, message_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM messages WHERE message_id = ?1", params![message_id])
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_by_session(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM messages WHERE session_id = ?1", params![session_id])
            .map_err(db_err)?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(db_err)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use agentx_types::id;
    use chrono::{Duration, Utc};

    use super::*;

    #[tokio::test]
    async fn definition_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let def = Definition::new("Echo").with_system_prompt("repeat");
        DefinitionRepo::upsert(&store, &def).await.unwrap();
        DefinitionRepo::upsert(&store, &def).await.unwrap();
        assert_eq!(DefinitionRepo::count(&store).await.unwrap(), 1);
        let found = store.find_by_name("Echo").await.unwrap().unwrap();
        assert_eq!(found.system_prompt.as_deref(), Some("repeat"));
    }

    #[tokio::test]
    async fn missing_rows_read_as_none() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.find_by_name("nope").await.unwrap().is_none());
        assert!(ImageRepo::find_by_id(&store, "img_missing").await.unwrap().is_none());
        assert!(!DefinitionRepo::exists(&store, "nope").await.unwrap());
    }

    #[tokio::test]
    async fn messages_order_by_created_at_then_insertion() {
        let store = SqliteStore::in_memory().unwrap();
        let sess = id::session_id();
        let base = Utc::now();

        let mut early = MessageRecord::user(&sess, "first");
        early.created_at = base;
        let mut late = MessageRecord::assistant(&sess, "third");
        late.created_at = base + Duration::seconds(5);
        // Same timestamp as `early` but inserted after it.
        let mut tie = MessageRecord::assistant(&sess, "second");
        tie.created_at = base;

        MessageRepo::upsert(&store, &late).await.unwrap();
        MessageRepo::upsert(&store, &early).await.unwrap();
        MessageRepo::upsert(&store, &tie).await.unwrap();

        let texts: Vec<String> = store
            .list_by_session(&sess)
            .await
            .unwrap()
            .iter()
            .map(|m| m.text())
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn append_batch_is_atomic_and_visible() {
        let store = SqliteStore::in_memory().unwrap();
        let sess = id::session_id();
        let batch = vec![
            MessageRecord::user(&sess, "hello"),
            MessageRecord::assistant(&sess, "hi there"),
        ];
        store.append_batch(&batch).await.unwrap();
        assert_eq!(store.list_by_session(&sess).await.unwrap().len(), 2);
        assert_eq!(MessageRepo::count(&store).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn image_list_filters_by_definition() {
        let store = SqliteStore::in_memory().unwrap();
        let a = ImageRecord::meta(id::image_id(), &Definition::new("A"));
        let b = ImageRecord::meta(id::image_id(), &Definition::new("B"));
        ImageRepo::upsert(&store, &a).await.unwrap();
        ImageRepo::upsert(&store, &b).await.unwrap();

        let only_a = ImageRepo::list(&store, Some("A")).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].definition_name, "A");
        assert_eq!(ImageRepo::list(&store, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteStore::open(path).unwrap();
            ContainerRepo::upsert(&store, &ContainerRecord::new(id::container_id()))
                .await
                .unwrap();
        }
        let store = SqliteStore::open(path).unwrap();
        assert_eq!(ContainerRepo::count(&store).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_by_session_clears_only_that_session() {
        let store = SqliteStore::in_memory().unwrap();
        let a = id::session_id();
        let b = id::session_id();
        MessageRepo::upsert(&store, &MessageRecord::user(&a, "x")).await.unwrap();
        MessageRepo::upsert(&store, &MessageRecord::user(&b, "y")).await.unwrap();

        store.delete_by_session(&a).await.unwrap();
        assert!(store.list_by_session(&a).await.unwrap().is_empty());
        assert_eq!(store.list_by_session(&b).await.unwrap().len(), 1);
    }
}
