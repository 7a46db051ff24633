// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Persistent records of the Docker-style object model:
//! Definition → Image → Container → Session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Definition ───────────────────────────────────────────────────────────────

/// Externally configured tool provider surfaced to the driver.  The runtime
/// carries this opaquely; tool execution happens behind the driver boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    pub name: String,
    /// Spawn command for stdio servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Endpoint for HTTP/SSE servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Design-time agent blueprint.  Immutable once registered; registering
/// auto-materializes a meta image with the same definition name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    /// Unique name; acts as the primary key.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<Vec<McpServerConfig>>,
}

impl Definition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), description: None, system_prompt: None, mcp_servers: None }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

// ─── Image ────────────────────────────────────────────────────────────────────

/// One image record, meta or snapshot.
///
/// A meta image is derived automatically from a Definition and carries no
/// `session_id`; it is reusable across containers.  A snapshot image is
/// produced from a running agent and carries the session whose history
/// `run` restores.  Snapshot images are immutable except for `name` and
/// `custom_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub image_id: String,
    pub definition_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<Vec<McpServerConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Build the meta image for a definition.
    pub fn meta(image_id: impl Into<String>, definition: &Definition) -> Self {
        let now = Utc::now();
        Self {
            image_id: image_id.into(),
            definition_name: definition.name.clone(),
            container_id: None,
            name: Some(definition.name.clone()),
            system_prompt: definition.system_prompt.clone(),
            mcp_servers: definition.mcp_servers.clone(),
            session_id: None,
            custom_data: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when this image was auto-derived from a definition (no history).
    pub fn is_meta(&self) -> bool {
        self.session_id.is_none()
    }
}

// ─── Container ────────────────────────────────────────────────────────────────

/// Isolation namespace.  Agents spawned in a container share its sandbox;
/// deleting a container destroys every agent and session it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub container_id: String,
    pub created_at: DateTime<Utc>,
}

impl ContainerRecord {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self { container_id: container_id.into(), created_at: Utc::now() }
    }
}

// ─── Session ──────────────────────────────────────────────────────────────────

/// Append-only message log tied to one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub image_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, image_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            image_id: image_id.into(),
            user_id: None,
            title: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id;

    #[test]
    fn meta_image_has_no_session() {
        let def = Definition::new("Echo").with_system_prompt("Repeat the user verbatim");
        let img = ImageRecord::meta(id::image_id(), &def);
        assert!(img.is_meta());
        assert_eq!(img.definition_name, "Echo");
        assert_eq!(img.system_prompt.as_deref(), Some("Repeat the user verbatim"));
    }

    #[test]
    fn snapshot_image_is_not_meta() {
        let def = Definition::new("Echo");
        let mut img = ImageRecord::meta(id::image_id(), &def);
        img.session_id = Some(id::session_id());
        assert!(!img.is_meta());
    }

    #[test]
    fn optional_fields_are_omitted_on_the_wire() {
        let def = Definition::new("Echo");
        let j = serde_json::to_value(&def).unwrap();
        assert!(j.get("description").is_none());
        assert!(j.get("mcp_servers").is_none());
    }
}
