// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Runtime factories.
//!
//! A [`Runtime`] is the only place platform-specific construction lives:
//! which driver to build, which store backs the repositories, where a
//! container's workspace goes.  [`LocalRuntime`] binds real vendor drivers
//! and a SQLite store; a remote deployment substitutes RPC-backed
//! implementations without touching anything above this seam.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use agentx_driver::{from_spec, Driver, DriverSpec};
use agentx_store::{SqliteStore, Store};
use agentx_types::{ImageRecord, RuntimeError};

use crate::sandbox::{Sandbox, ToolRunner};

/// Factory seam between the object model and the platform underneath it.
pub trait Runtime: Send + Sync {
    fn store(&self) -> Arc<dyn Store>;

    /// Build the driver for one agent.  The image carries the definition's
    /// system prompt (plus any snapshot overrides).
    fn create_driver(
        &self,
        session_id: &str,
        image: &ImageRecord,
    ) -> Result<Arc<dyn Driver>, RuntimeError>;

    /// Build the sandbox for a container.
    fn create_sandbox(&self, container_id: &str) -> Result<Sandbox, RuntimeError>;

    /// Idle window before an in-flight turn is failed with a timeout.
    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(300)
    }

    fn driver_init_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
}

// ── Local runtime ─────────────────────────────────────────────────────────────

/// Options for the in-process runtime.
#[derive(Clone)]
pub struct RuntimeOptions {
    /// Provider id; empty selects the registry default.
    pub provider: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Repository location; `":memory:"` keeps everything ephemeral.
    pub data_path: String,
    /// Per-container workspaces are created under this root.
    pub workspace_root: PathBuf,
    pub allowed_tools: Vec<String>,
    pub tool_runner: Option<Arc<dyn ToolRunner>>,
    pub idle_timeout: Duration,
    pub driver_init_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            provider: String::new(),
            model: None,
            api_key: None,
            base_url: None,
            data_path: home
                .join(".agentx/data/agentx.db")
                .to_string_lossy()
                .into_owned(),
            workspace_root: home.join(".agentx/workspaces"),
            allowed_tools: Vec::new(),
            tool_runner: None,
            idle_timeout: Duration::from_secs(300),
            driver_init_timeout: Duration::from_secs(60),
        }
    }
}

impl RuntimeOptions {
    /// Ephemeral options for tests: mock provider, in-memory store, temp
    /// workspaces.
    pub fn ephemeral() -> Self {
        Self {
            provider: "mock".into(),
            data_path: ":memory:".into(),
            workspace_root: std::env::temp_dir().join("agentx-workspaces"),
            ..Default::default()
        }
    }
}

/// In-process runtime: real vendor drivers, SQLite repositories.
pub struct LocalRuntime {
    options: RuntimeOptions,
    store: Arc<dyn Store>,
}

impl LocalRuntime {
    pub fn new(options: RuntimeOptions) -> Result<Self, RuntimeError> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&options.data_path)?);
        debug!(data_path = %options.data_path, "local runtime ready");
        Ok(Self { options, store })
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }
}

impl Runtime for LocalRuntime {
    fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    fn create_driver(
        &self,
        session_id: &str,
        image: &ImageRecord,
    ) -> Result<Arc<dyn Driver>, RuntimeError> {
        let spec = DriverSpec {
            provider: self.options.provider.clone(),
            model: self.options.model.clone(),
            api_key: self.options.api_key.clone(),
            base_url: self.options.base_url.clone(),
            system_prompt: image.system_prompt.clone(),
            session_id: session_id.to_string(),
        };
        from_spec(&spec)
    }

    fn create_sandbox(&self, container_id: &str) -> Result<Sandbox, RuntimeError> {
        let workspace = self.options.workspace_root.join(container_id);
        std::fs::create_dir_all(&workspace)
            .map_err(|e| RuntimeError::Internal(format!("cannot create workspace: {e}")))?;
        let mut sandbox = Sandbox::new(container_id, workspace);
        if let Some(runner) = &self.options.tool_runner {
            sandbox = sandbox
                .with_tools(self.options.allowed_tools.iter().cloned(), Arc::clone(runner));
        }
        Ok(sandbox)
    }

    fn idle_timeout(&self) -> Duration {
        self.options.idle_timeout
    }

    fn driver_init_timeout(&self) -> Duration {
        self.options.driver_init_timeout
    }
}
