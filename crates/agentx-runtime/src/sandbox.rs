// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-container sandbox: workspace path and tool surface.
//!
//! Agents spawned in a container share its sandbox.  The runtime hands the
//! sandbox to each agent, which consults it before executing a tool call the
//! model requested.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// Executes one tool call on behalf of an agent.  `Err` carries the message
/// surfaced to the model as an error tool result — a failed tool never fails
/// the turn.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, name: &str, input: &Value) -> Result<String, String>;
}

/// Adapter for closure-based tool runners (tests, embedders).
pub struct FnToolRunner<F>(pub F);

#[async_trait]
impl<F> ToolRunner for FnToolRunner<F>
where
    F: Fn(&str, &Value) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>>
        + Send
        + Sync,
{
    async fn run(&self, name: &str, input: &Value) -> Result<String, String> {
        (self.0)(name, input).await
    }
}

/// Isolation boundary shared by a container's agents.
#[derive(Clone)]
pub struct Sandbox {
    pub container_id: String,
    /// Working directory for the container's agents.
    pub workspace: PathBuf,
    /// Tool names the model may invoke; empty allows none.
    pub allowed_tools: Vec<String>,
    pub tools: Option<Arc<dyn ToolRunner>>,
}

impl Sandbox {
    pub fn new(container_id: impl Into<String>, workspace: PathBuf) -> Self {
        Self {
            container_id: container_id.into(),
            workspace,
            allowed_tools: Vec::new(),
            tools: None,
        }
    }

    pub fn with_tools(
        mut self,
        allowed: impl IntoIterator<Item = String>,
        runner: Arc<dyn ToolRunner>,
    ) -> Self {
        self.allowed_tools = allowed.into_iter().collect();
        self.tools = Some(runner);
        self
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == tool)
    }

    /// Run one tool call, mapping policy violations and missing runners to
    /// error results rather than failures.
    pub async fn execute(&self, name: &str, input: &Value) -> (String, bool) {
        if !self.allows(name) {
            return (format!("tool '{name}' is not allowed in this container"), true);
        }
        match &self.tools {
            Some(runner) => match runner.run(name, input).await {
                Ok(output) => (output, false),
                Err(message) => (message, true),
            },
            None => (format!("no tool runner configured for '{name}'"), true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> Arc<dyn ToolRunner> {
        Arc::new(FnToolRunner(|name: &str, _input: &Value| {
            let name = name.to_string();
            Box::pin(async move {
                if name == "get_weather" {
                    Ok("sunny, 21C".to_string())
                } else {
                    Err(format!("unknown tool {name}"))
                }
            }) as Pin<Box<dyn Future<Output = Result<String, String>> + Send>>
        }))
    }

    #[tokio::test]
    async fn disallowed_tool_is_an_error_result() {
        let sandbox = Sandbox::new("ctr_1", PathBuf::from("/tmp/ws"));
        let (output, is_error) = sandbox.execute("get_weather", &Value::Null).await;
        assert!(is_error);
        assert!(output.contains("not allowed"));
    }

    #[tokio::test]
    async fn allowed_tool_runs() {
        let sandbox = Sandbox::new("ctr_1", PathBuf::from("/tmp/ws"))
            .with_tools(vec!["get_weather".to_string()], runner());
        let (output, is_error) = sandbox.execute("get_weather", &Value::Null).await;
        assert!(!is_error);
        assert_eq!(output, "sunny, 21C");
    }

    #[tokio::test]
    async fn runner_failure_maps_to_error_result() {
        let sandbox = Sandbox::new("ctr_1", PathBuf::from("/tmp/ws"))
            .with_tools(vec!["shell".to_string()], runner());
        let (output, is_error) = sandbox.execute("shell", &Value::Null).await;
        assert!(is_error);
        assert!(output.contains("unknown tool"));
    }
}
