// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Layered YAML configuration.
//!
//! Files are merged from lowest to highest priority; the explicit
//! `--config` path wins over everything discovered.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use agentx_client::AgentXConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    /// Remote mode: WebSocket endpoint of an agentx server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// Token presented by clients / required by `serve`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Local mode: provider API key (env vars also work).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// anthropic | openai | google | xai | deepseek | mistral |
    /// openai-compatible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Local repository location; `":memory:"` allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_reconnect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

/// Ordered list of config locations, lowest to highest priority.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/agentx/config.yaml"));
    paths.push(PathBuf::from("/etc/agentx/config.yml"));

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/agentx/config.yaml"));
        paths.push(home.join(".config/agentx/config.yml"));
    }

    paths.push(PathBuf::from(".agentx.yaml"));
    paths.push(PathBuf::from(".agentx.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files plus an
/// optional explicit path.
pub fn load(extra: Option<&Path>) -> anyhow::Result<FileConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_file(&mut merged, &path)?;
        }
    }
    if let Some(path) = extra {
        debug!(path = %path.display(), "loading explicit config");
        merge_file(&mut merged, path)?;
    }

    serde_yaml::from_value(merged).context("invalid configuration")
}

fn merge_file(merged: &mut serde_yaml::Value, path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let layer: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    merge_yaml(merged, layer);
    Ok(())
}

/// Later layers override earlier ones key-by-key; nested mappings merge
/// recursively.
fn merge_yaml(base: &mut serde_yaml::Value, layer: serde_yaml::Value) {
    match (base, layer) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(layer_map)) => {
            for (key, value) in layer_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, layer_value) => *base_slot = layer_value,
    }
}

impl FileConfig {
    /// Resolve into façade configuration, applying env fallbacks.
    pub fn to_agentx(&self) -> AgentXConfig {
        let mut config = AgentXConfig::default();
        config.server_url = self.server_url.clone();
        config.token = self.token.clone();
        config.api_key = self
            .api_key
            .clone()
            .or_else(|| std::env::var("LLM_PROVIDER_KEY").ok());
        if let Some(provider) = &self.provider {
            config.provider = provider.clone();
        }
        config.model = self
            .model
            .clone()
            .or_else(|| std::env::var("LLM_PROVIDER_MODEL").ok());
        config.base_url = self
            .base_url
            .clone()
            .or_else(|| std::env::var("LLM_PROVIDER_URL").ok());
        if let Some(data_path) = &self.data_path {
            config.data_path = data_path.clone();
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(auto) = self.auto_reconnect {
            config.auto_reconnect = auto;
        }
        config.debug = self.debug.unwrap_or(false);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_selects_local_defaults() {
        let cfg = FileConfig::default().to_agentx();
        assert!(cfg.server_url.is_none());
        assert_eq!(cfg.provider, "anthropic");
        assert_eq!(cfg.timeout, Duration::from_secs(30));
        assert!(cfg.auto_reconnect);
    }

    #[test]
    fn layers_merge_key_by_key() {
        let mut base: serde_yaml::Value =
            serde_yaml::from_str("provider: openai\nmodel: gpt-4o").unwrap();
        let layer: serde_yaml::Value = serde_yaml::from_str("model: o3").unwrap();
        merge_yaml(&mut base, layer);
        let cfg: FileConfig = serde_yaml::from_value(base).unwrap();
        assert_eq!(cfg.provider.as_deref(), Some("openai"));
        assert_eq!(cfg.model.as_deref(), Some("o3"));
    }

    #[test]
    fn timeout_ms_maps_to_duration() {
        let cfg: FileConfig = serde_yaml::from_str("timeoutMs: 5000").unwrap();
        assert_eq!(cfg.to_agentx().timeout, Duration::from_millis(5000));
    }
}
