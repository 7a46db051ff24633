// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver registry: static metadata for every supported provider.
//!
//! Single source of truth for which provider ids exist and what their
//! defaults are.  Construction logic lives in [`crate::from_spec`].

/// Which wire dialect a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    Anthropic,
    OpenAi,
    Google,
    Mock,
}

/// Metadata describing a registered driver.
#[derive(Debug, Clone)]
pub struct DriverMeta {
    /// Unique provider id used in the `provider` config field.
    pub id: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    pub description: &'static str,
    pub wire: Wire,
    /// Default environment variable that holds the API key.
    pub default_api_key_env: Option<&'static str>,
    /// Default base URL when config does not set one.
    pub default_base_url: Option<&'static str>,
    /// Model used when neither config nor env names one.
    pub default_model: &'static str,
    pub requires_api_key: bool,
}

/// Provider selected when config names none.
pub const DEFAULT_PROVIDER: &str = "anthropic";

/// Complete registry of supported drivers.
pub static DRIVERS: &[DriverMeta] = &[
    DriverMeta {
        id: "anthropic",
        name: "Anthropic",
        description: "Anthropic Claude models via the Messages API",
        wire: Wire::Anthropic,
        default_api_key_env: Some("ANTHROPIC_API_KEY"),
        default_base_url: Some("https://api.anthropic.com"),
        default_model: "claude-sonnet-4-5",
        requires_api_key: true,
    },
    DriverMeta {
        id: "openai",
        name: "OpenAI",
        description: "OpenAI GPT and o-series models",
        wire: Wire::OpenAi,
        default_api_key_env: Some("OPENAI_API_KEY"),
        default_base_url: Some("https://api.openai.com/v1"),
        default_model: "gpt-4o",
        requires_api_key: true,
    },
    DriverMeta {
        id: "google",
        name: "Google Gemini",
        description: "Google Gemini models via the Generative Language API",
        wire: Wire::Google,
        default_api_key_env: Some("GEMINI_API_KEY"),
        default_base_url: Some("https://generativelanguage.googleapis.com"),
        default_model: "gemini-2.0-flash",
        requires_api_key: true,
    },
    DriverMeta {
        id: "xai",
        name: "xAI",
        description: "xAI Grok models (OpenAI-compatible wire format)",
        wire: Wire::OpenAi,
        default_api_key_env: Some("XAI_API_KEY"),
        default_base_url: Some("https://api.x.ai/v1"),
        default_model: "grok-3",
        requires_api_key: true,
    },
    DriverMeta {
        id: "deepseek",
        name: "DeepSeek",
        description: "DeepSeek chat and reasoner models (OpenAI-compatible wire format)",
        wire: Wire::OpenAi,
        default_api_key_env: Some("DEEPSEEK_API_KEY"),
        default_base_url: Some("https://api.deepseek.com/v1"),
        default_model: "deepseek-chat",
        requires_api_key: true,
    },
    DriverMeta {
        id: "mistral",
        name: "Mistral",
        description: "Mistral models (OpenAI-compatible wire format)",
        wire: Wire::OpenAi,
        default_api_key_env: Some("MISTRAL_API_KEY"),
        default_base_url: Some("https://api.mistral.ai/v1"),
        default_model: "mistral-large-latest",
        requires_api_key: true,
    },
    DriverMeta {
        id: "openai-compatible",
        name: "OpenAI-compatible",
        description: "Any OpenAI-compatible endpoint (local servers, proxies; set base_url)",
        wire: Wire::OpenAi,
        default_api_key_env: None,
        default_base_url: None,
        default_model: "default",
        requires_api_key: false,
    },
    DriverMeta {
        id: "mock",
        name: "Mock",
        description: "Deterministic offline driver for tests",
        wire: Wire::Mock,
        default_api_key_env: None,
        default_base_url: None,
        default_model: "mock-model",
        requires_api_key: false,
    },
];

/// Look a provider up by id.
pub fn lookup(id: &str) -> Option<&'static DriverMeta> {
    DRIVERS.iter().find(|m| m.id == id)
}
