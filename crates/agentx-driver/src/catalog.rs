// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pricing catalog.
//!
//! USD per million tokens for the models the registry defaults to, plus a
//! conservative per-provider fallback for models not listed.  Drivers read
//! their prices here; the engine multiplies them by driver-reported usage.
//! A driver may override [`crate::Driver::pricing`] entirely — the table is
//! the default, not the rule.

use agentx_types::Pricing;

struct PriceEntry {
    provider: &'static str,
    /// Prefix match so dated model ids (`-20250514`) hit their family row.
    model_prefix: &'static str,
    pricing: Pricing,
}

static PRICES: &[PriceEntry] = &[
    // ── Anthropic ─────────────────────────────────────────────────────────────
    PriceEntry {
        provider: "anthropic",
        model_prefix: "claude-opus-4",
        pricing: Pricing::new(15.0, 75.0),
    },
    PriceEntry {
        provider: "anthropic",
        model_prefix: "claude-sonnet-4",
        pricing: Pricing::new(3.0, 15.0),
    },
    PriceEntry {
        provider: "anthropic",
        model_prefix: "claude-haiku-4",
        pricing: Pricing::new(1.0, 5.0),
    },
    PriceEntry {
        provider: "anthropic",
        model_prefix: "claude-3-5-haiku",
        pricing: Pricing::new(0.8, 4.0),
    },
    // ── OpenAI ────────────────────────────────────────────────────────────────
    PriceEntry {
        provider: "openai",
        model_prefix: "gpt-4o-mini",
        pricing: Pricing::new(0.15, 0.6),
    },
    PriceEntry {
        provider: "openai",
        model_prefix: "gpt-4o",
        pricing: Pricing::new(2.5, 10.0),
    },
    PriceEntry {
        provider: "openai",
        model_prefix: "o3",
        pricing: Pricing::new(2.0, 8.0),
    },
    // ── Google ────────────────────────────────────────────────────────────────
    PriceEntry {
        provider: "google",
        model_prefix: "gemini-2.0-flash",
        pricing: Pricing::new(0.1, 0.4),
    },
    PriceEntry {
        provider: "google",
        model_prefix: "gemini-2.5-pro",
        pricing: Pricing::new(1.25, 10.0),
    },
    // ── Others ────────────────────────────────────────────────────────────────
    PriceEntry {
        provider: "xai",
        model_prefix: "grok-3",
        pricing: Pricing::new(3.0, 15.0),
    },
    PriceEntry {
        provider: "deepseek",
        model_prefix: "deepseek-chat",
        pricing: Pricing::new(0.27, 1.1),
    },
    PriceEntry {
        provider: "deepseek",
        model_prefix: "deepseek-reasoner",
        pricing: Pricing::new(0.55, 2.19),
    },
    PriceEntry {
        provider: "mistral",
        model_prefix: "mistral-large",
        pricing: Pricing::new(2.0, 6.0),
    },
];

/// Price for a provider/model pair.  Unknown models fall back to zero so a
/// local or unlisted model never fabricates a cost.
pub fn pricing_for(provider: &str, model: &str) -> Pricing {
    PRICES
        .iter()
        .find(|e| e.provider == provider && model.starts_with(e.model_prefix))
        .map(|e| e.pricing)
        .unwrap_or_default()
}
