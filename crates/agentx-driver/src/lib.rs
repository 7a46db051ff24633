// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Vendor drivers.
//!
//! A driver adapts one LLM vendor to a uniform stream of
//! [`DriveableEvent`]s.  One driver instance serves one live agent: it holds
//! the agent's session id and system prompt, serializes `receive` calls, and
//! stays reusable after an interrupt.  This crate is the only place
//! vendor-specific wire code lives.

pub mod anthropic;
pub mod catalog;
pub mod google;
pub mod mock;
pub mod openai_compat;
pub mod registry;
mod sse;

use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use agentx_types::{DriveableEvent, MessageRecord, Pricing, RuntimeError};

pub use anthropic::AnthropicDriver;
pub use google::GoogleDriver;
pub use mock::{MockDriver, ScriptedDriver};
pub use openai_compat::OpenAiCompatDriver;
pub use registry::{DriverMeta, DRIVERS};

/// Stream of events produced by one `receive` call.  Always ends with a
/// terminal event (`message_stop`, `interrupted`, or `error`) — drivers
/// never fail mid-stream by other means.
pub type DriveStream = Pin<Box<dyn Stream<Item = DriveableEvent> + Send>>;

/// Lifecycle of a driver instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Active,
    Disposed,
}

/// A vendor adapter.  Exactly one `receive` may be streaming at a time.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Provider id, e.g. `"anthropic"`.
    fn name(&self) -> &str;

    /// The session this driver drives.
    fn session_id(&self) -> &str;

    fn state(&self) -> DriverState;

    /// Per-token prices for this driver's model, used for turn cost.
    fn pricing(&self) -> Pricing {
        Pricing::default()
    }

    /// One-time setup (HTTP client warm-up, subprocess spawn).  Drivers that
    /// need nothing are ready immediately.
    async fn initialize(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Send the session's messages (prior history plus the new user message,
    /// verbatim) and stream the vendor's response.
    async fn receive(&self, messages: Vec<MessageRecord>) -> Result<DriveStream, RuntimeError>;

    /// Abort the current stream.  The in-flight stream ends with
    /// `interrupted` within a bounded wait; the driver is reusable after.
    async fn interrupt(&self);

    /// Release resources.  Subsequent `receive` calls fail.
    async fn dispose(&self);
}

// ─── Shared driver plumbing ───────────────────────────────────────────────────

const STATE_IDLE: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_DISPOSED: u8 = 2;

/// State + cancellation bookkeeping shared by every driver implementation.
pub struct DriverCore {
    name: String,
    session_id: String,
    state: Arc<AtomicU8>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl DriverCore {
    pub fn new(name: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            session_id: session_id.into(),
            state: Arc::new(AtomicU8::new(STATE_IDLE)),
            cancel: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> DriverState {
        match self.state.load(Ordering::SeqCst) {
            STATE_ACTIVE => DriverState::Active,
            STATE_DISPOSED => DriverState::Disposed,
            _ => DriverState::Idle,
        }
    }

    /// Claim the single receive slot.  Fails with `DriverBusy` while a
    /// stream is active and with `Driver` after dispose.
    pub fn begin(&self) -> Result<CancellationToken, RuntimeError> {
        match self.state.compare_exchange(
            STATE_IDLE,
            STATE_ACTIVE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                let token = CancellationToken::new();
                *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
                Ok(token)
            }
            Err(STATE_DISPOSED) => Err(RuntimeError::Driver("driver disposed".into())),
            Err(_) => Err(RuntimeError::DriverBusy),
        }
    }

    /// Release the receive slot after a failure that happened before the
    /// guarded stream existed (request build, HTTP status).
    pub fn abort(&self) {
        let _ = self.state.compare_exchange(
            STATE_ACTIVE,
            STATE_IDLE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn interrupt(&self) {
        if let Some(token) = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            token.cancel();
        }
    }

    pub fn dispose(&self) {
        self.interrupt();
        self.state.store(STATE_DISPOSED, Ordering::SeqCst);
    }

    /// Wrap a provider's raw event stream with the shared termination
    /// contract: cancellation yields `interrupted`, an underlying stream
    /// that ends without a terminal event yields `error`, and the driver
    /// returns to idle once the stream finishes (or is dropped early).
    pub fn guard(
        &self,
        token: CancellationToken,
        raw: impl Stream<Item = DriveableEvent> + Send + 'static,
    ) -> DriveStream {
        let state = Arc::clone(&self.state);
        Box::pin(async_stream::stream! {
            let _reset = ResetToIdle(state);
            futures::pin_mut!(raw);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!("drive stream interrupted");
                        yield DriveableEvent::Interrupted;
                        break;
                    }
                    next = raw.next() => match next {
                        Some(ev) => {
                            let terminal = ev.is_terminal();
                            yield ev;
                            if terminal {
                                break;
                            }
                        }
                        None => {
                            yield DriveableEvent::Error {
                                message: "stream ended without message_stop".into(),
                            };
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Returns the driver to idle when the guarded stream finishes or is
/// dropped mid-flight, unless it was disposed in the meantime.
struct ResetToIdle(Arc<AtomicU8>);

impl Drop for ResetToIdle {
    fn drop(&mut self) {
        let _ = self.0.compare_exchange(
            STATE_ACTIVE,
            STATE_IDLE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

// ─── Construction ─────────────────────────────────────────────────────────────

/// Everything needed to build a driver for one agent.
#[derive(Debug, Clone, Default)]
pub struct DriverSpec {
    /// Provider id from the registry; empty selects the default provider.
    pub provider: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub system_prompt: Option<String>,
    pub session_id: String,
}

/// Build a driver from a spec, resolving the model, key, and base URL
/// through the registry and environment (`LLM_PROVIDER_KEY`,
/// `LLM_PROVIDER_URL`, `LLM_PROVIDER_MODEL`, plus the provider's own key
/// env).
pub fn from_spec(spec: &DriverSpec) -> Result<Arc<dyn Driver>, RuntimeError> {
    let provider = if spec.provider.is_empty() { registry::DEFAULT_PROVIDER } else { &spec.provider };
    let meta = registry::lookup(provider)
        .ok_or_else(|| RuntimeError::NotFound(format!("unknown provider '{provider}'")))?;

    if matches!(meta.wire, registry::Wire::Mock) {
        return Ok(Arc::new(MockDriver::new(&spec.session_id)));
    }

    let api_key = spec
        .api_key
        .clone()
        .or_else(|| meta.default_api_key_env.and_then(|env| std::env::var(env).ok()))
        .or_else(|| std::env::var("LLM_PROVIDER_KEY").ok());
    let base_url = spec
        .base_url
        .clone()
        .or_else(|| std::env::var("LLM_PROVIDER_URL").ok())
        .or_else(|| meta.default_base_url.map(str::to_string));
    let model = spec
        .model
        .clone()
        .or_else(|| std::env::var("LLM_PROVIDER_MODEL").ok())
        .unwrap_or_else(|| meta.default_model.to_string());

    if meta.requires_api_key && api_key.is_none() {
        return Err(RuntimeError::Unauthorized(format!(
            "provider '{provider}' needs an api key (set {})",
            meta.default_api_key_env.unwrap_or("LLM_PROVIDER_KEY")
        )));
    }

    let base_url = base_url
        .ok_or_else(|| RuntimeError::Internal(format!("provider '{provider}' has no base url")))?;

    let driver: Arc<dyn Driver> = match meta.wire {
        registry::Wire::Anthropic => Arc::new(AnthropicDriver::new(
            &spec.session_id,
            model,
            api_key,
            base_url,
            spec.system_prompt.clone(),
        )),
        registry::Wire::OpenAi => Arc::new(OpenAiCompatDriver::new(
            provider,
            &spec.session_id,
            model,
            api_key,
            base_url,
            spec.system_prompt.clone(),
        )),
        registry::Wire::Google => Arc::new(GoogleDriver::new(
            &spec.session_id,
            model,
            api_key,
            base_url,
            spec.system_prompt.clone(),
        )),
        registry::Wire::Mock => unreachable!("handled above"),
    };
    Ok(driver)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
