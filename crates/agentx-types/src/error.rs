// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Error taxonomy shared by every layer.
//!
//! Transport and protocol kinds carry JSON-RPC codes so the RPC layer can map
//! errors onto the wire without a translation table at each call site.

use thiserror::Error;

/// Every way an operation in the runtime can fail.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Connection loss, malformed frame, exhausted ACK retries.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid JSON-RPC shape, unknown method, bad params.  Never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate definition name, stale update, and friends.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Vendor rejected the request or returned a bad response.  Surfaced as
    /// an `error` event inside the turn; the agent stays usable.
    #[error("driver error: {0}")]
    Driver(String),

    /// A second `receive` while one is already streaming on the driver.
    #[error("driver busy")]
    DriverBusy,

    /// A second concurrent `receive` on the same agent.
    #[error("agent busy")]
    AgentBusy,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// Invariant violation.  Logged at error; the affected agent is destroyed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// JSON-RPC error code for this kind.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::Transport(_) => -32000,
            Self::Protocol(_) => -32600,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::AgentBusy | Self::DriverBusy => 409,
            Self::Timeout(_) => 408,
            Self::Driver(_) | Self::Storage(_) | Self::Internal(_) => -32000,
        }
    }

    /// Rebuild an error from a wire `{code, message}` pair.
    pub fn from_rpc(code: i64, message: &str) -> Self {
        match code {
            401 => Self::Unauthorized(message.into()),
            403 => Self::Forbidden(message.into()),
            404 => Self::NotFound(message.into()),
            408 => Self::Timeout(message.into()),
            409 if message == "agent busy" => Self::AgentBusy,
            409 => Self::Conflict(message.into()),
            -32700..=-32600 => Self::Protocol(message.into()),
            _ => Self::Internal(message.into()),
        }
    }

    /// True when retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_wire_contract() {
        assert_eq!(RuntimeError::Unauthorized("x".into()).rpc_code(), 401);
        assert_eq!(RuntimeError::NotFound("x".into()).rpc_code(), 404);
        assert_eq!(RuntimeError::Timeout("x".into()).rpc_code(), 408);
        assert_eq!(RuntimeError::AgentBusy.rpc_code(), 409);
        assert_eq!(RuntimeError::Protocol("x".into()).rpc_code(), -32600);
        assert_eq!(RuntimeError::Internal("x".into()).rpc_code(), -32000);
    }

    #[test]
    fn agent_busy_survives_a_wire_round_trip() {
        let e = RuntimeError::AgentBusy;
        let back = RuntimeError::from_rpc(e.rpc_code(), &e.to_string());
        assert!(matches!(back, RuntimeError::AgentBusy));
    }

    #[test]
    fn only_transport_and_timeout_are_retryable() {
        assert!(RuntimeError::Transport("x".into()).is_retryable());
        assert!(RuntimeError::Timeout("x".into()).is_retryable());
        assert!(!RuntimeError::Conflict("x".into()).is_retryable());
        assert!(!RuntimeError::Driver("x".into()).is_retryable());
    }
}
