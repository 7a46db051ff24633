// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! JSON-RPC 2.0 over WebSocket.
//!
//! The transport mirrors the platform API so a browser client and an
//! embedded client are functionally indistinguishable: every platform
//! operation maps 1:1 to a method, bus events fan out as `stream.event`
//! notifications to subscribed sockets, and a reliable-delivery envelope
//! (`{msgId, payload}` + `control.ack`) survives reconnects without
//! duplicating side effects.

pub mod client;
pub mod remote;
pub mod server;
pub mod wire;

pub use client::{ClientOptions, RpcClient};
pub use remote::{RemoteDriver, RemoteRuntime};
pub use server::{RpcServer, ServerConfig};
