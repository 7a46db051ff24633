// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Live objects of the runtime.
//!
//! A [`Platform`] wires one [`Runtime`] (the factory for drivers, sandboxes,
//! and the repository) to one shared [`agentx_bus::EventBus`] and owns the
//! containers.  Containers own live [`Agent`]s; sessions and images are
//! records with handles around them.  Everything here is vendor-neutral:
//! vendor code lives behind [`Runtime::create_driver`].

pub mod agent;
pub mod container;
pub mod platform;
pub mod runtime;
pub mod sandbox;
pub mod session;

pub use agent::{Agent, AgentInfo, AgentLifecycle};
pub use container::Container;
pub use platform::{CreateImageParams, Platform, SendTarget};
pub use runtime::{LocalRuntime, Runtime, RuntimeOptions};
pub use sandbox::{FnToolRunner, Sandbox, ToolRunner};
pub use session::SessionHandle;
