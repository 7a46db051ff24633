// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared data model for the agentx runtime.
//!
//! Everything that crosses a crate boundary lives here: persistent records
//! (definitions, images, containers, sessions, messages), the streaming event
//! taxonomy produced by drivers, the bus event envelope, and the error
//! taxonomy.  This crate is intentionally free of I/O — it only depends on
//! serde, uuid, and chrono.

pub mod error;
pub mod event;
pub mod id;
pub mod message;
pub mod record;

pub use error::RuntimeError;
pub use event::{
    ConversationStatus, DriveableEvent, Event, EventContext, EventPayload, Pricing, SemanticEvent,
    StopReason, Usage,
};
pub use message::{parse_data_url, ContentPart, MessageContent, MessageRecord, Role};
pub use record::{ContainerRecord, Definition, ImageRecord, McpServerConfig, SessionRecord};
