// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Opaque string identifiers with a type prefix.
//!
//! Every persistent object carries a globally unique id of the form
//! `<prefix>_<uuid-simple>`.  The prefix makes ids self-describing in logs
//! and wire payloads; nothing else about the format is load-bearing.

use uuid::Uuid;

fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

pub fn image_id() -> String {
    new_id("img")
}

pub fn container_id() -> String {
    new_id("ctr")
}

pub fn session_id() -> String {
    new_id("sess")
}

pub fn agent_id() -> String {
    new_id("agent")
}

pub fn message_id() -> String {
    new_id("msg")
}

pub fn turn_id() -> String {
    new_id("turn")
}

/// Prefix for definition-derived ids (meta images are keyed off these).
pub fn definition_id() -> String {
    new_id("def")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        assert!(image_id().starts_with("img_"));
        assert!(container_id().starts_with("ctr_"));
        assert!(session_id().starts_with("sess_"));
        assert!(agent_id().starts_with("agent_"));
        assert!(message_id().starts_with("msg_"));
        assert!(turn_id().starts_with("turn_"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(session_id(), session_id());
    }
}
