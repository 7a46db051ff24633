// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Façade tests against the in-process backing.

use std::sync::Arc;

use agentx_client::{AgentX, AgentXConfig, Block, Conversation, PresentationStatus};
use agentx_runtime::{LocalRuntime, Platform, RuntimeOptions};
use agentx_types::Definition;

fn local_ax() -> AgentX {
    let runtime = Arc::new(LocalRuntime::new(RuntimeOptions::ephemeral()).unwrap());
    AgentX::local(Platform::new(runtime))
}

#[tokio::test]
async fn full_local_round_trip_through_the_namespaces() {
    let ax = local_ax();

    ax.definitions()
        .register(Definition::new("Echo").with_system_prompt("Repeat the user verbatim"))
        .await
        .unwrap();
    let meta = ax.images().meta("Echo").await.unwrap();
    assert!(meta.is_meta());

    let container = ax.containers().create(None).await.unwrap();
    let agent = ax
        .images()
        .run(&meta.image_id, Some(&container.container_id))
        .await
        .unwrap();

    let presentation = ax.presentations().attach(&agent.session_id);

    ax.agents().send(&agent.agent_id, "hello").await.unwrap();

    // The projection saw the whole turn.
    let state = presentation.state();
    assert_eq!(state.status, PresentationStatus::Idle);
    assert!(state.streaming.is_none());
    assert_eq!(state.conversations.len(), 2);
    assert_eq!(state.conversations[0], Conversation::User { text: "hello".into() });
    match &state.conversations[1] {
        Conversation::Assistant { blocks } => {
            let text: String = blocks
                .iter()
                .filter_map(|b| match b {
                    Block::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(text, "hello");
        }
        other => panic!("unexpected conversation: {other:?}"),
    }

    // The sessions namespace reads the same history.
    let messages = ax.sessions().messages(&agent.session_id).await.unwrap();
    assert_eq!(messages.len(), 2);

    // Fork through the namespace, too.
    let fork = ax.sessions().fork(&agent.session_id, None).await.unwrap();
    assert_eq!(ax.sessions().messages(&fork.session_id).await.unwrap().len(), 2);

    ax.agents().destroy(&agent.agent_id).await.unwrap();
    assert!(ax.agents().list().await.unwrap().is_empty());
}

#[tokio::test]
async fn api_key_selects_local_mode() {
    let config = AgentXConfig {
        api_key: Some("unused-for-mock".into()),
        provider: "mock".into(),
        data_path: ":memory:".into(),
        ..Default::default()
    };
    let ax = AgentX::connect(config).await.unwrap();
    assert!(ax.definitions().list().await.unwrap().is_empty());
}
