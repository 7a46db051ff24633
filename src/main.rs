// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod config;

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use agentx_client::{AgentX, AgentXConfig};
use agentx_driver::DRIVERS;
use agentx_rpc::{RpcServer, ServerConfig};
use agentx_runtime::{LocalRuntime, Platform, RuntimeOptions};
use agentx_types::{Definition, DriveableEvent, EventPayload, RuntimeError};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let file_config = config::load(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Serve { addr }) => {
            let options = RuntimeOptions {
                provider: file_config.provider.clone().unwrap_or_default(),
                model: file_config.model.clone(),
                api_key: file_config
                    .api_key
                    .clone()
                    .or_else(|| std::env::var("LLM_PROVIDER_KEY").ok()),
                base_url: file_config.base_url.clone(),
                data_path: file_config
                    .data_path
                    .clone()
                    .unwrap_or_else(|| RuntimeOptions::default().data_path),
                ..Default::default()
            };
            let runtime = Arc::new(LocalRuntime::new(options).context("starting local runtime")?);
            let platform = Platform::new(runtime);
            let server = RpcServer::new(
                platform,
                ServerConfig {
                    auth_token: file_config.token.clone(),
                    interrupt_on_disconnect: false,
                },
            );
            server.serve(addr).await
        }

        Some(Commands::Chat { prompt, definition }) => {
            let prompt = match prompt {
                Some(p) => p,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf.trim().to_string()
                }
            };
            if prompt.is_empty() {
                anyhow::bail!("empty prompt");
            }
            run_chat(file_config.to_agentx(), &definition, &prompt).await
        }

        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&file_config).unwrap_or_default());
            Ok(())
        }

        Some(Commands::ListProviders { json }) => {
            if json {
                let rows: Vec<_> = DRIVERS
                    .iter()
                    .map(|d| {
                        serde_json::json!({
                            "id": d.id,
                            "name": d.name,
                            "description": d.description,
                            "defaultModel": d.default_model,
                            "apiKeyEnv": d.default_api_key_env,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for d in DRIVERS {
                    println!("{:<20} {} — {}", d.id, d.name, d.description);
                }
            }
            Ok(())
        }

        None => {
            // No subcommand: behave like `chat` reading stdin.
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            let prompt = buf.trim().to_string();
            if prompt.is_empty() {
                anyhow::bail!("empty prompt (pipe text in, or see --help)");
            }
            run_chat(file_config.to_agentx(), "assistant", &prompt).await
        }
    }
}

/// One-shot conversation: stream the assistant text to stdout.
async fn run_chat(config: AgentXConfig, definition_name: &str, prompt: &str) -> anyhow::Result<()> {
    let ax = AgentX::connect(config).await?;

    // Register the definition on the fly; a previous run may have done so.
    let definition = Definition::new(definition_name)
        .with_system_prompt("You are a helpful assistant. Be concise.");
    match ax.definitions().register(definition).await {
        Ok(_) | Err(RuntimeError::Conflict(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let meta = ax.images().meta(definition_name).await?;
    let container = ax.containers().create(None).await?;
    let agent = ax.images().run(&meta.image_id, Some(&container.container_id)).await?;
    ax.subscribe(&agent.session_id);

    let subscription = ax.on(["text_delta"], |event| {
        if let EventPayload::Stream(DriveableEvent::TextDelta { text }) = &event.payload {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
    });

    let result = ax.agents().send(&agent.agent_id, prompt).await;
    ax.off(subscription);
    println!();

    result?;
    ax.agents().destroy(&agent.agent_id).await?;
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env("AGENTX_LOG").unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info")
        } else {
            EnvFilter::new("warn")
        }
    });

    if let Ok(path) = std::env::var("AGENTX_LOG_FILE") {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
                .init();
            return;
        }
    }
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
