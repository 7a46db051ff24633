// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "agentx",
    about = "Multi-tenant runtime for conversational AI agents",
    version
)]
pub struct Cli {
    /// Explicit config file (merged over the discovered layers)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr (AGENTX_LOG controls the filter)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the WebSocket RPC server over a local runtime
    Serve {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:8940")]
        addr: SocketAddr,
    },

    /// One-shot conversation against the configured provider
    Chat {
        /// The prompt; read from stdin when omitted
        prompt: Option<String>,

        /// Definition name to run (registered on the fly if missing)
        #[arg(long, default_value = "assistant")]
        definition: String,
    },

    /// Print the merged configuration
    ShowConfig,

    /// List the registered model providers
    ListProviders {
        #[arg(long)]
        json: bool,
    },
}
