// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use switchboard_config::AgentMode;

#[derive(Parser, Debug)]
#[command(
    name = "switchboard",
    about = "Multi-provider LLM orchestration core: key-pool dispatch, agentic tool loop, local GGUF inference",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Initial prompt. Read from stdin when omitted.
    #[arg(value_name = "PROMPT")]
    pub prompt: Option<String>,

    /// Agent mode: "chat" (single generation, no tools) or "agent" (full loop).
    #[arg(long, short = 'm', value_enum, default_value = "agent")]
    pub mode: AgentMode,

    /// Model override, e.g. "anthropic/claude-opus-4-5" or a named provider key.
    #[arg(long, short = 'M', env = "SWITCHBOARD_MODEL")]
    pub model: Option<String>,

    /// Path to config file (overrides auto-discovery).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
    /// Print the effective configuration and exit.
    ShowConfig,
    /// List available models for the configured provider(s).
    ListModels {
        /// Filter by provider id (e.g. "openai", "anthropic", "groq").
        #[arg(long, short = 'p')]
        provider: Option<String>,
        /// Output as JSON instead of a formatted table.
        #[arg(long)]
        json: bool,
    },
    /// List all supported model providers.
    ListProviders {
        /// Show detailed information for each provider.
        #[arg(long, short = 'v')]
        verbose: bool,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "switchboard", &mut std::io::stdout());
}
