// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "parley",
    about = "Turn-based conversation orchestrator for autonomous LLM agents",
    version
)]
pub struct Cli {
    /// Explicit config file (merged over the standard search paths)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose diagnostics on stderr (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start a conversation and drive it to termination
    Run {
        /// Scenario name; defaults to the first defined
        #[arg(long)]
        scenario: Option<String>,

        /// Override the scenario's cycle budget
        #[arg(long)]
        max_cycles: Option<u32>,

        /// Override which agent opens the conversation
        #[arg(long)]
        starting_agent: Option<String>,

        /// Drive only this many cycles, then leave the conversation
        #[arg(long)]
        cycles: Option<u32>,

        /// Write a markdown transcript here after the run
        #[arg(long)]
        export: Option<PathBuf>,

        /// Print streamed agent thoughts to stderr
        #[arg(long)]
        show_thoughts: bool,
    },

    /// List configured scenarios
    Scenarios,

    /// Probe every configured model endpoint (or one agent's)
    CheckEndpoint {
        /// Probe only this agent's endpoint
        #[arg(long)]
        agent: Option<String>,
    },

    /// Start the configured tool servers and report their status
    Tools,
}
