// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::Parser;

/// Local daemon bridging a mobile chat client to an LLM with MCP tools
/// and scheduled workflows.
#[derive(Parser, Debug)]
#[command(name = "bosun", version, about)]
pub struct Cli {
    /// TCP port the WebSocket listener binds.
    #[arg(long, default_value_t = 9200)]
    pub port: u16,

    /// State directory override (default: ~/.bosun).
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
