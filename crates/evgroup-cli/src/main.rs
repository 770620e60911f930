//! CLI entry point for evgroup.
//!
//! This binary provides the `evgroup` command with subcommands for
//! inspecting the priority policy and soak-testing an event group.

mod cli;
mod helpers;
mod soak;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use evgroup_kernel::Priority;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::helpers::{format_policy, init_tracing};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Policy { json } => cmd_policy(json),
        Commands::Soak {
            config,
            duration_secs,
            handlers_per_tier,
        } => cmd_soak(config, duration_secs, handlers_per_tier).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: policy
// ---------------------------------------------------------------------------

fn cmd_policy(json: bool) -> Result<()> {
    let table = Priority::policy_table();
    if json {
        let out = serde_json::to_string_pretty(&table).context("failed to serialize policy")?;
        println!("{out}");
    } else {
        print!("{}", format_policy(&table));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: soak
// ---------------------------------------------------------------------------

async fn cmd_soak(
    config: Option<PathBuf>,
    duration_secs: u64,
    handlers_per_tier: usize,
) -> Result<()> {
    init_tracing("info");

    let config = soak::load_config(config.as_deref())?;
    info!(group = %config.name, "configuration loaded");

    let report = soak::run(
        config,
        Duration::from_secs(duration_secs),
        handlers_per_tier,
    )
    .await?;
    report.print();

    if report.failures > 0 {
        anyhow::bail!("{} handler failures recorded", report.failures);
    }
    Ok(())
}
