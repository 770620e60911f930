//! CLI argument definitions for evgroup.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// evgroup -- inspect and exercise the event group scheduler.
#[derive(Parser)]
#[command(
    name = "evgroup",
    version,
    about = "evgroup -- priority-tiered event handler scheduler",
    long_about = "Prints the priority policy table and runs soak tests that drive an event \
                  group with synthetic handlers on every tier."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print how each priority tier is scheduled.
    Policy {
        /// Emit the table as JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Run synthetic handlers on every shared tier plus one blocking handler,
    /// then close the group and report poll counts.
    Soak {
        /// TOML file with a `[group]` table.
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// How long to keep the group running.
        #[arg(long, default_value_t = 5)]
        duration_secs: u64,

        /// Synthetic handlers registered per shared tier.
        #[arg(long, default_value_t = 4)]
        handlers_per_tier: usize,
    },
}
