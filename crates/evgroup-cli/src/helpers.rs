//! Shared helper functions used across CLI subcommands.

use evgroup_kernel::{PolicyEntry, Strategy};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
///
/// `RUST_LOG` overrides the default when set.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render the policy table as aligned text.
pub fn format_policy(table: &[PolicyEntry]) -> String {
    let mut out = format!("{:<12} {:<10} {:<8} {}\n", "PRIORITY", "STRATEGY", "BUCKET", "INTERVAL");
    for entry in table {
        let line = match entry.strategy {
            Strategy::Shared { bucket, interval } => format!(
                "{:<12} {:<10} {:<8} {}\n",
                entry.priority.as_str(),
                "shared",
                bucket.as_str(),
                interval
            ),
            Strategy::Dedicated => {
                format!("{:<12} {:<10} {:<8} {}\n", entry.priority.as_str(), "dedicated", "-", "-")
            }
        };
        out.push_str(&line);
    }
    out
}
