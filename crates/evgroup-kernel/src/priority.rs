//! Priority tiers and the static policy table.
//!
//! Every handler declares a [`Priority`].  The priority is read once at
//! registration and resolved to a [`Strategy`] which decides where the
//! handler runs for the rest of its life:
//!
//! | Tier | Strategy | Bucket | Serviced |
//! |------|----------|--------|----------|
//! | `High` | shared | core | every pass |
//! | `Medium` | shared | core | every pass |
//! | `Timer` | shared | core | every 4th busy pass |
//! | `Daemon` | shared | core | every 16th busy pass |
//! | `Monitor` | shared | monitor | every monitor pass |
//! | `Replication` | dedicated | -- | own thread |
//! | `Concurrent` | dedicated | -- | own thread |
//! | `Blocking` | dedicated | -- | own thread |
//!
//! # Weighting
//!
//! Intervals inside a bucket are nested powers of two, so whenever a tier is
//! serviced every higher tier of the same bucket is serviced in that pass as
//! well.  A pass that follows an idle pass services every tier regardless of
//! interval, which keeps low tiers responsive while the loop is quiet without
//! breaking the ordering: over any run, a higher tier is polled at least as
//! often as a lower one.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Declared priority of an event handler, highest rank first.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Latency-critical work, polled on every core pass.
    High,
    /// Default tier for ordinary handlers.
    #[default]
    Medium,
    /// Timer-style checks that tolerate coarser service.
    Timer,
    /// Background housekeeping.
    Daemon,
    /// Observers of the other runners, serviced on their own thread at a
    /// fixed cadence.
    Monitor,
    /// Dedicated thread per handler, for replication traffic that must not
    /// share a loop with anything else.
    Replication,
    /// Dedicated thread per handler, for handlers that run fully
    /// independently.
    Concurrent,
    /// Dedicated thread per handler; `poll` may block indefinitely.
    Blocking,
}

/// The cooperative runner a shared tier is multiplexed onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    /// The main loop, paced by the idle backoff.
    Core,
    /// The monitor loop, paced by a fixed interval.
    Monitor,
}

/// How handlers of a tier are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    /// Multiplexed with other handlers on the bucket's runner thread.
    Shared {
        bucket: Bucket,
        /// The tier is polled on passes whose number is a multiple of this.
        interval: u32,
    },
    /// One private runner thread per handler.
    Dedicated,
}

/// One row of the policy table, as printed by tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub priority: Priority,
    pub strategy: Strategy,
}

// ---------------------------------------------------------------------------
// Policy table
// ---------------------------------------------------------------------------

impl Priority {
    /// Every tier, highest rank first.
    pub const ALL: [Priority; 8] = [
        Priority::High,
        Priority::Medium,
        Priority::Timer,
        Priority::Daemon,
        Priority::Monitor,
        Priority::Replication,
        Priority::Concurrent,
        Priority::Blocking,
    ];

    /// Number of shared tiers; shared tiers occupy the first
    /// `SHARED_TIERS` positions of [`Priority::ALL`].
    pub const SHARED_TIERS: usize = 5;

    /// Resolve the execution strategy of this tier.
    #[must_use]
    pub const fn strategy(self) -> Strategy {
        match self {
            Priority::High | Priority::Medium => Strategy::Shared {
                bucket: Bucket::Core,
                interval: 1,
            },
            Priority::Timer => Strategy::Shared {
                bucket: Bucket::Core,
                interval: 4,
            },
            Priority::Daemon => Strategy::Shared {
                bucket: Bucket::Core,
                interval: 16,
            },
            Priority::Monitor => Strategy::Shared {
                bucket: Bucket::Monitor,
                interval: 1,
            },
            Priority::Replication | Priority::Concurrent | Priority::Blocking => {
                Strategy::Dedicated
            }
        }
    }

    /// Whether handlers of this tier get their own thread.
    #[must_use]
    pub const fn is_dedicated(self) -> bool {
        matches!(self.strategy(), Strategy::Dedicated)
    }

    /// Position of this tier in [`Priority::ALL`]; lower is higher rank.
    #[must_use]
    pub const fn rank(self) -> usize {
        self as usize
    }

    /// Short lowercase label used in thread names and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Timer => "timer",
            Priority::Daemon => "daemon",
            Priority::Monitor => "monitor",
            Priority::Replication => "replication",
            Priority::Concurrent => "concurrent",
            Priority::Blocking => "blocking",
        }
    }

    /// The whole table, in rank order.
    pub fn policy_table() -> Vec<PolicyEntry> {
        Self::ALL
            .iter()
            .map(|&priority| PolicyEntry {
                priority,
                strategy: priority.strategy(),
            })
            .collect()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Bucket {
    /// Label used in runner thread names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Bucket::Core => "core",
            Bucket::Monitor => "monitor",
        }
    }
}

impl Strategy {
    /// Whether a tier with this strategy is polled on pass `pass`.
    ///
    /// `after_idle` is true when the previous pass made no progress; such
    /// passes service every tier.
    #[must_use]
    pub const fn due(self, pass: u64, after_idle: bool) -> bool {
        match self {
            Strategy::Shared { interval, .. } => after_idle || pass % interval as u64 == 0,
            Strategy::Dedicated => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
