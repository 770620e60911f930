//! Loop block monitor.
//!
//! The core runner stamps the start of every pass into a [`Heartbeat`].  The
//! [`BlockMonitor`] handler runs on the separate monitor runner and warns
//! when the current pass has been running longer than the configured
//! threshold, which almost always means a shared-tier handler is blocking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::handler::{Activity, EventHandler, PollResult};
use crate::priority::Priority;

/// Pass timing published by the core runner.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    epoch: Instant,
    /// Nanoseconds since `epoch` at which the current pass began, plus one.
    /// Zero while the runner is between passes.
    pass_started: AtomicU64,
    passes: AtomicU64,
}

impl Heartbeat {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            pass_started: AtomicU64::new(0),
            passes: AtomicU64::new(0),
        }
    }

    pub(crate) fn begin_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        let now = self.epoch.elapsed().as_nanos() as u64;
        self.pass_started.store(now + 1, Ordering::Release);
    }

    pub(crate) fn end_pass(&self) {
        self.pass_started.store(0, Ordering::Release);
    }

    /// Number of core passes begun so far.
    pub(crate) fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// The current pass number and how long it has been running, if the
    /// core runner is inside a pass.
    pub(crate) fn current_pass(&self) -> Option<(u64, Duration)> {
        let started = self.pass_started.load(Ordering::Acquire);
        if started == 0 {
            return None;
        }
        let now = self.epoch.elapsed().as_nanos() as u64;
        let busy = Duration::from_nanos(now.saturating_sub(started - 1));
        Some((self.passes(), busy))
    }
}

/// Monitor-tier handler that reports blocked core passes.
pub(crate) struct BlockMonitor {
    group: String,
    heartbeat: Arc<Heartbeat>,
    threshold: Duration,
    last_reported: Option<u64>,
    reports: Arc<AtomicU64>,
}

impl BlockMonitor {
    pub(crate) fn new(
        group: impl Into<String>,
        heartbeat: Arc<Heartbeat>,
        threshold: Duration,
        reports: Arc<AtomicU64>,
    ) -> Self {
        Self {
            group: group.into(),
            heartbeat,
            threshold,
            last_reported: None,
            reports,
        }
    }
}

impl EventHandler for BlockMonitor {
    fn poll(&mut self) -> PollResult {
        let Some((pass, busy)) = self.heartbeat.current_pass() else {
            return Ok(Activity::Idle);
        };
        if busy < self.threshold || self.last_reported == Some(pass) {
            return Ok(Activity::Idle);
        }
        self.last_reported = Some(pass);
        self.reports.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            group = %self.group,
            pass,
            blocked_ms = busy.as_millis() as u64,
            threshold_ms = self.threshold.as_millis() as u64,
            "core runner pass is blocked"
        );
        Ok(Activity::Progress)
    }

    fn priority(&self) -> Priority {
        Priority::Monitor
    }

    fn name(&self) -> String {
        "loop-block-monitor".to_string()
    }
}
