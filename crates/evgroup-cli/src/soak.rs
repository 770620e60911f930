//! `evgroup soak`: drive a group with synthetic handlers and report how
//! often each tier was polled.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use evgroup_kernel::{
    Activity, EventGroup, EventHandler, GroupConfig, PollResult, Priority, RecordingExceptionSink,
    StopSignal,
};
use serde::Serialize;
use tracing::info;

/// Shared tiers exercised by the soak, highest first.
const SOAK_TIERS: [Priority; 5] = [
    Priority::High,
    Priority::Medium,
    Priority::Timer,
    Priority::Daemon,
    Priority::Monitor,
];

/// Pretends to find work on one poll in `WORK_EVERY`.
const WORK_EVERY: u64 = 8;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TierReport {
    pub priority: Priority,
    pub handlers: usize,
    pub polls: u64,
}

#[derive(Debug, Serialize)]
pub struct SoakReport {
    pub group: String,
    pub elapsed_ms: u64,
    pub tiers: Vec<TierReport>,
    pub blocking_wakeups: u64,
    pub runner_threads: usize,
    pub failures: usize,
}

impl SoakReport {
    pub fn print(&self) {
        println!();
        println!("  Soak of `{}` ran for {} ms", self.group, self.elapsed_ms);
        println!("  {:<10} {:>8} {:>12}", "TIER", "HANDLERS", "POLLS");
        for tier in &self.tiers {
            println!(
                "  {:<10} {:>8} {:>12}",
                tier.priority.as_str(),
                tier.handlers,
                tier.polls
            );
        }
        println!("  blocking wakeups: {}", self.blocking_wakeups);
        println!("  runner threads:   {}", self.runner_threads);
        println!("  failures:         {}", self.failures);
        println!();
    }
}

// ---------------------------------------------------------------------------
// Synthetic handlers
// ---------------------------------------------------------------------------

struct Counting {
    name: String,
    priority: Priority,
    polls: Arc<AtomicU64>,
    own_polls: u64,
}

impl EventHandler for Counting {
    fn poll(&mut self) -> PollResult {
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.own_polls += 1;
        Ok((self.own_polls % WORK_EVERY == 0).into())
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Parks between polls; only a stop (or the timeout) wakes it.
struct Sleeper {
    stop: Option<StopSignal>,
    wakeups: Arc<AtomicU64>,
}

impl EventHandler for Sleeper {
    fn poll(&mut self) -> PollResult {
        if self.stop.as_ref().is_some_and(StopSignal::is_stopping) {
            return Ok(Activity::Idle);
        }
        std::thread::park_timeout(Duration::from_millis(250));
        self.wakeups.fetch_add(1, Ordering::Relaxed);
        Ok(Activity::Progress)
    }

    fn priority(&self) -> Priority {
        Priority::Blocking
    }

    fn name(&self) -> String {
        "sleeper".to_string()
    }

    fn loop_started(&mut self, stop: &StopSignal) {
        self.stop = Some(stop.clone());
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub fn load_config(path: Option<&Path>) -> Result<GroupConfig> {
    match path {
        Some(path) => GroupConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(GroupConfig::new().with_name("soak")),
    }
}

pub async fn run(
    config: GroupConfig,
    duration: Duration,
    handlers_per_tier: usize,
) -> Result<SoakReport> {
    let sink = RecordingExceptionSink::new();
    let group = EventGroup::with_sink(config, Arc::new(sink.clone()))
        .context("failed to create event group")?;

    let mut counters = Vec::with_capacity(SOAK_TIERS.len());
    for priority in SOAK_TIERS {
        let polls = Arc::new(AtomicU64::new(0));
        for i in 0..handlers_per_tier {
            group.register(Counting {
                name: format!("{priority}-{i}"),
                priority,
                polls: Arc::clone(&polls),
                own_polls: 0,
            })?;
        }
        counters.push((priority, polls));
    }
    let wakeups = Arc::new(AtomicU64::new(0));
    group.register(Sleeper {
        stop: None,
        wakeups: Arc::clone(&wakeups),
    })?;

    info!(
        group = %group.name(),
        handlers_per_tier,
        duration_ms = duration.as_millis() as u64,
        "soak starting"
    );
    let started = Instant::now();
    group.start()?;
    tokio::time::sleep(duration).await;

    let closer = group.clone();
    tokio::task::spawn_blocking(move || closer.close())
        .await
        .context("close task panicked")?;
    group.terminated().await;
    let elapsed = started.elapsed();

    if !sink.is_empty() {
        tracing::warn!(failures = sink.len(), "handlers reported failures during soak");
        if let Ok(dump) = sink.dump_json() {
            tracing::debug!(%dump, "recorded failures");
        }
    }

    Ok(SoakReport {
        group: group.name().to_string(),
        elapsed_ms: elapsed.as_millis() as u64,
        tiers: counters
            .into_iter()
            .map(|(priority, polls)| TierReport {
                priority,
                handlers: handlers_per_tier,
                polls: polls.load(Ordering::Relaxed),
            })
            .collect(),
        blocking_wakeups: wakeups.load(Ordering::Relaxed),
        runner_threads: group.spawned_runner_threads(),
        failures: sink.len(),
    })
}
