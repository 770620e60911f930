//! Idle backoff between runner passes.

use std::thread;
use std::time::Duration;

use crate::config::GroupConfig;

/// Bounded backoff: yield for a while, then park with a timeout that doubles
/// from `min` up to `max`.
///
/// Parking (rather than sleeping) lets the coordinator cut a pause short with
/// [`Thread::unpark`](std::thread::Thread::unpark) when new handlers arrive or
/// the group stops.
#[derive(Debug, Clone)]
pub(crate) struct BackoffPauser {
    spin_passes: u32,
    min: Duration,
    max: Duration,
    idle_passes: u32,
    current: Duration,
}

impl BackoffPauser {
    pub(crate) fn new(spin_passes: u32, min: Duration, max: Duration) -> Self {
        Self {
            spin_passes,
            min,
            max,
            idle_passes: 0,
            current: min,
        }
    }

    pub(crate) fn from_config(config: &GroupConfig) -> Self {
        Self::new(config.spin_passes, config.min_pause(), config.max_pause())
    }

    /// Forget accumulated idleness.
    pub(crate) fn reset(&mut self) {
        self.idle_passes = 0;
        self.current = self.min;
    }

    /// Register one idle pass and wait accordingly.
    pub(crate) fn pause(&mut self) {
        match self.next_pause() {
            None => thread::yield_now(),
            Some(timeout) => thread::park_timeout(timeout),
        }
    }

    /// Advance the backoff and return how long the next pause parks, or
    /// `None` for a yield.
    fn next_pause(&mut self) -> Option<Duration> {
        if self.idle_passes < self.spin_passes {
            self.idle_passes += 1;
            return None;
        }
        let timeout = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(timeout)
    }
}

/// How a cooperative runner waits between passes.
#[derive(Debug, Clone)]
pub(crate) enum Pacer {
    /// Back off only while idle; progress resets the backoff.
    Backoff(BackoffPauser),
    /// Park for a fixed interval after every pass.
    Fixed(Duration),
}

impl Pacer {
    pub(crate) fn after_pass(&mut self, progressed: bool) {
        match self {
            Pacer::Backoff(pauser) if progressed => pauser.reset(),
            Pacer::Backoff(pauser) => pauser.pause(),
            Pacer::Fixed(interval) => thread::park_timeout(*interval),
        }
    }
}
