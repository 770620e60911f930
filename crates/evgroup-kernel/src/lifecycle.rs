//! Group lifecycle state.
//!
//! ```text
//! New  -->  Running  -->  Stopping  -->  Terminated
//!   \__________________________________/^
//! ```
//!
//! Transitions only ever move right.  A group closed before it was started
//! goes straight from `New` to `Terminated`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle state of an [`EventGroup`](crate::group::EventGroup).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Created; handlers may be registered but nothing runs.
    New = 0,
    /// Runners are polling handlers.
    Running = 1,
    /// Runners have been told to stop and are tearing down.
    Stopping = 2,
    /// Every runner has exited and every handler has been released.
    Terminated = 3,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::New,
            1 => LifecycleState::Running,
            2 => LifecycleState::Stopping,
            _ => LifecycleState::Terminated,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::New => "new",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Atomic, forward-only holder of a [`LifecycleState`].
#[derive(Debug)]
pub(crate) struct StateCell {
    raw: AtomicU8,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            raw: AtomicU8::new(LifecycleState::New as u8),
        }
    }

    pub(crate) fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.raw.load(Ordering::Acquire))
    }

    /// Move to `target` if it is strictly later than the current state.
    ///
    /// Returns the state observed before the call, so exactly one caller sees
    /// `previous < target` for any given transition.
    pub(crate) fn advance(&self, target: LifecycleState) -> LifecycleState {
        let target = target as u8;
        let previous = self.raw.fetch_max(target, Ordering::AcqRel);
        LifecycleState::from_u8(previous)
    }

    /// Move `from` to `to` only if the current state is exactly `from`.
    pub(crate) fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.raw
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.get() == LifecycleState::Running
    }
}

/// Read-only view of the group state handed to handlers in
/// [`EventHandler::loop_started`](crate::handler::EventHandler::loop_started).
///
/// Blocking handlers should check [`StopSignal::is_stopping`] whenever they
/// wake from a park; the group unparks every runner thread when it stops.
#[derive(Debug, Clone)]
pub struct StopSignal {
    state: Arc<StateCell>,
}

impl StopSignal {
    pub(crate) fn new(state: Arc<StateCell>) -> Self {
        Self { state }
    }

    /// True once the group has left the `Running` state.
    pub fn is_stopping(&self) -> bool {
        self.state.get() >= LifecycleState::Stopping
    }

    /// Current state of the owning group.
    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }
}
