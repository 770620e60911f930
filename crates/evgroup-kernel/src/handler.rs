//! Event handlers and the scheduler-side slot that owns them.
//!
//! An [`EventHandler`] is a small unit of recurring work.  The group polls it
//! over and over; each poll reports whether it did anything useful
//! ([`Activity`]) or asks for a change in how it is treated
//! ([`HandlerSignal`]).
//!
//! # Handler lifecycle
//!
//! ```text
//! Pending  -->  Active  -->  Finished  -->  Released
//!     \____________________/^
//! ```
//!
//! `Pending` handlers sit in an admission queue.  A runner makes them
//! `Active` (calling [`EventHandler::loop_started`]) and polls them until
//! they deregister or the group stops.  Teardown always calls
//! [`EventHandler::loop_finished`] and then [`EventHandler::release`],
//! exactly once each.  A handler that never reached a runner skips `Active`.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::exception::{ExceptionSink, HandlerFailure};
use crate::lifecycle::StopSignal;
use crate::priority::{Priority, Strategy};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Unique, time-ordered handler identifier (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(Uuid);

impl HandlerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a registered handler, as reported to exception sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSource {
    pub id: HandlerId,
    pub name: String,
    pub priority: Priority,
}

/// What a successful poll achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Work was done; the runner goes straight into its next pass.
    Progress,
    /// Nothing to do; the runner may back off before polling again.
    Idle,
}

impl From<bool> for Activity {
    fn from(busy: bool) -> Self {
        if busy {
            Activity::Progress
        } else {
            Activity::Idle
        }
    }
}

/// A request from the handler that is not ordinary activity.
#[derive(Debug)]
pub enum HandlerSignal {
    /// Stop polling this handler and tear it down.  Not an error.
    Deregister,
    /// Stop the whole group.
    Shutdown,
    /// The poll failed.  The failure is recorded and the handler stays
    /// registered.
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for HandlerSignal {
    fn from(err: anyhow::Error) -> Self {
        HandlerSignal::Failed(err)
    }
}

/// Result of one [`EventHandler::poll`] call.
///
/// Handlers can use `?` on `anyhow` results; the error becomes
/// [`HandlerSignal::Failed`].
pub type PollResult = std::result::Result<Activity, HandlerSignal>;

/// A unit of recurring work scheduled by an [`EventGroup`](crate::group::EventGroup).
pub trait EventHandler: Send {
    /// Do a bounded amount of work.
    ///
    /// Only handlers with [`Priority::Blocking`] may block inside `poll`;
    /// everything else shares a thread with other handlers.
    fn poll(&mut self) -> PollResult;

    /// Declared priority.  Read once, at registration.
    fn priority(&self) -> Priority {
        Priority::Medium
    }

    /// Name used in logs, thread names and exception records.
    fn name(&self) -> String {
        short_type_name(std::any::type_name::<Self>()).to_string()
    }

    /// Called on the runner thread before the first poll.
    fn loop_started(&mut self, _stop: &StopSignal) {}

    /// Called exactly once when the handler stops being polled.
    fn loop_finished(&mut self) {}

    /// Called exactly once, after [`loop_finished`](Self::loop_finished), to
    /// free whatever the handler holds.
    fn release(&mut self) {}
}

fn short_type_name(full: &str) -> &str {
    // Keep generics intact: only strip the module path before the first `<`.
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(pos) => &full[pos + 2..],
        None => full,
    }
}

// ---------------------------------------------------------------------------
// Closure handlers
// ---------------------------------------------------------------------------

/// An [`EventHandler`] built from a closure.  See [`from_fn`].
pub struct FnHandler<F> {
    name: String,
    priority: Priority,
    poll: F,
}

/// Wrap a closure as a handler with the given priority.
///
/// ```rust
/// # use evgroup_kernel::handler::{from_fn, Activity, HandlerSignal};
/// # use evgroup_kernel::Priority;
/// let mut remaining = 3;
/// let handler = from_fn("countdown", Priority::High, move || {
///     if remaining == 0 {
///         return Err(HandlerSignal::Deregister);
///     }
///     remaining -= 1;
///     Ok(Activity::Progress)
/// });
/// # let _ = handler;
/// ```
pub fn from_fn<F>(name: impl Into<String>, priority: Priority, poll: F) -> FnHandler<F>
where
    F: FnMut() -> PollResult + Send,
{
    FnHandler {
        name: name.into(),
        priority,
        poll,
    }
}

impl<F> EventHandler for FnHandler<F>
where
    F: FnMut() -> PollResult + Send,
{
    fn poll(&mut self) -> PollResult {
        (self.poll)()
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

// ---------------------------------------------------------------------------
// Handler slot
// ---------------------------------------------------------------------------

/// Scheduler-side lifecycle state of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SlotState {
    Pending,
    Active,
    Finished,
    Released,
}

/// Outcome of polling a slot, with panics folded in.
#[derive(Debug)]
pub(crate) enum PollOutcome {
    Progress,
    Idle,
    Deregister,
    Shutdown,
    Failed(HandlerFailure),
    /// The handler panicked; the runner must record and tear it down.
    Panicked(HandlerFailure),
}

/// Owns one registered handler and enforces its state machine.
pub(crate) struct HandlerSlot {
    source: HandlerSource,
    strategy: Strategy,
    state: SlotState,
    handler: Box<dyn EventHandler>,
}

impl HandlerSlot {
    /// Wrap a freshly registered handler, resolving its priority once.
    pub(crate) fn new(handler: Box<dyn EventHandler>) -> Self {
        let priority = handler.priority();
        let source = HandlerSource {
            id: HandlerId::new(),
            name: handler.name(),
            priority,
        };
        Self {
            source,
            strategy: priority.strategy(),
            state: SlotState::Pending,
            handler,
        }
    }

    pub(crate) fn source(&self) -> &HandlerSource {
        &self.source
    }

    pub(crate) fn id(&self) -> HandlerId {
        self.source.id
    }

    pub(crate) fn priority(&self) -> Priority {
        self.source.priority
    }

    pub(crate) fn strategy(&self) -> Strategy {
        self.strategy
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SlotState {
        self.state
    }

    /// Pending -> Active.  Runs `loop_started` on the calling runner thread.
    pub(crate) fn activate(&mut self, stop: &StopSignal, sink: &dyn ExceptionSink) {
        debug_assert_eq!(self.state, SlotState::Pending);
        self.state = SlotState::Active;
        let handler = &mut self.handler;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.loop_started(stop))) {
            sink.record(
                &self.source,
                HandlerFailure::from_hook_panic("loop_started", payload),
            );
        }
        tracing::debug!(
            handler_id = %self.source.id,
            handler = %self.source.name,
            priority = %self.source.priority,
            "handler active"
        );
    }

    /// Poll once.  Must only be called while `Active`.
    pub(crate) fn poll(&mut self) -> PollOutcome {
        debug_assert_eq!(self.state, SlotState::Active);
        let handler = &mut self.handler;
        match catch_unwind(AssertUnwindSafe(|| handler.poll())) {
            Ok(Ok(Activity::Progress)) => PollOutcome::Progress,
            Ok(Ok(Activity::Idle)) => PollOutcome::Idle,
            Ok(Err(HandlerSignal::Deregister)) => PollOutcome::Deregister,
            Ok(Err(HandlerSignal::Shutdown)) => PollOutcome::Shutdown,
            Ok(Err(HandlerSignal::Failed(err))) => PollOutcome::Failed(HandlerFailure::Error(err)),
            Err(payload) => PollOutcome::Panicked(HandlerFailure::from_panic(payload)),
        }
    }

    /// Two-step teardown: `loop_finished`, then `release`.
    ///
    /// Consumes the slot, so a handler cannot be torn down twice.
    pub(crate) fn teardown(mut self, sink: &dyn ExceptionSink) {
        for failure in self.finish_and_release() {
            sink.record(&self.source, failure);
        }
    }

    fn finish_and_release(&mut self) -> Vec<HandlerFailure> {
        let mut failures = Vec::new();
        if self.state < SlotState::Finished {
            self.state = SlotState::Finished;
            let handler = &mut self.handler;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.loop_finished())) {
                failures.push(HandlerFailure::from_hook_panic("loop_finished", payload));
            }
        }
        if self.state < SlotState::Released {
            self.state = SlotState::Released;
            let handler = &mut self.handler;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.release())) {
                failures.push(HandlerFailure::from_hook_panic("release", payload));
            }
            tracing::debug!(
                handler_id = %self.source.id,
                handler = %self.source.name,
                "handler released"
            );
        }
        failures
    }
}

impl Drop for HandlerSlot {
    fn drop(&mut self) {
        if self.state == SlotState::Released {
            return;
        }
        tracing::warn!(
            handler_id = %self.source.id,
            handler = %self.source.name,
            "handler slot dropped before teardown; releasing now"
        );
        for failure in self.finish_and_release() {
            tracing::warn!(handler_id = %self.source.id, error = %failure, "teardown hook failed");
        }
    }
}

impl fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSlot")
            .field("source", &self.source)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
