//! Dedicated runner: one private thread per handler.
//!
//! Used for the `Replication`, `Concurrent` and `Blocking` tiers.  A
//! `Blocking` handler may park inside `poll`; the group unparks every runner
//! thread when it stops, so a handler parked with [`std::thread::park`]
//! wakes up and returns.  A handler that blocks on something else and never
//! returns holds up `close` indefinitely.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel;

use crate::error::{KernelError, Result};
use crate::handler::{HandlerSlot, PollOutcome};
use crate::pauser::BackoffPauser;
use crate::shared::{GroupShared, RunnerKey, RunnerRegistration};

pub(crate) struct DedicatedRunner {
    slot: HandlerSlot,
    shared: Arc<GroupShared>,
}

impl DedicatedRunner {
    pub(crate) fn new(slot: HandlerSlot, shared: Arc<GroupShared>) -> Self {
        Self { slot, shared }
    }

    /// Spawn a named thread that runs `slot` until it deregisters or the
    /// group stops.
    ///
    /// The slot is handed over only after the thread exists, so if the spawn
    /// fails the handler is still torn down here.
    pub(crate) fn spawn(slot: HandlerSlot, shared: &Arc<GroupShared>) -> Result<JoinHandle<()>> {
        let thread_name = format!(
            "{}/{}/{}",
            shared.name(),
            slot.priority(),
            slot.source().name
        );
        let (tx, rx) = channel::bounded::<HandlerSlot>(1);
        let runner_shared = Arc::clone(shared);

        let spawned = thread::Builder::new().name(thread_name.clone()).spawn(move || {
            if let Ok(slot) = rx.recv() {
                DedicatedRunner::new(slot, runner_shared).run();
            }
        });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                tracing::error!(runner = %thread_name, error = %source, "failed to spawn dedicated runner");
                slot.teardown(shared.sink.as_ref());
                return Err(KernelError::RunnerSpawn {
                    runner: thread_name,
                    source,
                });
            }
        };
        shared.record_spawn();

        if let Err(channel::SendError(slot)) = tx.send(slot) {
            // The thread died before receiving; nothing else can own the slot.
            slot.teardown(shared.sink.as_ref());
        }
        Ok(handle)
    }

    /// Thread body.
    pub(crate) fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let sink = shared.sink.as_ref();
        let _registration = RunnerRegistration::enter(&shared, RunnerKey::Dedicated(self.slot.id()));
        tracing::info!(
            group = %shared.name(),
            handler_id = %self.slot.id(),
            handler = %self.slot.source().name,
            priority = %self.slot.priority(),
            "dedicated runner started"
        );

        self.slot.activate(&shared.stop_signal(), sink);
        let mut pauser = BackoffPauser::from_config(&shared.config);
        let mut polls: u64 = 0;

        while shared.state.is_running() {
            polls += 1;
            match self.slot.poll() {
                PollOutcome::Progress => pauser.reset(),
                PollOutcome::Idle => pauser.pause(),
                PollOutcome::Failed(failure) => {
                    sink.record(self.slot.source(), failure);
                    pauser.pause();
                }
                PollOutcome::Deregister => {
                    tracing::debug!(handler_id = %self.slot.id(), "handler deregistered");
                    break;
                }
                PollOutcome::Panicked(failure) => {
                    sink.record(self.slot.source(), failure);
                    break;
                }
                PollOutcome::Shutdown => {
                    tracing::info!(handler_id = %self.slot.id(), "handler requested shutdown");
                    shared.request_stop("handler requested shutdown");
                    break;
                }
            }
        }

        let id = self.slot.id();
        self.slot.teardown(sink);
        tracing::info!(group = %shared.name(), handler_id = %id, polls, "dedicated runner stopped");
    }
}
