//! State shared between the coordinator and its runner threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, Thread};

use dashmap::DashMap;

use crate::admission::AdmissionQueue;
use crate::config::GroupConfig;
use crate::exception::ExceptionSink;
use crate::handler::{HandlerId, HandlerSlot};
use crate::lifecycle::{LifecycleState, StateCell, StopSignal};
use crate::monitor::Heartbeat;
use crate::priority::{Bucket, Strategy};

/// Identifies a live runner thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum RunnerKey {
    Cooperative(Bucket),
    Dedicated(HandlerId),
}

/// Everything a runner thread needs.  Runners hold this, never the
/// coordinator, so dropping the last `EventGroup` handle can close the group.
pub(crate) struct GroupShared {
    pub(crate) config: GroupConfig,
    pub(crate) state: Arc<StateCell>,
    pub(crate) sink: Arc<dyn ExceptionSink>,
    pub(crate) heartbeat: Arc<Heartbeat>,
    core_queue: AdmissionQueue,
    monitor_queue: AdmissionQueue,
    dedicated_queue: AdmissionQueue,
    /// Live runner threads, so a stop can unpark every one of them.
    threads: DashMap<RunnerKey, Thread>,
    spawned: AtomicUsize,
}

impl GroupShared {
    pub(crate) fn new(config: GroupConfig, sink: Arc<dyn ExceptionSink>) -> Self {
        Self {
            config,
            state: Arc::new(StateCell::new()),
            sink,
            heartbeat: Arc::new(Heartbeat::new()),
            core_queue: AdmissionQueue::new(),
            monitor_queue: AdmissionQueue::new(),
            dedicated_queue: AdmissionQueue::new(),
            threads: DashMap::new(),
            spawned: AtomicUsize::new(0),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn stop_signal(&self) -> StopSignal {
        StopSignal::new(Arc::clone(&self.state))
    }

    // -- Queues -------------------------------------------------------------

    pub(crate) fn bucket_queue(&self, bucket: Bucket) -> &AdmissionQueue {
        match bucket {
            Bucket::Core => &self.core_queue,
            Bucket::Monitor => &self.monitor_queue,
        }
    }

    pub(crate) fn dedicated_queue(&self) -> &AdmissionQueue {
        &self.dedicated_queue
    }

    /// Stage a handler on the queue matching its strategy.
    pub(crate) fn enqueue(&self, slot: HandlerSlot) {
        match slot.strategy() {
            Strategy::Shared { bucket, .. } => self.bucket_queue(bucket).push(slot),
            Strategy::Dedicated => self.dedicated_queue.push(slot),
        }
    }

    pub(crate) fn queued(&self) -> usize {
        self.core_queue.len() + self.monitor_queue.len() + self.dedicated_queue.len()
    }

    /// Tear down every handler still waiting in any queue.
    pub(crate) fn teardown_queued(&self) -> usize {
        let sink = self.sink.as_ref();
        self.core_queue.teardown_all(sink)
            + self.monitor_queue.teardown_all(sink)
            + self.dedicated_queue.teardown_all(sink)
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Move the group to `Stopping` and wake every runner thread.
    ///
    /// Returns `false` if the group was already stopping or later.
    pub(crate) fn request_stop(&self, reason: &str) -> bool {
        let previous = self.state.advance(LifecycleState::Stopping);
        if previous >= LifecycleState::Stopping {
            return false;
        }
        tracing::info!(group = %self.config.name, %previous, reason, "event group stopping");
        for entry in self.threads.iter() {
            entry.value().unpark();
        }
        true
    }

    // -- Thread registry ----------------------------------------------------

    pub(crate) fn record_spawn(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn spawned_threads(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    pub(crate) fn live_threads(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn runner_thread(&self, key: RunnerKey) -> Option<Thread> {
        self.threads.get(&key).map(|entry| entry.value().clone())
    }

    pub(crate) fn is_runner_thread(&self, id: thread::ThreadId) -> bool {
        self.threads.iter().any(|entry| entry.value().id() == id)
    }
}

/// Registers the current thread as a live runner for as long as it is held.
pub(crate) struct RunnerRegistration<'a> {
    shared: &'a GroupShared,
    key: RunnerKey,
}

impl<'a> RunnerRegistration<'a> {
    /// Must be entered before the runner first checks the group state, so a
    /// concurrent stop either sees this thread or is seen by it.
    pub(crate) fn enter(shared: &'a GroupShared, key: RunnerKey) -> Self {
        shared.threads.insert(key, thread::current());
        Self { shared, key }
    }
}

impl Drop for RunnerRegistration<'_> {
    fn drop(&mut self) {
        self.shared.threads.remove(&self.key);
    }
}
