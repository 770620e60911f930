//! Lifecycle coordinator.
//!
//! [`EventGroup`] owns the lifecycle state, the admission queues and every
//! runner thread.  Nothing runs until [`EventGroup::start`]; runners are then
//! created lazily, one cooperative thread per bucket that has handlers and
//! one dedicated thread per dedicated-tier handler.
//!
//! # Shutdown handshake
//!
//! 1. [`stop`](EventGroup::stop) moves the group to `Stopping` and unparks
//!    every runner.  Runners notice at the top of their next pass (or when
//!    the current dedicated poll returns) and tear down their handlers.
//! 2. [`close`](EventGroup::close) stops, joins every runner, tears down
//!    whatever is still queued, then moves to `Terminated` and wakes every
//!    [`await_termination`](EventGroup::await_termination) caller.
//!
//! A group closed before it was started never spawns a thread; its handlers
//! are torn down without ever being polled.
//!
//! # Example
//!
//! ```rust
//! use evgroup_kernel::{handler::from_fn, Activity, EventGroup, GroupConfig, Priority};
//!
//! let group = EventGroup::new(GroupConfig::new().with_name("doc")).unwrap();
//! group
//!     .register(from_fn("tick", Priority::High, || Ok(Activity::Idle)))
//!     .unwrap();
//! group.start().unwrap();
//! group.close();
//! group.await_termination();
//! assert_eq!(group.live_runner_threads(), 0);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel;
use tokio::sync::watch;

use crate::admission::AdmissionQueue;
use crate::config::GroupConfig;
use crate::cooperative::CooperativeRunner;
use crate::dedicated::DedicatedRunner;
use crate::error::{KernelError, Result};
use crate::exception::{ExceptionSink, TracingExceptionSink};
use crate::handler::{EventHandler, HandlerId, HandlerSlot};
use crate::lifecycle::LifecycleState;
use crate::monitor::BlockMonitor;
use crate::priority::Bucket;
use crate::shared::{GroupShared, RunnerKey};

// ---------------------------------------------------------------------------
// Internal types
// ---------------------------------------------------------------------------

/// Join handles of every runner spawned so far.
#[derive(Default)]
struct Runners {
    core: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    dedicated: Vec<JoinHandle<()>>,
}

impl Runners {
    fn cooperative(&mut self, bucket: Bucket) -> &mut Option<JoinHandle<()>> {
        match bucket {
            Bucket::Core => &mut self.core,
            Bucket::Monitor => &mut self.monitor,
        }
    }

    fn take_all(&mut self) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<_> = self.core.take().into_iter().collect();
        handles.extend(self.monitor.take());
        handles.append(&mut self.dedicated);
        handles
    }

    /// Join dedicated runners whose handler has already deregistered.
    fn reap_finished(&mut self) {
        let (finished, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.dedicated)
            .into_iter()
            .partition(JoinHandle::is_finished);
        self.dedicated = live;
        for handle in finished {
            if handle.join().is_err() {
                tracing::error!("dedicated runner thread panicked");
            }
        }
    }
}

/// Wakes blocking and async waiters once the group is terminated.
struct Termination {
    done: Mutex<bool>,
    cond: Condvar,
    tx: watch::Sender<bool>,
}

impl Termination {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self) {
        let mut done = self.lock();
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn signal(&self) {
        *self.lock() = true;
        self.cond.notify_all();
        self.tx.send_replace(true);
    }
}

struct GroupInner {
    shared: Arc<GroupShared>,
    runners: Mutex<Runners>,
    closing: AtomicBool,
    termination: Arc<Termination>,
    block_reports: Option<Arc<AtomicU64>>,
}

// ---------------------------------------------------------------------------
// EventGroup
// ---------------------------------------------------------------------------

/// A scheduler for [`EventHandler`]s, grouped by [`Priority`](crate::Priority).
///
/// Cheaply cloneable (`Arc`-backed); every method takes `&self` and may be
/// called from any thread.  Dropping the last handle closes the group.
#[derive(Clone)]
pub struct EventGroup {
    inner: Arc<GroupInner>,
}

impl EventGroup {
    /// Create a group that logs handler failures through `tracing`.
    pub fn new(config: GroupConfig) -> Result<Self> {
        Self::with_sink(config, Arc::new(TracingExceptionSink))
    }

    /// Create a group that reports handler failures to `sink`.
    pub fn with_sink(config: GroupConfig, sink: Arc<dyn ExceptionSink>) -> Result<Self> {
        config.validate()?;
        let threshold = config.block_threshold();
        let shared = Arc::new(GroupShared::new(config, sink));

        let block_reports = threshold.map(|threshold| {
            let reports = Arc::new(AtomicU64::new(0));
            let monitor = BlockMonitor::new(
                shared.name(),
                Arc::clone(&shared.heartbeat),
                threshold,
                Arc::clone(&reports),
            );
            shared.enqueue(HandlerSlot::new(Box::new(monitor)));
            reports
        });

        tracing::debug!(group = %shared.name(), "event group created");
        Ok(Self {
            inner: Arc::new(GroupInner {
                shared,
                runners: Mutex::new(Runners::default()),
                closing: AtomicBool::new(false),
                termination: Arc::new(Termination::new()),
                block_reports,
            }),
        })
    }

    // -- Registration -------------------------------------------------------

    /// Register a handler.  See [`register_boxed`](Self::register_boxed).
    pub fn register<H: EventHandler + 'static>(&self, handler: H) -> Result<HandlerId> {
        self.register_boxed(Box::new(handler))
    }

    /// Register a handler from any thread.
    ///
    /// Before [`start`](Self::start) the handler is only queued.  While
    /// running it is handed to its runner straight away, spawning the runner
    /// if needed.  Once the group is stopping the handler is torn down
    /// immediately and [`KernelError::GroupClosed`] is returned.
    pub fn register_boxed(&self, handler: Box<dyn EventHandler>) -> Result<HandlerId> {
        let shared = &self.inner.shared;
        let slot = HandlerSlot::new(handler);
        let id = slot.id();

        if shared.state.get() >= LifecycleState::Stopping {
            tracing::debug!(group = %shared.name(), handler_id = %id, "rejecting handler, group closed");
            slot.teardown(shared.sink.as_ref());
            return Err(self.closed_error());
        }

        tracing::debug!(
            group = %shared.name(),
            handler_id = %id,
            handler = %slot.source().name,
            priority = %slot.priority(),
            "handler registered"
        );
        shared.enqueue(slot);

        match shared.state.get() {
            LifecycleState::New => {}
            LifecycleState::Running => self.dispatch()?,
            // Lost a race with close: nobody else may drain this queue again.
            LifecycleState::Stopping | LifecycleState::Terminated => {
                if self.inner.closing.load(Ordering::Acquire) {
                    shared.teardown_queued();
                }
            }
        }
        Ok(id)
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Start polling.  Idempotent; a no-op once the group is running or
    /// later.
    pub fn start(&self) -> Result<()> {
        let shared = &self.inner.shared;
        if !shared
            .state
            .transition(LifecycleState::New, LifecycleState::Running)
        {
            return Ok(());
        }
        tracing::info!(group = %shared.name(), queued = shared.queued(), "event group started");
        self.dispatch()
    }

    /// Ask every runner to stop.  Idempotent; does not wait.
    pub fn stop(&self) {
        self.inner.shared.request_stop("stop requested");
    }

    /// Stop, join every runner and tear down every handler.  Idempotent;
    /// concurrent callers wait for the first one to finish.
    ///
    /// When this returns, every handler ever registered has been finished
    /// and released exactly once.  Called from a runner thread (for example
    /// by a handler), `close` only stops the group and returns; a helper
    /// thread joins every runner, the caller's included, and moves the group
    /// to `Terminated` afterwards, so waiters still see a fully torn-down
    /// group.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Block until the group is terminated.  Returns immediately if it
    /// already is.
    pub fn await_termination(&self) {
        self.inner.termination.wait();
    }

    /// Block until the group is terminated or `timeout` elapses.  Returns
    /// whether the group is terminated.
    pub fn await_termination_timeout(&self, timeout: Duration) -> bool {
        let termination = &self.inner.termination;
        let guard = termination.lock();
        let (done, _) = termination
            .cond
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *done
    }

    /// Resolve once the group is terminated.
    pub async fn terminated(&self) {
        let mut rx = self.inner.termination.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|done| *done).await;
    }

    // -- Introspection ------------------------------------------------------

    /// The configured group name, used as the runner thread-name prefix.
    pub fn name(&self) -> &str {
        self.inner.shared.name()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.inner.shared.state.get()
    }

    /// True while runners are polling.
    pub fn is_alive(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// True once the group has begun stopping.
    pub fn is_closed(&self) -> bool {
        self.state() >= LifecycleState::Stopping
    }

    /// Cut the core runner's idle pause short.
    pub fn wake(&self) {
        if let Some(thread) = self
            .inner
            .shared
            .runner_thread(RunnerKey::Cooperative(Bucket::Core))
        {
            thread.unpark();
        }
    }

    /// Runner threads currently alive.
    pub fn live_runner_threads(&self) -> usize {
        self.inner.shared.live_threads()
    }

    /// Runner threads spawned over the group's lifetime.
    pub fn spawned_runner_threads(&self) -> usize {
        self.inner.shared.spawned_threads()
    }

    /// Handlers registered but not yet picked up by a runner.
    pub fn queued_handlers(&self) -> usize {
        self.inner.shared.queued()
    }

    /// Number of blocked core passes reported by the loop block monitor, or
    /// `None` if the monitor is disabled.
    pub fn blocked_pass_reports(&self) -> Option<u64> {
        self.inner
            .block_reports
            .as_ref()
            .map(|reports| reports.load(Ordering::Relaxed))
    }

    // -- Private helpers ----------------------------------------------------

    fn closed_error(&self) -> KernelError {
        KernelError::GroupClosed {
            group: self.name().to_string(),
        }
    }

    /// Hand queued handlers to their runners, spawning runners as needed.
    fn dispatch(&self) -> Result<()> {
        let shared = &self.inner.shared;
        let mut runners = self.inner.lock_runners();
        // Checked under the lock: `close` takes the handles under the same
        // lock after leaving `Running`, so nothing spawned here is missed.
        if !shared.state.is_running() {
            return Ok(());
        }
        runners.reap_finished();

        for bucket in [Bucket::Core, Bucket::Monitor] {
            if shared.bucket_queue(bucket).is_empty() {
                continue;
            }
            let runner = runners.cooperative(bucket);
            match runner {
                Some(handle) => handle.thread().unpark(),
                None => match self.spawn_cooperative(bucket) {
                    Ok(handle) => *runner = Some(handle),
                    Err(err) => return Err(self.abandon_queue(shared.bucket_queue(bucket), err)),
                },
            }
        }

        while let Some(slot) = shared.dedicated_queue().pop() {
            match DedicatedRunner::spawn(slot, shared) {
                Ok(handle) => runners.dedicated.push(handle),
                Err(err) => return Err(self.abandon_queue(shared.dedicated_queue(), err)),
            }
        }
        Ok(())
    }

    /// A runner could not be spawned: tear down everything still waiting for
    /// it, so no caller that saw the error has a handler polled later.
    fn abandon_queue(&self, queue: &AdmissionQueue, err: KernelError) -> KernelError {
        let released = queue.teardown_all(self.inner.shared.sink.as_ref());
        tracing::error!(group = %self.name(), error = %err, released, "runner spawn failed");
        err
    }

    fn spawn_cooperative(&self, bucket: Bucket) -> Result<JoinHandle<()>> {
        let shared = &self.inner.shared;
        let thread_name = format!("{}/{}", shared.name(), bucket.as_str());
        let runner = CooperativeRunner::new(bucket, Arc::clone(shared));
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || runner.run())
            .map_err(|source| KernelError::RunnerSpawn {
                runner: thread_name,
                source,
            })?;
        shared.record_spawn();
        Ok(handle)
    }
}

impl GroupInner {
    fn lock_runners(&self) -> MutexGuard<'_, Runners> {
        self.runners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        let shared = &self.shared;
        if self.closing.swap(true, Ordering::AcqRel) {
            // Someone else is closing.  Wait for them, unless we are one of
            // the runners they are joining.
            if !shared.is_runner_thread(thread::current().id()) {
                self.termination.wait();
            }
            return;
        }

        if shared.state.transition(LifecycleState::New, LifecycleState::Terminated) {
            let released = shared.teardown_queued();
            tracing::info!(group = %shared.name(), released, "event group closed before start");
            self.termination.signal();
            return;
        }

        shared.request_stop("close requested");
        let handles = self.lock_runners().take_all();
        let current = thread::current().id();
        if !handles.iter().any(|h| h.thread().id() == current) {
            finish_close(shared, &self.termination, handles);
            return;
        }

        // Called from a runner: it cannot join itself, so a helper joins
        // every runner (this one included, once it unwinds out of its handler)
        // and only then terminates.
        let (tx, rx) = channel::bounded::<Vec<JoinHandle<()>>>(1);
        let helper_shared = Arc::clone(shared);
        let termination = Arc::clone(&self.termination);
        let spawned = thread::Builder::new()
            .name(format!("{}/closer", shared.name()))
            .spawn(move || {
                if let Ok(handles) = rx.recv() {
                    finish_close(&helper_shared, &termination, handles);
                }
            });
        match spawned {
            Ok(_) => {
                if let Err(channel::SendError(handles)) = tx.send(handles) {
                    finish_close(shared, &self.termination, handles);
                }
            }
            Err(error) => {
                tracing::error!(
                    group = %shared.name(),
                    %error,
                    "failed to spawn close helper; terminating before the calling runner exits"
                );
                finish_close(shared, &self.termination, handles);
            }
        }
    }
}

/// Join `handles` (skipping the calling thread), tear down whatever is still
/// queued, then move to `Terminated` and wake every waiter.
fn finish_close(shared: &GroupShared, termination: &Termination, handles: Vec<JoinHandle<()>>) {
    let current = thread::current().id();
    for handle in handles {
        if handle.thread().id() == current {
            continue;
        }
        let name = handle.thread().name().unwrap_or("runner").to_string();
        if handle.join().is_err() {
            tracing::error!(group = %shared.name(), runner = %name, "runner thread panicked");
        }
    }

    let released = shared.teardown_queued();
    shared.state.advance(LifecycleState::Terminated);
    tracing::info!(
        group = %shared.name(),
        spawned = shared.spawned_threads(),
        released_unadmitted = released,
        "event group terminated"
    );
    termination.signal();
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
