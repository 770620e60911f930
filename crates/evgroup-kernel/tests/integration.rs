//! Integration tests for the evgroup-kernel crate.
//!
//! These tests drive a real [`EventGroup`] with real runner threads: start,
//! stop and close ordering, lazy thread creation per tier, dedicated
//! handlers added while running, and the finish/release contract.  Every
//! test ends with the same teardown checks: each tracked handler finished
//! once and released once (in that order), no runner thread is left alive
//! and, unless the test provokes one, no failure was recorded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use evgroup_kernel::{
    Activity, EventGroup, EventHandler, GroupConfig, HandlerSignal, KernelError, LifecycleState,
    PollResult, Priority, RecordingExceptionSink, StopSignal,
};

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

fn new_group(name: &str) -> (EventGroup, RecordingExceptionSink) {
    let sink = RecordingExceptionSink::new();
    let group = EventGroup::with_sink(
        GroupConfig::new().with_name(name).with_max_pause_ms(2),
        Arc::new(sink.clone()),
    )
    .expect("group");
    (group, sink)
}

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Global ordering of lifecycle callbacks across all tracked handlers.
#[derive(Default)]
struct Sequence(AtomicU64);

impl Sequence {
    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Records when each lifecycle callback ran (0 = never) and how often.
#[derive(Default)]
struct TrackLog {
    started: AtomicU64,
    polls: AtomicU64,
    finished_at: AtomicU64,
    released_at: AtomicU64,
    finished: AtomicU32,
    released: AtomicU32,
}

impl TrackLog {
    fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }
}

/// What a [`Tracked`] handler does on each poll.
#[derive(Clone, Copy)]
enum Behavior {
    Idle,
    /// Make progress until the `n`th poll, then deregister.
    CountTo(u64),
    /// Park with no timeout; only an unpark brings it back.
    Park,
    Shutdown,
    Panic,
}

struct Tracked {
    priority: Priority,
    behavior: Behavior,
    seq: Arc<Sequence>,
    log: Arc<TrackLog>,
}

impl Tracked {
    fn new(priority: Priority, behavior: Behavior, seq: &Arc<Sequence>) -> (Self, Arc<TrackLog>) {
        let log = Arc::new(TrackLog::default());
        let handler = Self {
            priority,
            behavior,
            seq: Arc::clone(seq),
            log: Arc::clone(&log),
        };
        (handler, log)
    }
}

impl EventHandler for Tracked {
    fn poll(&mut self) -> PollResult {
        let n = self.log.polls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.behavior {
            Behavior::Idle => Ok(Activity::Idle),
            Behavior::CountTo(limit) if n >= limit => Err(HandlerSignal::Deregister),
            Behavior::CountTo(_) => Ok(Activity::Progress),
            Behavior::Park => {
                thread::park();
                Ok(Activity::Idle)
            }
            Behavior::Shutdown => Err(HandlerSignal::Shutdown),
            Behavior::Panic => panic!("boom"),
        }
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn loop_started(&mut self, _stop: &StopSignal) {
        self.log.started.store(self.seq.next(), Ordering::SeqCst);
    }

    fn loop_finished(&mut self) {
        self.log.finished.fetch_add(1, Ordering::SeqCst);
        self.log.finished_at.store(self.seq.next(), Ordering::SeqCst);
    }

    fn release(&mut self) {
        self.log.released.fetch_add(1, Ordering::SeqCst);
        self.log.released_at.store(self.seq.next(), Ordering::SeqCst);
    }
}

/// Each handler finished exactly once, then released exactly once, and
/// (if it ever started) started before finishing.
fn assert_torn_down(logs: &[Arc<TrackLog>]) {
    for (i, log) in logs.iter().enumerate() {
        let started = log.started.load(Ordering::SeqCst);
        let finished = log.finished_at.load(Ordering::SeqCst);
        let released = log.released_at.load(Ordering::SeqCst);
        assert_eq!(log.finished.load(Ordering::SeqCst), 1, "handler {i} finished");
        assert_eq!(log.released.load(Ordering::SeqCst), 1, "handler {i} released");
        assert!(finished < released, "handler {i}: finished {finished}, released {released}");
        if started > 0 {
            assert!(started < finished, "handler {i}: started {started}, finished {finished}");
        }
    }
}

/// Teardown checks shared by every clean run.
fn assert_clean_teardown(group: &EventGroup, sink: &RecordingExceptionSink, logs: &[Arc<TrackLog>]) {
    assert_eq!(group.state(), LifecycleState::Terminated);
    assert_eq!(group.live_runner_threads(), 0);
    assert_eq!(group.queued_handlers(), 0);
    assert!(sink.is_empty(), "unexpected failures: {:?}", sink.records());
    assert_torn_down(logs);
}

fn register_all(
    group: &EventGroup,
    seq: &Arc<Sequence>,
    handlers: &[(Priority, Behavior)],
) -> Vec<Arc<TrackLog>> {
    handlers
        .iter()
        .map(|&(priority, behavior)| {
            let (handler, log) = Tracked::new(priority, behavior, seq);
            group.register(handler).expect("register");
            log
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
//  Lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn counter_handler_runs_then_deregisters() {
    let (group, sink) = new_group("counter");
    let seq = Arc::new(Sequence::default());
    let logs = register_all(&group, &seq, &[(Priority::Medium, Behavior::CountTo(10))]);
    group.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || logs[0].polls() >= 10));
    // Once deregistered it is never polled again.
    for _ in 0..20 {
        thread::sleep(Duration::from_millis(2));
        assert_eq!(logs[0].polls(), 10);
    }
    // Deregistration already tore it down, while the group keeps running.
    assert_torn_down(&logs);
    assert!(group.is_alive());

    group.close();
    group.await_termination();
    assert_clean_teardown(&group, &sink, &logs);
}

#[test]
fn close_without_start() {
    let (group, sink) = new_group("never-started");
    group.close();
    group.await_termination();
    assert_eq!(group.spawned_runner_threads(), 0);
    assert_clean_teardown(&group, &sink, &[]);
}

#[test]
fn start_stop_close_await() {
    let (group, sink) = new_group("full-cycle");
    let seq = Arc::new(Sequence::default());
    let logs = register_all(&group, &seq, &[(Priority::High, Behavior::Idle)]);

    group.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || logs[0].polls() > 0));
    group.stop();
    assert!(group.is_closed());
    group.close();
    group.await_termination();

    assert_clean_teardown(&group, &sink, &logs);
}

#[test]
fn no_threads_until_started() {
    let (group, sink) = new_group("idle");
    let seq = Arc::new(Sequence::default());
    let handlers: Vec<_> = Priority::ALL.iter().map(|&p| (p, Behavior::Idle)).collect();
    let logs = register_all(&group, &seq, &handlers);
    thread::sleep(Duration::from_millis(20));

    assert_eq!(group.spawned_runner_threads(), 0);
    assert_eq!(group.queued_handlers(), Priority::ALL.len());
    assert!(logs.iter().all(|log| log.started.load(Ordering::SeqCst) == 0));

    group.close();
    assert!(logs.iter().all(|log| log.polls() == 0));
    assert_clean_teardown(&group, &sink, &logs);
}

#[test]
fn every_priority_starts_and_stops() {
    let (group, sink) = new_group("all-tiers");
    let seq = Arc::new(Sequence::default());
    let handlers: Vec<_> = Priority::ALL.iter().map(|&p| (p, Behavior::Idle)).collect();
    let logs = register_all(&group, &seq, &handlers);
    group.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        logs.iter().all(|log| log.polls() > 0)
    }));
    // core + monitor + one per dedicated tier.
    assert_eq!(group.spawned_runner_threads(), 5);

    group.close();
    assert_clean_teardown(&group, &sink, &logs);
}

#[test]
fn concurrent_waiters_all_wake_on_close() {
    let (group, sink) = new_group("waiters");
    let seq = Arc::new(Sequence::default());
    let logs = register_all(
        &group,
        &seq,
        &[(Priority::High, Behavior::Idle), (Priority::Concurrent, Behavior::Idle)],
    );
    group.start().unwrap();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let group = group.clone();
            thread::spawn(move || {
                group.await_termination();
                group.state()
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(20));
    assert!(waiters.iter().all(|w| !w.is_finished()));

    group.close();
    assert!(wait_until(Duration::from_secs(5), || {
        waiters.iter().all(|w| w.is_finished())
    }));
    for waiter in waiters {
        assert_eq!(waiter.join().expect("waiter"), LifecycleState::Terminated);
    }
    // Late waiters return straight away.
    group.await_termination();
    assert_clean_teardown(&group, &sink, &logs);
}

// ═══════════════════════════════════════════════════════════════════════
//  Dedicated tiers
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn dedicated_handlers_wait_for_start() {
    let (group, sink) = new_group("dedicated-wait");
    let seq = Arc::new(Sequence::default());
    let logs = register_all(
        &group,
        &seq,
        &[
            (Priority::Blocking, Behavior::Idle),
            (Priority::Concurrent, Behavior::Idle),
            (Priority::Replication, Behavior::Idle),
        ],
    );
    thread::sleep(Duration::from_millis(20));
    assert!(logs.iter().all(|log| log.polls() == 0));

    group.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        logs.iter().all(|log| log.polls() > 0)
    }));
    group.close();
    assert_clean_teardown(&group, &sink, &logs);
}

#[test]
fn concurrent_handler_added_after_start_runs_promptly() {
    let (group, sink) = new_group("late-concurrent");
    let seq = Arc::new(Sequence::default());
    let mut logs = register_all(&group, &seq, &[(Priority::Concurrent, Behavior::Idle)]);
    group.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || logs[0].polls() > 0));

    logs.extend(register_all(&group, &seq, &[(Priority::Concurrent, Behavior::Idle)]));
    assert!(wait_until(Duration::from_millis(100), || logs[1].polls() > 0));
    assert_eq!(group.spawned_runner_threads(), 2);
    group.close();
    assert_clean_teardown(&group, &sink, &logs);
}

#[test]
fn parked_blocking_handler_is_woken_by_close() {
    let (group, sink) = new_group("parker");
    let seq = Arc::new(Sequence::default());
    let logs = register_all(&group, &seq, &[(Priority::Blocking, Behavior::Park)]);
    group.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || logs[0].polls() > 0));

    let started = Instant::now();
    group.close();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_clean_teardown(&group, &sink, &logs);
}

#[test]
fn parked_blocking_handler_does_not_stall_other_runners() {
    let (group, sink) = new_group("park-isolation");
    let seq = Arc::new(Sequence::default());
    let logs = register_all(
        &group,
        &seq,
        &[
            (Priority::Blocking, Behavior::Park),
            (Priority::High, Behavior::Idle),
            (Priority::Concurrent, Behavior::Idle),
        ],
    );
    group.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || logs[0].polls() > 0));

    // The blocking handler sits in `park` while the others keep polling.
    let (high, concurrent) = (logs[1].polls(), logs[2].polls());
    assert!(wait_until(Duration::from_secs(5), || {
        logs[1].polls() >= high + 50 && logs[2].polls() >= concurrent + 50
    }));

    let started = Instant::now();
    group.close();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_clean_teardown(&group, &sink, &logs);
}

// ═══════════════════════════════════════════════════════════════════════
//  Close ordering and failures
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn finished_precedes_release_exactly_once() {
    let (group, sink) = new_group("close-order");
    let seq = Arc::new(Sequence::default());
    let handlers: Vec<_> = [Priority::High, Priority::Timer, Priority::Monitor, Priority::Concurrent]
        .into_iter()
        .map(|p| (p, Behavior::Idle))
        .collect();
    let logs = register_all(&group, &seq, &handlers);
    group.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        logs.iter().all(|log| log.polls() > 0)
    }));
    group.close();
    group.close();

    assert!(logs.iter().all(|log| log.started.load(Ordering::SeqCst) > 0));
    assert_clean_teardown(&group, &sink, &logs);
}

#[test]
fn register_after_close_is_rejected() {
    let (group, sink) = new_group("rejected");
    group.start().unwrap();
    group.close();

    let seq = Arc::new(Sequence::default());
    let (handler, log) = Tracked::new(Priority::High, Behavior::Idle, &seq);
    let err = group.register(handler).unwrap_err();
    assert!(matches!(err, KernelError::GroupClosed { ref group } if group == "rejected"));
    assert_eq!(log.started.load(Ordering::SeqCst), 0);
    assert_clean_teardown(&group, &sink, &[log]);
}

#[test]
fn panicking_handler_is_isolated() {
    let (group, sink) = new_group("panics");
    let seq = Arc::new(Sequence::default());
    let logs = register_all(
        &group,
        &seq,
        &[(Priority::High, Behavior::Panic), (Priority::High, Behavior::Idle)],
    );
    group.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || logs[1].polls() > 5));
    // Torn down right after the panic, not at close.
    assert_eq!(logs[0].polls(), 1);
    assert_eq!(logs[0].released.load(Ordering::SeqCst), 1);
    group.close();

    let records = sink.drain();
    assert_eq!(records.len(), 1);
    assert!(records[0].panicked);
    assert!(records[0].message.contains("boom"));
    assert_clean_teardown(&group, &sink, &logs);
}

#[test]
fn handler_shutdown_terminates_with_close() {
    let (group, sink) = new_group("self-stop");
    let seq = Arc::new(Sequence::default());
    let logs = register_all(&group, &seq, &[(Priority::Timer, Behavior::Shutdown)]);
    group.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || group.is_closed()));
    assert!(!group.await_termination_timeout(Duration::from_millis(5)));

    group.close();
    assert!(group.await_termination_timeout(Duration::from_secs(1)));
    assert_eq!(logs[0].polls(), 1);
    assert_clean_teardown(&group, &sink, &logs);
}

#[tokio::test]
async fn terminated_future_resolves_after_close() {
    let (group, sink) = new_group("async-wait");
    let seq = Arc::new(Sequence::default());
    let logs = register_all(&group, &seq, &[(Priority::Daemon, Behavior::Idle)]);
    group.start().unwrap();

    let waiter = {
        let group = group.clone();
        tokio::spawn(async move { group.terminated().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    let closer = group.clone();
    tokio::task::spawn_blocking(move || closer.close())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("terminated in time")
        .unwrap();
    assert_clean_teardown(&group, &sink, &logs);
}
