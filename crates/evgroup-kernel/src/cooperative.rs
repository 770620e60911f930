//! Cooperative runner.
//!
//! One thread per [`Bucket`] multiplexes every handler of that bucket's
//! tiers.  Handlers live in one lane per tier; each pass walks the lanes
//! highest tier first and polls every handler whose tier is due (see
//! [`Strategy::due`](crate::priority::Strategy::due)).  Only this thread
//! ever touches the handlers in its lanes.

use std::sync::Arc;

use crate::handler::{HandlerSlot, PollOutcome};
use crate::lifecycle::StopSignal;
use crate::pauser::{BackoffPauser, Pacer};
use crate::priority::{Bucket, Priority};
use crate::shared::{GroupShared, RunnerKey, RunnerRegistration};

enum PassResult {
    Progress,
    Idle,
    Shutdown,
}

pub(crate) struct CooperativeRunner {
    bucket: Bucket,
    shared: Arc<GroupShared>,
    stop: StopSignal,
    /// Indexed by [`Priority::rank`]; lanes of other buckets stay empty.
    lanes: Vec<Vec<HandlerSlot>>,
    pass: u64,
}

impl CooperativeRunner {
    pub(crate) fn new(bucket: Bucket, shared: Arc<GroupShared>) -> Self {
        let stop = shared.stop_signal();
        Self {
            bucket,
            shared,
            stop,
            lanes: (0..Priority::SHARED_TIERS).map(|_| Vec::new()).collect(),
            pass: 0,
        }
    }

    /// Thread body.
    pub(crate) fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let _registration = RunnerRegistration::enter(&shared, RunnerKey::Cooperative(self.bucket));
        tracing::info!(group = %shared.name(), bucket = self.bucket.as_str(), "cooperative runner started");

        let mut pacer = match self.bucket {
            Bucket::Core => Pacer::Backoff(BackoffPauser::from_config(&shared.config)),
            Bucket::Monitor => Pacer::Fixed(shared.config.monitor_interval()),
        };
        let mut after_idle = true;

        while shared.state.is_running() {
            self.admit();
            let progressed = match self.run_pass(after_idle) {
                PassResult::Progress => true,
                PassResult::Idle => false,
                PassResult::Shutdown => break,
            };
            self.pass = self.pass.wrapping_add(1);
            after_idle = !progressed;
            pacer.after_pass(progressed);
        }

        let released = self.teardown();
        tracing::info!(
            group = %shared.name(),
            bucket = self.bucket.as_str(),
            passes = self.pass,
            released,
            "cooperative runner stopped"
        );
    }

    /// Move newly registered handlers into their lanes, preserving
    /// registration order.
    fn admit(&mut self) {
        let sink = self.shared.sink.as_ref();
        for mut slot in self.shared.bucket_queue(self.bucket).drain() {
            slot.activate(&self.stop, sink);
            self.lanes[slot.priority().rank()].push(slot);
        }
    }

    fn run_pass(&mut self, after_idle: bool) -> PassResult {
        let heartbeat = (self.bucket == Bucket::Core).then(|| Arc::clone(&self.shared.heartbeat));
        if let Some(hb) = &heartbeat {
            hb.begin_pass();
        }
        let result = self.poll_lanes(after_idle);
        if let Some(hb) = &heartbeat {
            hb.end_pass();
        }
        result
    }

    fn poll_lanes(&mut self, after_idle: bool) -> PassResult {
        let sink = self.shared.sink.as_ref();
        let mut progressed = false;

        for (rank, lane) in self.lanes.iter_mut().enumerate() {
            if lane.is_empty() || !Priority::ALL[rank].strategy().due(self.pass, after_idle) {
                continue;
            }
            let mut i = 0;
            while i < lane.len() {
                match lane[i].poll() {
                    PollOutcome::Progress => {
                        progressed = true;
                        i += 1;
                    }
                    PollOutcome::Idle => i += 1,
                    PollOutcome::Failed(failure) => {
                        sink.record(lane[i].source(), failure);
                        i += 1;
                    }
                    PollOutcome::Deregister => {
                        let slot = lane.remove(i);
                        tracing::debug!(handler_id = %slot.id(), "handler deregistered");
                        slot.teardown(sink);
                        progressed = true;
                    }
                    PollOutcome::Panicked(failure) => {
                        let slot = lane.remove(i);
                        sink.record(slot.source(), failure);
                        slot.teardown(sink);
                    }
                    PollOutcome::Shutdown => {
                        let source = lane[i].source();
                        tracing::info!(handler_id = %source.id, handler = %source.name, "handler requested shutdown");
                        self.shared.request_stop("handler requested shutdown");
                        return PassResult::Shutdown;
                    }
                }
            }
        }

        if progressed {
            PassResult::Progress
        } else {
            PassResult::Idle
        }
    }

    /// Tear down every handler this runner still owns, including any that
    /// were queued for it but never admitted.
    fn teardown(&mut self) -> usize {
        let sink = self.shared.sink.as_ref();
        let mut released = 0;
        for lane in &mut self.lanes {
            for slot in lane.drain(..) {
                slot.teardown(sink);
                released += 1;
            }
        }
        released + self.shared.bucket_queue(self.bucket).teardown_all(sink)
    }
}
