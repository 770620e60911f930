//! Lock-free admission queues.
//!
//! Registration never waits on a runner: handlers are pushed onto a
//! [`SegQueue`] and picked up by whichever thread owns that queue's drain
//! side (the bucket's runner, the coordinator when spawning dedicated
//! runners, or the closing thread during teardown).  `SegQueue` is MPMC, so
//! a late registration racing with `close` is never lost; whoever pops a
//! handler becomes responsible for it.

use crossbeam::queue::SegQueue;

use crate::exception::ExceptionSink;
use crate::handler::HandlerSlot;

/// Staging queue for handlers that have not reached a runner yet.
#[derive(Debug, Default)]
pub(crate) struct AdmissionQueue {
    queue: SegQueue<HandlerSlot>,
}

impl AdmissionQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a handler.  Never blocks.
    pub(crate) fn push(&self, slot: HandlerSlot) {
        self.queue.push(slot);
    }

    /// Take the oldest queued handler, if any.
    pub(crate) fn pop(&self) -> Option<HandlerSlot> {
        self.queue.pop()
    }

    /// Iterate over everything queued right now, oldest first.
    pub(crate) fn drain(&self) -> impl Iterator<Item = HandlerSlot> + '_ {
        std::iter::from_fn(|| self.queue.pop())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Tear down every queued handler without polling it.  Returns how many
    /// were torn down.
    pub(crate) fn teardown_all(&self, sink: &dyn ExceptionSink) -> usize {
        let mut count = 0;
        for slot in self.drain() {
            slot.teardown(sink);
            count += 1;
        }
        count
    }
}
