//! Exception policy.
//!
//! Runners never let a handler failure escape: anything that is not a
//! control signal is turned into a [`HandlerFailure`] and handed to the
//! group's [`ExceptionSink`].  Sinks only observe; they cannot change the
//! scheduler's state.  A sink is called on the runner thread that saw the
//! failure, so it must return quickly or that runner stalls.

use std::any::Any;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::handler::HandlerSource;

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// A non-control failure raised while servicing a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerFailure {
    /// `poll` returned [`HandlerSignal::Failed`](crate::handler::HandlerSignal::Failed).
    #[error("{0:#}")]
    Error(anyhow::Error),

    /// `poll` panicked.  The handler is torn down afterwards.
    #[error("poll panicked: {0}")]
    Panic(String),

    /// One of the lifecycle hooks panicked.
    #[error("{hook} panicked: {message}")]
    HookPanic {
        /// `loop_started`, `loop_finished` or `release`.
        hook: &'static str,
        message: String,
    },
}

impl HandlerFailure {
    /// Build a panic failure from a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        HandlerFailure::Panic(panic_message(payload.as_ref()))
    }

    pub(crate) fn from_hook_panic(hook: &'static str, payload: Box<dyn Any + Send>) -> Self {
        HandlerFailure::HookPanic {
            hook,
            message: panic_message(payload.as_ref()),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Sink trait
// ---------------------------------------------------------------------------

/// Receiver of non-control handler failures.
pub trait ExceptionSink: Send + Sync {
    /// Record one failure raised by `source`.
    fn record(&self, source: &HandlerSource, failure: HandlerFailure);
}

impl<S: ExceptionSink + ?Sized> ExceptionSink for Arc<S> {
    fn record(&self, source: &HandlerSource, failure: HandlerFailure) {
        (**self).record(source, failure);
    }
}

/// Default sink: logs every failure at `warn` and drops it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExceptionSink;

impl ExceptionSink for TracingExceptionSink {
    fn record(&self, source: &HandlerSource, failure: HandlerFailure) {
        tracing::warn!(
            handler_id = %source.id,
            handler = %source.name,
            priority = %source.priority,
            error = %failure,
            "event handler failed"
        );
    }
}

// ---------------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------------

/// One failure captured by [`RecordingExceptionSink`].
#[derive(Debug, Clone, Serialize)]
pub struct ExceptionRecord {
    pub source: HandlerSource,
    pub message: String,
    pub panicked: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Sink that keeps every failure in memory.
///
/// Cheaply cloneable; all clones share the same record list.  Useful for
/// asserting that a clean run recorded nothing, and for dumping what went
/// wrong when it did.
#[derive(Debug, Default, Clone)]
pub struct RecordingExceptionSink {
    records: Arc<Mutex<Vec<ExceptionRecord>>>,
}

impl RecordingExceptionSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of failures recorded so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of the recorded failures, oldest first.
    pub fn records(&self) -> Vec<ExceptionRecord> {
        self.lock().clone()
    }

    /// Remove and return every recorded failure.
    pub fn drain(&self) -> Vec<ExceptionRecord> {
        std::mem::take(&mut *self.lock())
    }

    /// Render the recorded failures as pretty JSON.
    pub fn dump_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ExceptionRecord>> {
        // A panic while holding this lock cannot leave the Vec inconsistent.
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ExceptionSink for RecordingExceptionSink {
    fn record(&self, source: &HandlerSource, failure: HandlerFailure) {
        tracing::debug!(handler_id = %source.id, error = %failure, "recording handler failure");
        let panicked = matches!(
            failure,
            HandlerFailure::Panic(_) | HandlerFailure::HookPanic { .. }
        );
        self.lock().push(ExceptionRecord {
            source: source.clone(),
            message: failure.to_string(),
            panicked,
            recorded_at: Utc::now(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
