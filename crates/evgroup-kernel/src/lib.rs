//! Event group kernel.
//!
//! A low-latency scheduler for non-blocking event handlers:
//!
//! - **[`group`]** -- The [`EventGroup`] lifecycle coordinator: registration,
//!   lazy runner creation, stop/close and termination waiting.
//! - **[`handler`]** -- The [`EventHandler`] contract and its poll results.
//! - **[`priority`]** -- Priority tiers and the strategy table mapping each
//!   tier to a shared cooperative runner or a dedicated thread.
//! - **[`lifecycle`]** -- Group lifecycle states and the [`StopSignal`]
//!   handed to handlers.
//! - **[`exception`]** -- Where handler failures are reported.
//! - **[`config`]** -- [`GroupConfig`], loadable from TOML.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! Shared-tier handlers are polled by one thread per bucket and must never
//! block.  Dedicated-tier handlers each get their own thread.

pub mod config;
pub mod error;
pub mod exception;
pub mod group;
pub mod handler;
pub mod lifecycle;
pub mod priority;

mod admission;
mod cooperative;
mod dedicated;
mod monitor;
mod pauser;
mod shared;

// Re-export the most commonly used types at the crate root for convenience.
pub use config::GroupConfig;
pub use error::{KernelError, Result};
pub use exception::{
    ExceptionRecord, ExceptionSink, HandlerFailure, RecordingExceptionSink, TracingExceptionSink,
};
pub use group::EventGroup;
pub use handler::{
    Activity, EventHandler, FnHandler, HandlerId, HandlerSignal, HandlerSource, PollResult, from_fn,
};
pub use lifecycle::{LifecycleState, StopSignal};
pub use priority::{Bucket, PolicyEntry, Priority, Strategy};
