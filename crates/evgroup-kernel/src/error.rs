//! Kernel error types.
//!
//! Every public API in this crate surfaces failures through [`KernelError`].
//! Handler failures are *not* kernel errors: they travel through
//! [`HandlerSignal`](crate::handler::HandlerSignal) and end up in the group's
//! [`ExceptionSink`](crate::exception::ExceptionSink).

use std::path::PathBuf;

/// Unified error type for the event-group kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Lifecycle errors ---------------------------------------------------
    /// The group has begun stopping and no longer admits handlers.  The
    /// handler passed to `register` has already been torn down.
    #[error("event group `{group}` is closed")]
    GroupClosed {
        /// Name of the group that rejected the handler.
        group: String,
    },

    /// The operating system refused to spawn a runner thread.
    #[error("failed to spawn runner thread `{runner}`: {source}")]
    RunnerSpawn {
        /// The thread name that was requested.
        runner: String,
        #[source]
        source: std::io::Error,
    },

    // -- Configuration errors -----------------------------------------------
    /// A configuration value is out of range or inconsistent.
    #[error("invalid group configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`GroupConfig`](crate::config::GroupConfig).
    #[error("failed to parse group config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
