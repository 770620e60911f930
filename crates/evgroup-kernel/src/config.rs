//! Group configuration.
//!
//! [`GroupConfig`] controls thread naming, idle backoff and the optional loop
//! block monitor.  Defaults suit a latency-sensitive process; every field can
//! be overridden fluently or loaded from the `[group]` table of a TOML file:
//!
//! ```toml
//! [group]
//! name = "md-feed"
//! max_pause_ms = 5
//! block_threshold_ms = 50
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

/// Tuning knobs for an [`EventGroup`](crate::group::EventGroup).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Prefix for runner thread names and the `group` log field.
    ///
    /// Default: **`"event-group"`**.
    pub name: String,

    /// First sleep once a runner has exhausted its spin passes, in
    /// microseconds.
    ///
    /// Default: **50 µs**.
    pub min_pause_us: u64,

    /// Ceiling for the doubling idle sleep, in milliseconds.
    ///
    /// Default: **20 ms**.
    pub max_pause_ms: u64,

    /// Idle passes spent yielding before a runner starts sleeping.
    ///
    /// Default: **100**.
    pub spin_passes: u32,

    /// Pause between passes of the monitor runner, in milliseconds.
    ///
    /// Default: **10 ms**.
    pub monitor_interval_ms: u64,

    /// When set, a loop block monitor warns whenever a single core pass
    /// runs longer than this many milliseconds.
    ///
    /// Default: **disabled**.
    pub block_threshold_ms: Option<u64>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: "event-group".to_string(),
            min_pause_us: 50,
            max_pause_ms: 20,
            spin_passes: 100,
            monitor_interval_ms: 10,
            block_threshold_ms: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    group: GroupConfig,
}

impl GroupConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `[group]` table of a TOML document.  A document without
    /// that table yields the defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(source)?;
        file.group.validate()?;
        Ok(file.group)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| KernelError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!(path = %path.display(), group = %config.name, "group config loaded");
        Ok(config)
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(KernelError::InvalidConfig {
                reason: "name must not be empty".into(),
            });
        }
        if self.max_pause_ms == 0 {
            return Err(KernelError::InvalidConfig {
                reason: "max_pause_ms must be at least 1".into(),
            });
        }
        if self.min_pause() > self.max_pause() {
            return Err(KernelError::InvalidConfig {
                reason: format!(
                    "min_pause_us ({}) exceeds max_pause_ms ({})",
                    self.min_pause_us, self.max_pause_ms
                ),
            });
        }
        if self.monitor_interval_ms == 0 {
            return Err(KernelError::InvalidConfig {
                reason: "monitor_interval_ms must be at least 1".into(),
            });
        }
        if self.block_threshold_ms == Some(0) {
            return Err(KernelError::InvalidConfig {
                reason: "block_threshold_ms must be at least 1 when set".into(),
            });
        }
        Ok(())
    }

    /// Set the thread-name prefix.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the first idle sleep (in microseconds).
    pub fn with_min_pause_us(mut self, us: u64) -> Self {
        self.min_pause_us = us;
        self
    }

    /// Set the idle sleep ceiling (in milliseconds).
    pub fn with_max_pause_ms(mut self, ms: u64) -> Self {
        self.max_pause_ms = ms;
        self
    }

    /// Set how many idle passes yield before sleeping.
    pub fn with_spin_passes(mut self, passes: u32) -> Self {
        self.spin_passes = passes;
        self
    }

    /// Set the monitor runner cadence (in milliseconds).
    pub fn with_monitor_interval_ms(mut self, ms: u64) -> Self {
        self.monitor_interval_ms = ms;
        self
    }

    /// Enable the loop block monitor with the given threshold (in
    /// milliseconds).
    pub fn with_block_threshold_ms(mut self, ms: u64) -> Self {
        self.block_threshold_ms = Some(ms);
        self
    }

    pub fn min_pause(&self) -> Duration {
        Duration::from_micros(self.min_pause_us)
    }

    pub fn max_pause(&self) -> Duration {
        Duration::from_millis(self.max_pause_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn block_threshold(&self) -> Option<Duration> {
        self.block_threshold_ms.map(Duration::from_millis)
    }
}
