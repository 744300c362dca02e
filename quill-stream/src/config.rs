//! Log stream configuration.

use quill_core::config::env_var;
use quill_core::dispatcher::DispatcherConfig;
use quill_core::error::{QuillError, Result};
use quill_core::storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of frames the appender handles per scheduling turn.
pub const DEFAULT_MAX_FRAMES_PER_TURN: usize = 64;

/// Default fallback wake-up interval of an idle appender.
pub const DEFAULT_IDLE_POLL_INTERVAL_MS: u64 = 100;

/// Configuration for a [`LogStream`](crate::LogStream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStreamConfig {
    /// Write buffer settings. The mode is always forced to pipeline so
    /// buffer readers trail the appender.
    pub dispatcher: DispatcherConfig,
    /// Durable storage settings.
    pub storage: StorageConfig,
    /// Frames handled per appender turn before yielding.
    pub max_frames_per_turn: usize,
    /// Wake-up interval of an idle appender in milliseconds, in case a
    /// notification was missed.
    pub idle_poll_interval_ms: u64,
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            storage: StorageConfig::default(),
            max_frames_per_turn: DEFAULT_MAX_FRAMES_PER_TURN,
            idle_poll_interval_ms: DEFAULT_IDLE_POLL_INTERVAL_MS,
        }
    }
}

impl LogStreamConfig {
    /// Configuration for tests: temp directory storage and a small buffer.
    pub fn in_memory() -> Self {
        Self {
            dispatcher: DispatcherConfig::default().with_capacity(64 * 1024),
            storage: StorageConfig::in_memory(),
            ..Self::default()
        }
    }

    /// Set the dispatcher configuration.
    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Set the storage configuration.
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Set the per-turn frame budget.
    pub fn with_max_frames_per_turn(mut self, frames: usize) -> Self {
        self.max_frames_per_turn = frames;
        self
    }

    /// Set the idle wake-up interval.
    pub fn with_idle_poll_interval_ms(mut self, ms: u64) -> Self {
        self.idle_poll_interval_ms = ms;
        self
    }

    /// Idle wake-up interval as a duration.
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        self.dispatcher.validate()?;
        self.storage.validate()?;
        if self.max_frames_per_turn == 0 {
            return Err(QuillError::ConfigValue {
                field: "max_frames_per_turn".to_string(),
                cause: "must be positive".to_string(),
            });
        }
        if self.idle_poll_interval_ms == 0 {
            return Err(QuillError::ConfigValue {
                field: "idle_poll_interval_ms".to_string(),
                cause: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Load overrides from the environment on top of the defaults.
    ///
    /// Reads the dispatcher and storage variables plus
    /// `QUILL_MAX_FRAMES_PER_TURN` and `QUILL_IDLE_POLL_MS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            dispatcher: DispatcherConfig::from_env()?,
            storage: StorageConfig::from_env()?,
            ..Self::default()
        };
        if let Some(frames) = env_var::<usize>("QUILL_MAX_FRAMES_PER_TURN")? {
            config.max_frames_per_turn = frames;
        }
        if let Some(ms) = env_var::<u64>("QUILL_IDLE_POLL_MS")? {
            config.idle_poll_interval_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }

    /// Like [`from_env`](Self::from_env) but falls back to defaults on
    /// invalid values.
    pub fn from_env_or_default() -> Self {
        Self::from_env().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Invalid log stream configuration, using defaults");
            Self::default()
        })
    }
}
