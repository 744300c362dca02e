//! Dispatcher configuration.

use crate::config::env_var;
use crate::error::{QuillError, Result};
use crate::frame::{FRAME_ALIGNMENT, HEADER_LENGTH};
use serde::{Deserialize, Serialize};

/// Default buffer capacity (4 MiB).
pub const DEFAULT_CAPACITY: usize = 4 * 1024 * 1024;

/// Smallest accepted buffer capacity.
pub const MIN_CAPACITY: usize = 4 * 1024;

/// Largest accepted buffer capacity; frame lengths must fit an `i32`.
pub const MAX_CAPACITY: usize = 1 << 30;

/// How subscriptions relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherMode {
    /// Every subscription reads up to the producer tail on its own.
    #[default]
    PubSub,
    /// Each subscription only sees frames its predecessor (in opening
    /// order) has already consumed.
    Pipeline,
}

/// Configuration for a [`Dispatcher`](super::Dispatcher).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Buffer size in bytes. Power of two.
    pub capacity: usize,
    /// Largest aligned frame (header, payload and padding) a single claim
    /// may reserve. At most half the capacity.
    pub max_frame_length: usize,
    /// Subscription topology.
    pub mode: DispatcherMode,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_frame_length: DEFAULT_CAPACITY / 4,
            mode: DispatcherMode::PubSub,
        }
    }
}

impl DispatcherConfig {
    /// Set the capacity. Also resets the maximum frame length to a quarter
    /// of it.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self.max_frame_length = capacity / 4;
        self
    }

    /// Set the maximum aligned frame length.
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Set the subscription mode.
    pub fn with_mode(mut self, mode: DispatcherMode) -> Self {
        self.mode = mode;
        self
    }

    /// Check the configuration for values the ring buffer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.capacity.is_power_of_two() {
            return Err(QuillError::ConfigValue {
                field: "dispatcher.capacity".to_string(),
                cause: format!("{} is not a power of two", self.capacity),
            });
        }
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&self.capacity) {
            return Err(QuillError::ConfigValue {
                field: "dispatcher.capacity".to_string(),
                cause: format!(
                    "{} is outside {}..={}",
                    self.capacity, MIN_CAPACITY, MAX_CAPACITY
                ),
            });
        }
        let min_frame = HEADER_LENGTH + FRAME_ALIGNMENT;
        if self.max_frame_length < min_frame || self.max_frame_length > self.capacity / 2 {
            return Err(QuillError::ConfigValue {
                field: "dispatcher.max_frame_length".to_string(),
                cause: format!(
                    "{} is outside {}..={}",
                    self.max_frame_length,
                    min_frame,
                    self.capacity / 2
                ),
            });
        }
        Ok(())
    }

    /// Load overrides from the environment on top of the defaults.
    ///
    /// Reads `QUILL_DISPATCHER_CAPACITY`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(capacity) = env_var::<usize>("QUILL_DISPATCHER_CAPACITY")? {
            config = config.with_capacity(capacity);
        }
        config.validate()?;
        Ok(config)
    }

    /// Like [`from_env`](Self::from_env) but falls back to defaults on
    /// invalid values.
    pub fn from_env_or_default() -> Self {
        Self::from_env().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Invalid dispatcher configuration, using defaults");
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = DispatcherConfig::default();
        config.validate().unwrap();
        assert_eq!(config.mode, DispatcherMode::PubSub);
        assert_eq!(config.max_frame_length, DEFAULT_CAPACITY / 4);
    }

    #[test]
    fn rejects_bad_capacity() {
        let err = DispatcherConfig::default()
            .with_capacity(5000)
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), "E501");
        assert!(err.to_string().contains("power of two"));

        assert!(
            DispatcherConfig::default()
                .with_capacity(1024)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn rejects_frames_larger_than_half_the_buffer() {
        let config = DispatcherConfig::default()
            .with_capacity(MIN_CAPACITY)
            .with_max_frame_length(MIN_CAPACITY);
        assert!(config.validate().is_err());

        let config = config.with_max_frame_length(MIN_CAPACITY / 2);
        config.validate().unwrap();
    }

    #[test]
    fn mode_serialization() {
        let json = serde_json::to_string(&DispatcherMode::Pipeline).unwrap();
        assert_eq!(json, "\"pipeline\"");
        let config: DispatcherConfig = serde_json::from_str(
            r#"{"capacity":8192,"max_frame_length":2048,"mode":"pub_sub"}"#,
        )
        .unwrap();
        assert_eq!(config.mode, DispatcherMode::PubSub);
        config.validate().unwrap();
    }

    #[test]
    fn from_env_reads_capacity() {
        // SAFETY: Only this test touches QUILL_DISPATCHER_CAPACITY
        unsafe { std::env::set_var("QUILL_DISPATCHER_CAPACITY", "65536") };
        let config = DispatcherConfig::from_env().unwrap();
        assert_eq!(config.capacity, 65536);
        assert_eq!(config.max_frame_length, 16384);

        unsafe { std::env::set_var("QUILL_DISPATCHER_CAPACITY", "65535") };
        assert!(DispatcherConfig::from_env().is_err());
        assert_eq!(
            DispatcherConfig::from_env_or_default().capacity,
            DEFAULT_CAPACITY
        );

        unsafe { std::env::remove_var("QUILL_DISPATCHER_CAPACITY") };
    }
}
