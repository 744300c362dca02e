//! Storage configuration.

use crate::config::{env_flag, env_var};
use crate::error::{QuillError, Result};
use crate::types::PartitionId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest accepted segment size.
pub const MIN_SEGMENT_SIZE: u64 = 4 * 1024;

/// Configuration for [`FsLogStorage`](super::FsLogStorage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the segment files.
    pub directory: PathBuf,
    /// Segment size that triggers rotation.
    pub max_segment_size: u64,
    /// Sync after every append.
    ///
    /// When false, data is synced on `flush()`, `close()` and rotation.
    pub sync_on_append: bool,
    /// Write buffer size.
    pub buffer_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/tmp/quill/log"),
            max_segment_size: 128 * 1024 * 1024, // 128 MB
            sync_on_append: true,
            buffer_size: 64 * 1024, // 64 KB
        }
    }
}

impl StorageConfig {
    /// Configuration in a fresh temp directory, without per-append sync.
    pub fn in_memory() -> Self {
        Self {
            directory: std::env::temp_dir().join(format!("quill_log_{}", uuid::Uuid::new_v4())),
            sync_on_append: false,
            ..Self::default()
        }
    }

    /// Set the storage directory.
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Set sync on append.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }

    /// Set the rotation size.
    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Set the write buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Same settings, in the partition's subdirectory.
    pub fn for_partition(&self, partition: PartitionId) -> Self {
        let mut config = self.clone();
        config.directory = self
            .directory
            .join(format!("partition-{}", partition.as_u32()));
        config
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_size < MIN_SEGMENT_SIZE {
            return Err(QuillError::ConfigValue {
                field: "storage.max_segment_size".to_string(),
                cause: format!("{} is below {}", self.max_segment_size, MIN_SEGMENT_SIZE),
            });
        }
        if self.buffer_size == 0 {
            return Err(QuillError::ConfigValue {
                field: "storage.buffer_size".to_string(),
                cause: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Load overrides from the environment on top of the defaults.
    ///
    /// Reads `QUILL_DATA_DIR`, `QUILL_STORAGE_SYNC` and `QUILL_SEGMENT_SIZE`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(directory) = env_var::<PathBuf>("QUILL_DATA_DIR")? {
            config.directory = directory;
        }
        if let Some(sync) = env_flag("QUILL_STORAGE_SYNC")? {
            config.sync_on_append = sync;
        }
        if let Some(size) = env_var::<u64>("QUILL_SEGMENT_SIZE")? {
            config.max_segment_size = size;
        }
        config.validate()?;
        Ok(config)
    }

    /// Like [`from_env`](Self::from_env) but falls back to defaults on
    /// invalid values.
    pub fn from_env_or_default() -> Self {
        Self::from_env().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Invalid storage configuration, using defaults");
            Self::default()
        })
    }
}
