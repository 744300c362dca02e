//! Registry of the log streams installed on this node, one per partition.

use crate::config::LogStreamConfig;
use crate::stream::LogStream;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use quill_core::error::{QuillError, Result};
use quill_core::storage::LogStorage;
use quill_core::types::PartitionId;
use std::sync::Arc;

/// Installs, looks up and removes the log streams of a node.
///
/// Streams are installed closed; callers open them once the partition is
/// ready. Removing a partition closes its stream and deletes its data.
pub struct LogStreamRegistry {
    config: LogStreamConfig,
    streams: DashMap<PartitionId, Arc<LogStream>>,
}

impl LogStreamRegistry {
    /// Create an empty registry. Each partition stores its segments in a
    /// subdirectory of `config.storage.directory`.
    pub fn new(config: LogStreamConfig) -> Self {
        Self {
            config,
            streams: DashMap::new(),
        }
    }

    /// Install a stream for `partition` over segment-file storage.
    pub fn install(&self, partition: PartitionId) -> Result<Arc<LogStream>> {
        let config = self
            .config
            .clone()
            .with_storage(self.config.storage.for_partition(partition));
        self.insert(partition, || LogStream::new(partition, config))
    }

    /// Install a stream for `partition` over the given storage.
    pub fn install_with_storage(
        &self,
        partition: PartitionId,
        storage: Arc<dyn LogStorage>,
    ) -> Result<Arc<LogStream>> {
        let config = self.config.clone();
        self.insert(partition, || {
            LogStream::with_storage(partition, config, storage)
        })
    }

    fn insert(
        &self,
        partition: PartitionId,
        create: impl FnOnce() -> Result<LogStream>,
    ) -> Result<Arc<LogStream>> {
        match self.streams.entry(partition) {
            Entry::Occupied(_) => Err(QuillError::PartitionExists { partition }),
            Entry::Vacant(entry) => {
                let stream = Arc::new(create()?);
                entry.insert(Arc::clone(&stream));
                tracing::info!(partition = %partition, "Installed log stream");
                Ok(stream)
            }
        }
    }

    /// The stream of `partition`.
    pub fn get(&self, partition: PartitionId) -> Option<Arc<LogStream>> {
        self.streams.get(&partition).map(|r| Arc::clone(&r))
    }

    /// Installed partitions in ascending order.
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<_> = self.streams.iter().map(|r| *r.key()).collect();
        partitions.sort();
        partitions
    }

    /// Number of installed streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether no stream is installed.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Uninstall `partition`: close its stream and delete its data.
    ///
    /// The stream stays installed when the delete fails, so the removal can
    /// be retried.
    pub async fn remove(&self, partition: PartitionId) -> Result<()> {
        let stream = self
            .get(partition)
            .ok_or(QuillError::PartitionNotFound { partition })?;
        if let Err(error) = stream.delete().await {
            tracing::warn!(partition = %partition, error = %error, "Failed to remove log stream");
            return Err(error);
        }
        self.streams
            .remove_if(&partition, |_, installed| Arc::ptr_eq(installed, &stream));
        tracing::info!(partition = %partition, "Removed log stream");
        Ok(())
    }

    /// Close every installed stream, keeping them installed.
    ///
    /// Every stream is closed even if some fail; the first error is returned.
    pub async fn close_all(&self) -> Result<()> {
        let streams: Vec<_> = self.streams.iter().map(|r| Arc::clone(r.value())).collect();
        let mut first_error = None;
        for stream in streams {
            if let Err(e) = stream.close().await {
                tracing::error!(stream = %stream.name(), error = %e, "Failed to close log stream");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for LogStreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStreamRegistry")
            .field("partitions", &self.partitions())
            .finish()
    }
}
