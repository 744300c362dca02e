//! Common test utilities for integration tests.

#![allow(dead_code)]

use quill_core::storage::{LogStorage, MemoryLogStorage, StorageConfig};
use quill_core::testing::{FaultPlan, FaultyStorage};
use quill_core::types::{PartitionId, Position};
use quill_stream::{LogStream, LogStreamConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for anything a test waits on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Stream configuration with a small buffer and a short idle interval.
pub fn test_config() -> LogStreamConfig {
    LogStreamConfig::in_memory().with_idle_poll_interval_ms(5)
}

/// Stream configuration storing segments under `dir`.
pub fn fs_config(dir: &Path) -> LogStreamConfig {
    test_config().with_storage(
        StorageConfig::default()
            .with_directory(dir)
            .with_sync(false),
    )
}

/// A closed stream over in-memory storage.
pub fn memory_stream() -> (LogStream, Arc<MemoryLogStorage>) {
    let storage = Arc::new(MemoryLogStorage::new());
    let stream = LogStream::with_storage(
        PartitionId::new(1),
        test_config(),
        Arc::clone(&storage) as Arc<dyn LogStorage>,
    )
    .unwrap();
    (stream, storage)
}

/// A closed stream whose storage fails according to `plan`.
pub fn faulty_stream(plan: FaultPlan) -> (LogStream, Arc<FaultyStorage<MemoryLogStorage>>) {
    let storage = Arc::new(FaultyStorage::new(MemoryLogStorage::new(), plan));
    let stream = LogStream::with_storage(
        PartitionId::new(1),
        test_config(),
        Arc::clone(&storage) as Arc<dyn LogStorage>,
    )
    .unwrap();
    (stream, storage)
}

/// Wait until `position` is durable, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_for(stream: &LogStream, position: Position) -> Position {
    tokio::time::timeout(WAIT_TIMEOUT, stream.wait_for_position(position))
        .await
        .expect("timed out waiting for position")
        .unwrap()
}

/// Poll `condition` until it holds, panicking after [`WAIT_TIMEOUT`].
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
