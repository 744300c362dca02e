//! quill core library
//!
//! Foundation of the quill log stream engine: everything a log stream is
//! built from, independent of how it is scheduled.
//!
//! # Key Components
//!
//! - **Frame**: bit-exact binary layout of a record, with an in-place
//!   failure flag
//! - **Dispatcher**: lock-free multi-producer ring buffer with independent
//!   subscriber cursors and explicit backpressure
//! - **Storage**: the durable `LogStorage` contract, a segment-file backend
//!   and an in-memory backend
//! - **Testing**: fault-injecting storage for failure-path tests
//!
//! # Example
//!
//! ```ignore
//! use quill_core::prelude::*;
//!
//! let dispatcher = Dispatcher::new("partition-1", DispatcherConfig::default())?;
//! let mut subscription = dispatcher.open_subscription("appender")?;
//! dispatcher.offer(1, b"FOO")?;
//!
//! let storage = MemoryLogStorage::new();
//! subscription.poll(|fragment| {
//!     Frame::encode(fragment.stream_id(), fragment.payload())
//!         .and_then(|frame| storage.append(&frame))
//!         .map_or(FragmentResult::Postpone, |_| FragmentResult::Consume)
//! }, 16)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod prelude;
pub mod storage;
pub mod testing;
pub mod types;

// Re-export key types at crate root for convenience
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherMode};
pub use error::{QuillError, Result};
pub use storage::{FsLogStorage, LogStorage, MemoryLogStorage, StorageConfig};
pub use types::{PartitionId, Position, Term};
