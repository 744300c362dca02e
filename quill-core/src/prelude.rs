//! Prelude for convenient imports.
//!
//! # Example
//!
//! ```ignore
//! use quill_core::prelude::*;
//! ```

// Core types
pub use crate::types::{PartitionId, Position, Term};

// Error handling
pub use crate::error::{QuillError, Result};

// Frames
pub use crate::frame::{Frame, FrameHeader};

// Dispatcher
pub use crate::dispatcher::{
    ClaimedFragment, Dispatcher, DispatcherConfig, DispatcherMode, Fragment, FragmentResult,
    Subscription,
};

// Storage
pub use crate::storage::{FsLogStorage, LogStorage, MemoryLogStorage, StorageConfig};
