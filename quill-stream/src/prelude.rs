//! Prelude for convenient imports.
//!
//! Includes the core prelude.
//!
//! # Example
//!
//! ```ignore
//! use quill_stream::prelude::*;
//! ```

pub use quill_core::prelude::*;

pub use crate::config::LogStreamConfig;
pub use crate::registry::LogStreamRegistry;
pub use crate::stream::{
    AppendProgress, ConditionId, LogStream, LogStreamReader, LogStreamStatus, LogStreamWriter,
    LoggedRecord,
};
