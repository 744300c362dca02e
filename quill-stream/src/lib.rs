//! quill stream library
//!
//! The execution side of the quill log stream engine: one [`LogStream`] per
//! partition, each with a write buffer producers claim frames in, a single
//! appender task persisting committed frames in order, and a lifecycle
//! controller.
//!
//! # Key Components
//!
//! - **LogStream**: lifecycle (`open`, `close`, `delete`), term and commit
//!   position, append conditions, writer and reader handles
//! - **LogStorageAppender**: drains the write buffer into `LogStorage`
//!   and fails the stream on the first storage error
//! - **LogStreamRegistry**: the streams installed on a node, by partition
//! - **Observability**: tracing subscriber setup
//!
//! # Example
//!
//! ```ignore
//! use quill_stream::prelude::*;
//!
//! let stream = LogStream::new(PartitionId::new(1), LogStreamConfig::from_env()?)?;
//! stream.open().await?;
//!
//! let writer = stream.writer(1)?;
//! writer.write(b"job created")?;
//! stream.wait_for_position(Position::FIRST).await?;
//!
//! for record in stream.reader() {
//!     let record = record?;
//!     println!("{} {:?}", record.position, record.payload);
//! }
//! stream.close().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod observability;
pub mod prelude;
pub mod registry;
pub mod stream;

pub use config::LogStreamConfig;
pub use registry::LogStreamRegistry;
pub use stream::{
    ConditionId, LogStorageAppender, LogStream, LogStreamReader, LogStreamStatus, LogStreamWriter,
    LoggedRecord,
};
