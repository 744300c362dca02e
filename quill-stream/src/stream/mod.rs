//! Log streams: write buffer, storage appender and lifecycle.
//!
//! A [`LogStream`] owns a pipeline-mode [`Dispatcher`](quill_core::Dispatcher)
//! as its write buffer. The first subscription belongs to the
//! [`LogStorageAppender`]; subscriptions opened through
//! [`LogStream::open_buffer_subscription`] trail it and therefore only see
//! frames whose durability has been decided.

mod appender;
mod conditions;
mod controller;
mod metrics;
mod reader;
mod state;
mod writer;

pub use appender::{APPENDER_SUBSCRIPTION, AppenderCommand, LogStorageAppender, TurnOutcome};
pub use conditions::ConditionId;
pub use controller::LogStream;
pub use metrics::LogStreamMetrics;
pub use reader::{LogStreamReader, LoggedRecord};
pub use state::{AppendProgress, LogStreamStatus};
pub use writer::LogStreamWriter;
