//! Logging setup for processes embedding quill.
//!
//! Library code only emits `tracing` events; a binary or test harness
//! installs the subscriber once with [`init_tracing`].
//!
//! The format is chosen with `QUILL_LOG_FORMAT`:
//! - `json` for log shippers
//! - `pretty` for humans (default on a terminal)
//! - `compact` for single-line output
//!
//! # Example
//!
//! ```ignore
//! use quill_stream::observability::{LogFormat, TracingConfig, init_tracing};
//!
//! let _guard = init_tracing(TracingConfig::from_env())?;
//!
//! let config = TracingConfig::builder()
//!     .log_format(LogFormat::Json)
//!     .log_filter("info,quill_stream=debug")
//!     .build();
//! ```

mod config;
mod tracing_setup;

pub use config::{LogFormat, TracingConfig, TracingConfigBuilder};
pub use tracing_setup::{TracingGuard, init_tracing};

/// Span covering work on one log stream.
#[macro_export]
macro_rules! log_stream_span {
    ($stream:expr, $operation:expr) => {
        tracing::info_span!(
            "log_stream",
            stream = %$stream,
            operation = $operation
        )
    };
}
