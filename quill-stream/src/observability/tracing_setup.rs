//! Subscriber installation.

use super::config::{LogFormat, TracingConfig};
use anyhow::{Context, Result};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Returned by [`init_tracing`]; keep it alive for the life of the process.
#[derive(Debug)]
#[must_use = "dropping the guard immediately is almost never intended"]
pub struct TracingGuard {
    format: LogFormat,
}

impl TracingGuard {
    /// Format the subscriber was installed with.
    pub fn format(&self) -> LogFormat {
        self.format
    }
}

/// Install the global tracing subscriber.
///
/// An invalid filter falls back to `info`. Fails if a global subscriber is
/// already installed.
///
/// # Example
///
/// ```ignore
/// let _guard = init_tracing(TracingConfig::from_env())?;
/// ```
pub fn init_tracing(config: TracingConfig) -> Result<TracingGuard> {
    let filter = EnvFilter::try_new(config.log_filter()).unwrap_or_else(|e| {
        eprintln!(
            "Invalid log filter '{}' ({}), using 'info'",
            config.log_filter(),
            e
        );
        EnvFilter::new("info")
    });

    tracing_subscriber::registry()
        .with(fmt_layer(&config).with_filter(filter))
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(TracingGuard {
        format: config.log_format(),
    })
}

/// Build the fmt layer for the configured format and writer.
fn fmt_layer(config: &TracingConfig) -> BoxedLayer {
    let layer = fmt::layer()
        .with_file(config.include_location())
        .with_line_number(config.include_location())
        .with_target(config.include_target())
        .with_thread_names(config.include_thread_names())
        .with_thread_ids(config.include_thread_ids());

    match (config.log_format(), config.test_writer()) {
        (LogFormat::Json, false) => layer
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .flatten_event(true)
            .boxed(),
        (LogFormat::Json, true) => layer
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .flatten_event(true)
            .with_test_writer()
            .boxed(),
        (LogFormat::Pretty, false) => layer.pretty().boxed(),
        (LogFormat::Pretty, true) => layer.pretty().with_test_writer().boxed(),
        (LogFormat::Compact, false) => layer.compact().boxed(),
        (LogFormat::Compact, true) => layer.compact().with_test_writer().boxed(),
    }
}
