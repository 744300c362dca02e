//! Logging configuration.

use quill_core::config::{env_flag, env_var};
use std::fmt;
use std::str::FromStr;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers.
    Json,
    /// Multi-line human-readable output.
    Pretty,
    /// Single-line output.
    #[default]
    Compact,
}

impl LogFormat {
    /// Lowercase name, as accepted by `QUILL_LOG_FORMAT`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
            Self::Compact => "compact",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    /// Unknown names fall back to the default format.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            "compact" => Self::Compact,
            _ => Self::default(),
        })
    }
}

/// How [`init_tracing`](super::init_tracing) sets up the subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    log_format: LogFormat,
    /// `EnvFilter` directives, e.g. `info,quill_core=debug`.
    log_filter: String,
    include_location: bool,
    include_target: bool,
    include_thread_names: bool,
    include_thread_ids: bool,
    /// Write through the test harness capture instead of stdout.
    test_writer: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: "info".to_string(),
            include_location: false,
            include_target: true,
            include_thread_names: false,
            include_thread_ids: false,
            test_writer: false,
        }
    }
}

impl TracingConfig {
    /// Create a new builder.
    pub fn builder() -> TracingConfigBuilder {
        TracingConfigBuilder::default()
    }

    /// Configuration for tests: compact, debug level, captured output.
    pub fn for_tests() -> Self {
        Self::builder()
            .log_filter("debug")
            .test_writer(true)
            .build()
    }

    /// Read the configuration from the environment.
    ///
    /// - `QUILL_LOG_FORMAT`: `json`, `pretty` or `compact`. Unset means
    ///   pretty on a terminal and JSON otherwise.
    /// - `QUILL_LOG_LEVEL`, then `RUST_LOG`: filter directives
    /// - `QUILL_LOG_LOCATION`, `QUILL_LOG_THREAD_NAMES`,
    ///   `QUILL_LOG_THREAD_IDS`: boolean flags
    ///
    /// Unparseable flags count as unset.
    pub fn from_env() -> Self {
        let log_format = env_var::<String>("QUILL_LOG_FORMAT")
            .ok()
            .flatten()
            .and_then(|s| s.parse::<LogFormat>().ok())
            .unwrap_or_else(|| {
                if std::io::IsTerminal::is_terminal(&std::io::stdout()) {
                    LogFormat::Pretty
                } else {
                    LogFormat::Json
                }
            });

        let log_filter = ["QUILL_LOG_LEVEL", "RUST_LOG"]
            .into_iter()
            .find_map(|name| env_var::<String>(name).ok().flatten())
            .unwrap_or_else(|| "info".to_string());

        let flag = |name| env_flag(name).ok().flatten().unwrap_or(false);

        Self {
            log_format,
            log_filter,
            include_location: flag("QUILL_LOG_LOCATION"),
            include_target: true,
            include_thread_names: flag("QUILL_LOG_THREAD_NAMES"),
            include_thread_ids: flag("QUILL_LOG_THREAD_IDS"),
            test_writer: false,
        }
    }

    /// Output format.
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Filter directives.
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Whether file and line are logged.
    pub fn include_location(&self) -> bool {
        self.include_location
    }

    /// Whether the event target is logged.
    pub fn include_target(&self) -> bool {
        self.include_target
    }

    /// Whether thread names are logged.
    pub fn include_thread_names(&self) -> bool {
        self.include_thread_names
    }

    /// Whether thread ids are logged.
    pub fn include_thread_ids(&self) -> bool {
        self.include_thread_ids
    }

    /// Whether output goes through the test harness capture.
    pub fn test_writer(&self) -> bool {
        self.test_writer
    }
}

/// Builder for [`TracingConfig`]. Unset fields keep their defaults.
#[derive(Debug, Clone, Default)]
pub struct TracingConfigBuilder {
    log_format: Option<LogFormat>,
    log_filter: Option<String>,
    include_location: Option<bool>,
    include_target: Option<bool>,
    include_thread_names: Option<bool>,
    include_thread_ids: Option<bool>,
    test_writer: Option<bool>,
}

impl TracingConfigBuilder {
    /// Set the output format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.log_format = Some(format);
        self
    }

    /// Set the filter directives.
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Log file and line.
    pub fn include_location(mut self, include: bool) -> Self {
        self.include_location = Some(include);
        self
    }

    /// Log the event target.
    pub fn include_target(mut self, include: bool) -> Self {
        self.include_target = Some(include);
        self
    }

    /// Log thread names.
    pub fn include_thread_names(mut self, include: bool) -> Self {
        self.include_thread_names = Some(include);
        self
    }

    /// Log thread ids.
    pub fn include_thread_ids(mut self, include: bool) -> Self {
        self.include_thread_ids = Some(include);
        self
    }

    /// Route output through the test harness capture.
    pub fn test_writer(mut self, enable: bool) -> Self {
        self.test_writer = Some(enable);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TracingConfig {
        let defaults = TracingConfig::default();
        TracingConfig {
            log_format: self.log_format.unwrap_or(defaults.log_format),
            log_filter: self.log_filter.unwrap_or(defaults.log_filter),
            include_location: self.include_location.unwrap_or(defaults.include_location),
            include_target: self.include_target.unwrap_or(defaults.include_target),
            include_thread_names: self
                .include_thread_names
                .unwrap_or(defaults.include_thread_names),
            include_thread_ids: self
                .include_thread_ids
                .unwrap_or(defaults.include_thread_ids),
            test_writer: self.test_writer.unwrap_or(defaults.test_writer),
        }
    }
}
