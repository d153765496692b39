//! Tracing subscriber setup.
//!
//! All library code logs through `tracing` macros with structured fields. The
//! binary calls [`init`] once at startup; `RUST_LOG` takes
//! precedence over the configured level when set.
//!
//! # Example
//! ```no_run
//! use tpx_daq::logging::{self, LoggingConfig, OutputFormat};
//!
//! let config = LoggingConfig {
//!     level: "debug".into(),
//!     format: OutputFormat::Compact,
//!     ..Default::default()
//! };
//! logging::init(&config).unwrap();
//! tracing::info!(chip_id = "D4-W0005", "Device ready");
//! ```

use crate::error::{DaqError, DaqResult};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored output for interactive runs.
    Pretty,
    /// Single-line output for long scans piped to a file.
    Compact,
    /// JSON lines for log aggregation.
    Json,
}

/// Logging section of the application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_level")]
    pub level: String,
    /// Output format.
    #[serde(default = "default_format")]
    pub format: OutputFormat,
    /// Include span open/close events.
    #[serde(default)]
    pub with_span_events: bool,
    /// Include source file and line.
    #[serde(default)]
    pub with_file_and_line: bool,
    /// Include thread names. Useful to tell producer-thread notifications apart.
    #[serde(default = "default_true")]
    pub with_thread_names: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> OutputFormat {
    OutputFormat::Compact
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
        }
    }
}

impl LoggingConfig {
    /// Check the level string.
    pub fn validate(&self) -> DaqResult<()> {
        parse_log_level(&self.level).map(|_| ())
    }
}

/// Initialize the global subscriber.
///
/// Idempotent: if a subscriber is already installed (tests, embedding
/// applications) this returns `Ok(())`.
pub fn init(config: &LoggingConfig) -> DaqResult<()> {
    let level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(DaqError::Config(format!("Failed to initialize tracing: {e}")))
            }
        })
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> DaqResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(DaqError::Config(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

fn level_to_filter_string(level: Level) -> String {
    level.as_str().to_ascii_lowercase()
}
