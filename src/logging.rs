//! Logging setup.
//!
//! Structured logging through `tracing`, rendered by `tracing-subscriber` on
//! stderr in one of three formats (pretty, compact, JSON). `RUST_LOG` overrides
//! the configured level.
//!
//! # Example
//! ```no_run
//! use sweep_daq::{config::SweepConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SweepConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(driver = %config.source.driver, "Application started");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

use crate::config::SweepConfig;

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (interactive use)
    Pretty,
    /// One line per event, no colors
    Compact,
    /// One JSON object per event (log collection)
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                s
            )),
        }
    }
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Maximum level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit span open/close events
    pub with_span_events: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Colors (pretty format only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Options from the `[application]` section.
    pub fn from_config(config: &SweepConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Options with the given level.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize logging from the loaded configuration.
pub fn init_from_config(config: &SweepConfig) -> Result<(), String> {
    init(LoggingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed (tests, embedding
/// applications) this returns `Ok(())`.
pub fn init(config: LoggingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_target(false);

    let result = match config.format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(base.pretty().with_ansi(config.with_ansi).with_filter(env_filter))
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(base.compact().with_ansi(false).with_filter(env_filter))
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(base.json().with_filter(env_filter))
            .try_init(),
    };

    result.or_else(already_initialized)
}

fn already_initialized(e: TryInitError) -> Result<(), String> {
    if e.to_string()
        .contains("a global default trace dispatcher has already been set")
    {
        Ok(())
    } else {
        Err(format!("Failed to initialize logging: {}", e))
    }
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}
