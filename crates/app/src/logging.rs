//! Logging setup for ledgermesh.
//!
//! Configures the global `tracing` subscriber once at startup. The level
//! comes from the command line or the `[logging]` section, unless
//! `RUST_LOG` is set.
//!
//! # Log Formats
//!
//! - **Text** ([`LogFormat::Text`]): Human-readable, optionally colored
//! - **JSON** ([`LogFormat::Json`]): One JSON object per line, for log aggregation

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable text format with optional ANSI colors.
    #[default]
    Text,
    /// Structured JSON format for machine parsing.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

/// Logging configuration options.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to output.
    pub level: Level,
    /// Output format (text or JSON).
    pub format: LogFormat,
    /// Enable ANSI color codes (text format only).
    pub ansi_colors: bool,
    /// Include file/line source locations in output.
    pub with_source_location: bool,
    /// Include thread IDs in output.
    pub with_thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Text,
            ansi_colors: true,
            with_source_location: false,
            with_thread_ids: false,
        }
    }
}

impl LogConfig {
    /// Create a verbose debug configuration.
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            format: LogFormat::Text,
            ansi_colors: true,
            with_source_location: true,
            with_thread_ids: true,
        }
    }

    /// Create a JSON logging configuration.
    pub fn json() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            ansi_colors: false,
            with_source_location: true,
            with_thread_ids: true,
        }
    }

    /// Set the log level from a string. Unknown names fall back to INFO.
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = match level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        self
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        if format == LogFormat::Json {
            self.ansi_colors = false;
        }
        self
    }
}

/// Noisy dependency targets kept at WARN.
const QUIET_TARGETS: &[&str] = &["rustls=warn", "tokio_rustls=warn"];

/// Filter for `level` with the TLS stack held at WARN.
fn base_filter(level: Level) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::new(level.as_str().to_lowercase());
    for directive in QUIET_TARGETS {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Initialize the global logging subscriber.
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => base_filter(config.level)?,
    };

    match config.format {
        LogFormat::Text => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_ansi(config.ansi_colors)
                .with_target(true)
                .with_thread_ids(config.with_thread_ids)
                .with_file(config.with_source_location)
                .with_line_number(config.with_source_location);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_thread_ids(config.with_thread_ids)
                .with_file(config.with_source_location)
                .with_line_number(config.with_source_location)
                .with_span_list(true)
                .with_current_span(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    Ok(())
}
