//! Logging setup for graphforge
//!
//! All runtime diagnostics go through `tracing`. Invocations open a
//! `model.predict` span and every node runs inside a `graph.node` span, so a
//! subscriber with span events enabled shows per-node timings without the
//! profiling collector.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g. "info", "graphforge::memory=trace")
//! - `GRAPHFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `GRAPHFORGE_LOG_FORMAT`: Output format ("human" or "json")
//! - `GRAPHFORGE_LOG_FILE`: Optional path for an additional JSON log file

use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

type FilteredRegistry = tracing_subscriber::layer::Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "GRAPHFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "GRAPHFORGE_LOG_FORMAT";
const LOG_FILE_ENV: &str = "GRAPHFORGE_LOG_FILE";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("failed to open log file {path}: {reason}")]
    FileOpenFailed { path: PathBuf, reason: String },

    #[error("global subscriber already set: {0}")]
    AlreadySet(String),
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse a level name, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Emit an event when each span closes (gives node durations)
    pub with_span_events: bool,
    /// Additional JSON log file
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from `GRAPHFORGE_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(level) = std::env::var(LOG_LEVEL_ENV).ok().and_then(|s| LogLevel::parse(&s)) {
            config.level = level;
        }
        if let Some(format) = std::env::var(LOG_FORMAT_ENV).ok().and_then(|s| LogFormat::parse(&s)) {
            config.format = format;
        }
        config.log_file = std::env::var(LOG_FILE_ENV).ok().map(PathBuf::from);
        config
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

/// Initialize logging from the environment, ignoring errors.
///
/// Idempotent: only the first call installs a subscriber.
pub fn init_logging_default() {
    init_with_config(&LoggingConfig::from_env());
}

/// Initialize logging with an explicit configuration.
///
/// Idempotent. Failures (for example a host application that already
/// installed its own subscriber) are reported on stderr and otherwise ignored.
pub fn init_with_config(config: &LoggingConfig) {
    TRACING_INITIALIZED.get_or_init(|| {
        if let Err(e) = try_init(config) {
            eprintln!("graphforge: logging not initialized: {e}");
        }
    });
}

fn try_init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_env_filter(config.level)?;
    let span_events = if config.with_span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    layers.push(match config.format {
        LogFormat::Human => fmt::layer()
            .with_target(true)
            .with_span_events(span_events.clone())
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(false)
            .with_span_events(span_events.clone())
            .boxed(),
    });

    if let Some(path) = &config.log_file {
        layers.push(
            fmt::layer()
                .json()
                .with_writer(std::sync::Mutex::new(open_log_file(path)?))
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(span_events)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
        .map_err(|e| LoggingError::AlreadySet(e.to_string()))
}

fn open_log_file(path: &Path) -> Result<std::fs::File, LoggingError> {
    let fail = |e: std::io::Error| LoggingError::FileOpenFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(fail)?;
        }
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(fail)
}

/// `RUST_LOG` wins over the configured level.
fn build_env_filter(level: LogLevel) -> Result<EnvFilter, LoggingError> {
    match std::env::var("RUST_LOG") {
        Ok(rust_log) => {
            EnvFilter::try_new(rust_log).map_err(|e| LoggingError::InvalidFilter(e.to_string()))
        }
        Err(_) => Ok(EnvFilter::new(level.as_filter_str())),
    }
}

pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse(" debug "), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Human));
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn test_logging_config_builder() {
        let config = LoggingConfig::new()
            .with_level(LogLevel::Trace)
            .with_format(LogFormat::Json)
            .with_span_events(true)
            .with_log_file("/tmp/graphforge.log");

        assert_eq!(config.level, LogLevel::Trace);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.with_span_events);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/graphforge.log")));
    }

    #[test]
    fn test_init_is_idempotent() {
        init_logging_default();
        init_logging_default();
        assert!(is_initialized());
    }
}
