//! Logging configuration and initialization
//!
//! This module provides centralized logging setup using the `tracing` ecosystem.
//! It supports both human-readable and JSON output formats, configurable via
//! environment variables or programmatically.
//!
//! Sessions carry a [`DebugLevel`] (the classic `DEBUG..FATAL` scale). The
//! active level is process-wide and gates the tensor/params dump helpers in
//! [`crate::session::debug`]; it never changes the tracing filter itself.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "debug,shl=trace")
//! - `SHL_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `SHL_LOG_FORMAT`: Output format ("human" or "json")
//! - `SHL_LOG_FILE`: Optional file path for log output (JSON format)

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Active session debug level, stored as its integer code
static DEBUG_LEVEL: AtomicI32 = AtomicI32::new(DebugLevel::Warning as i32);

/// Environment variable for log level override
const LOG_LEVEL_ENV: &str = "SHL_LOG_LEVEL";

/// Environment variable for log format (json/human)
const LOG_FORMAT_ENV: &str = "SHL_LOG_FORMAT";

/// Environment variable for log file path
const LOG_FILE_ENV: &str = "SHL_LOG_FILE";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Invalid log level string provided
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}")]
    InvalidLogFormat(String),

    /// Failed to create log file directory
    #[error("failed to create log directory: {0}")]
    DirectoryCreationFailed(String),

    /// Failed to open log file
    #[error("failed to open log file: {0}")]
    FileOpenFailed(String),

    /// Another global subscriber was already installed
    #[error("failed to install subscriber: {0}")]
    InitFailed(String),
}

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }

    /// Convert to EnvFilter string
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

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLogLevel(s.to_string())),
        }
    }
}

/// Session debug level.
///
/// Lower values are more verbose. `Warning` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum DebugLevel {
    Debug = -2,
    Info = -1,
    #[default]
    Warning = 0,
    Error = 1,
    Fatal = 2,
}

impl DebugLevel {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -2 => Some(DebugLevel::Debug),
            -1 => Some(DebugLevel::Info),
            0 => Some(DebugLevel::Warning),
            1 => Some(DebugLevel::Error),
            2 => Some(DebugLevel::Fatal),
            _ => None,
        }
    }

    /// Nearest tracing level
    pub fn as_log_level(self) -> LogLevel {
        match self {
            DebugLevel::Debug => LogLevel::Debug,
            DebugLevel::Info => LogLevel::Info,
            DebugLevel::Warning => LogLevel::Warn,
            DebugLevel::Error | DebugLevel::Fatal => LogLevel::Error,
        }
    }
}

/// Set the process-wide session debug level
pub fn set_debug_level(level: DebugLevel) {
    DEBUG_LEVEL.store(level as i32, Ordering::Relaxed);
}

/// Current process-wide session debug level
pub fn debug_level() -> DebugLevel {
    DebugLevel::from_code(DEBUG_LEVEL.load(Ordering::Relaxed)).unwrap_or_default()
}

/// True when messages at `level` should be emitted
pub fn debug_enabled(level: DebugLevel) -> bool {
    level >= debug_level()
}

/// Log format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output (default)
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" | "console" => Ok(LogFormat::Human),
            "json" | "structured" => Ok(LogFormat::Json),
            other => Err(LoggingError::InvalidLogFormat(other.to_string())),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Whether to include file/line in logs
    pub with_file_info: bool,
    /// Whether to emit span close events (kernel timing)
    pub with_span_events: bool,
    /// Optional file path for JSON log output
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    /// Build a configuration from `SHL_LOG_*` environment variables
    pub fn from_env() -> Self {
        let mut config = LoggingConfig::new()
            .with_level(
                std::env::var(LOG_LEVEL_ENV)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_default(),
            )
            .with_format(
                std::env::var(LOG_FORMAT_ENV)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_default(),
            );
        if let Ok(file) = std::env::var(LOG_FILE_ENV) {
            config = config.with_log_file(PathBuf::from(file));
        }
        config
    }
}

/// Initialize logging with default configuration.
///
/// Uses the `SHL_LOG_*` environment variables if set. Idempotent: only the
/// first call installs a subscriber.
///
/// # Example
///
/// ```ignore
/// shl::logging::init_logging_default();
/// tracing::info!("kernels registered");
/// ```
pub fn init_logging_default() {
    init_logging_from_env().ok();
}

/// Initialize logging from environment variables.
///
/// This function is idempotent.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    init_with_config(&LoggingConfig::from_env())
}

/// Initialize logging with a custom configuration.
///
/// This function is idempotent. The error of the first attempt is returned;
/// later calls always succeed.
pub fn init_with_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    let mut result = Ok(());
    TRACING_INITIALIZED.get_or_init(|| {
        result = init_with_config_internal(config);
    });
    result
}

fn init_with_config_internal(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(config.level)?;
    let file = match &config.log_file {
        Some(path) => Some(open_log_file(path)?),
        None => None,
    };

    let human = (config.format == LogFormat::Human).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(config.with_file_info)
            .with_line_number(config.with_file_info)
            .with_span_events(span_events(config.with_span_events))
    });
    let json = (config.format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_target(false)
            .with_file(config.with_file_info)
            .with_line_number(config.with_file_info)
            .with_span_events(span_events(config.with_span_events))
    });
    // File output is always JSON
    let file_layer = file.map(|file| {
        fmt::layer()
            .json()
            .with_writer(Mutex::new(file))
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_span_events(span_events(config.with_span_events))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(human)
        .with(json)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::InitFailed(e.to_string()))
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

fn open_log_file(log_path: &Path) -> Result<std::fs::File, LoggingError> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| LoggingError::DirectoryCreationFailed(e.to_string()))?;
    }

    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| LoggingError::FileOpenFailed(e.to_string()))
}

/// Build the environment filter for log level.
/// Tries RUST_LOG first (standard tracing convention), then SHL_LOG_LEVEL.
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log)
            .map_err(|e| LoggingError::InvalidLogLevel(e.to_string()));
    }

    if let Ok(shl_level) = std::env::var(LOG_LEVEL_ENV) {
        if let Ok(level) = shl_level.parse::<LogLevel>() {
            return Ok(EnvFilter::new(level.as_filter_str()));
        }
    }

    Ok(EnvFilter::new(default_level.as_filter_str()))
}

/// Check if tracing has been initialized
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}
