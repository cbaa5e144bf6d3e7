//! Logging for filter stages.
//!
//! Stages never touch a global log level. Each one is handed a [`Logger`]
//! carrying its tag and the most verbose [`LogLevel`] it may emit; the logger
//! forwards enabled lines to `tracing`, so the usual subscriber filtering
//! still applies on top.

use crate::config::LoggingConfig;
use crate::error::{FilterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Verbosity levels, least verbose first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum LogLevel {
    Error,
    Warning,
    #[default]
    Info,
    /// Lifecycle lines that should survive aggressive filtering.
    Essential,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Essential => write!(f, "essential"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}

/// Per-stage logging capability.
#[derive(Debug, Clone)]
pub struct Logger {
    tag: String,
    level: LogLevel,
}

impl Logger {
    pub fn new(tag: impl Into<String>, level: LogLevel) -> Self {
        Self {
            tag: tag.into(),
            level,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    /// Derive a logger for a helper owned by this stage (e.g. a dequeue thread).
    pub fn child(&self, suffix: &str) -> Self {
        Self {
            tag: format!("{}/{}", self.tag, suffix),
            level: self.level,
        }
    }

    #[inline]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.level
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Error) {
            tracing::error!(filter = %self.tag, "{}", args);
        }
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Warning) {
            tracing::warn!(filter = %self.tag, "{}", args);
        }
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Info) {
            tracing::info!(filter = %self.tag, "{}", args);
        }
    }

    pub fn essential(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Essential) {
            tracing::info!(filter = %self.tag, essential = true, "{}", args);
        }
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Debug) {
            tracing::debug!(filter = %self.tag, "{}", args);
        }
    }

    pub fn trace(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Trace) {
            tracing::trace!(filter = %self.tag, "{}", args);
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured directive. When a log file is
/// configured, a non-blocking file layer is added; keep the returned guard
/// alive for as long as logging should be flushed.
pub fn init_tracing(
    config: &LoggingConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.directive))
        .map_err(|e| FilterError::Config(format!("Invalid log directive: {}", e)))?;

    match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| FilterError::Config(format!("Invalid log file {:?}", path)))?;
            std::fs::create_dir_all(dir)?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()
                .map_err(|e| FilterError::Config(format!("Tracing already initialised: {}", e)))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .map_err(|e| FilterError::Config(format!("Tracing already initialised: {}", e)))?;
            Ok(None)
        }
    }
}
