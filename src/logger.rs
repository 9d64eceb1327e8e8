//! Structured logging
//!
//! This module provides functionality for:
//! 1. Installing the global `tracing` subscriber from the `[logging]` config section
//! 2. Writing logs to a daily rotating file in JSON or line format
//! 3. Recording upload, dedup and delete operations with consistent fields

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan, time::UtcTime},
    prelude::*,
};

use crate::config_loader::AppConfig;

const LOG_FILE_PREFIX: &str = "imghost.log";

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Kind of operation a log entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryType {
    Upload,
    Dedup,
    Delete,
    System,
    Error,
}

impl std::fmt::Display for LogEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogEntryType::Upload => write!(f, "upload"),
            LogEntryType::Dedup => write!(f, "dedup"),
            LogEntryType::Delete => write!(f, "delete"),
            LogEntryType::System => write!(f, "system"),
            LogEntryType::Error => write!(f, "error"),
        }
    }
}

/// Status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Started,
    Completed,
    Failed,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Started => write!(f, "started"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Owns the installed subscriber's file writer; dropping it flushes pending lines
pub struct Logger {
    log_dir: PathBuf,
    _guard: Option<WorkerGuard>,
}

impl Logger {
    /// Install the global subscriber described by `config`
    pub fn new(config: &AppConfig) -> LoggerResult<Self> {
        let log_dir = PathBuf::from(&config.paths.log_directory);
        let logging = &config.logging;

        if logging.log_to_file && !log_dir.exists() {
            std::fs::create_dir_all(&log_dir)?;
        }

        let guard = Self::init_subscriber(
            &log_dir,
            &logging.log_format,
            &logging.log_level,
            logging.log_to_file,
            logging.log_to_terminal,
        )?;

        Ok(Self {
            log_dir,
            _guard: guard,
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn init_subscriber(
        log_dir: &Path,
        format: &str,
        level: &str,
        to_file: bool,
        to_terminal: bool,
    ) -> LoggerResult<Option<WorkerGuard>> {
        let filter = build_filter(level)?;
        let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
        let mut guard = None;

        if to_file {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);

            let layer = match format {
                "json" => fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_timer(UtcTime::rfc_3339())
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed(),
                _ => fmt::layer()
                    .with_ansi(false)
                    .with_writer(non_blocking)
                    .with_timer(UtcTime::rfc_3339())
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed(),
            };
            layers.push(layer);
        }

        if to_terminal {
            layers.push(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .boxed(),
            );
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(filter)
            .try_init()
            .map_err(|e| LoggerError::Logging(e.to_string()))?;

        info!(
            log_format = format,
            log_level = level,
            log_to_file = to_file,
            log_to_terminal = to_terminal,
            "Logger initialized"
        );

        Ok(guard)
    }

    /// Log an upload that went through the transfer stage
    pub fn log_upload(&self, filename: &str, hash: Option<&str>, status: OperationStatus, size: Option<u64>) {
        info!(
            entry_type = %LogEntryType::Upload,
            filename,
            hash,
            status = %status,
            size,
            timestamp = %Utc::now().to_rfc3339(),
            "Upload {} for {}", status, filename
        );
    }

    /// Log a short-circuited duplicate
    pub fn log_dedup(&self, filename: &str, hash: &str) {
        info!(
            entry_type = %LogEntryType::Dedup,
            filename,
            hash,
            timestamp = %Utc::now().to_rfc3339(),
            "Skipped duplicate {}", filename
        );
    }

    /// Log a delete request
    pub fn log_delete(&self, url: &str, status: OperationStatus) {
        info!(
            entry_type = %LogEntryType::Delete,
            url,
            status = %status,
            timestamp = %Utc::now().to_rfc3339(),
            "Delete {} for {}", status, url
        );
    }

    pub fn log_system_event(&self, event_type: &str, details: &str) {
        info!(
            entry_type = %LogEntryType::System,
            event_type,
            details,
            timestamp = %Utc::now().to_rfc3339(),
            "System event: {}", event_type
        );
    }

    pub fn log_error(&self, error_type: &str, message: &str, details: Option<&str>) {
        error!(
            entry_type = %LogEntryType::Error,
            error_type,
            details,
            timestamp = %Utc::now().to_rfc3339(),
            "Error: {}", message
        );
    }
}

/// `RUST_LOG` when set, otherwise the configured level
fn build_filter(level: &str) -> LoggerResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| LoggerError::Logging(e.to_string()))
}

/// Install logging for the application
pub fn init_logger(config: &AppConfig) -> LoggerResult<Logger> {
    Logger::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_build_filter_accepts_directives() {
        assert!(build_filter("debug").is_ok());
        assert!(build_filter("imghost=trace,reqwest=warn").is_ok());
    }

    #[test]
    fn test_logger_creates_log_directory() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.log_directory = dir.path().join("logs").to_string_lossy().into_owned();
        config.logging.log_to_terminal = false;

        let logger = Logger::new(&config).unwrap();
        logger.log_system_event("test", "logger online");

        assert!(logger.log_dir().exists());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(LogEntryType::Dedup.to_string(), "dedup");
        assert_eq!(OperationStatus::Failed.to_string(), "failed");
    }
}
