//! Logging subsystem
//!
//! Structured logging via tracing with support for JSON (production) and
//! plaintext (development) output formats.
//!
//! # Environment Variables
//!
//! - `OVERLORD_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    /// Write to stdout
    #[default]
    Stdout,
    /// Write to stderr
    Stderr,
    /// Write to a file at the given path
    File(PathBuf),
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Default log level when no env filter is set
    pub default_level: Option<Level>,
}

impl LogConfig {
    /// Development configuration (plaintext to stdout, debug level)
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Some(Level::DEBUG),
        }
    }

    /// Production configuration (JSON to stdout, info level)
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Some(Level::INFO),
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build an EnvFilter from environment variables or the default level.
///
/// Checks OVERLORD_LOG first, then RUST_LOG, falling back to the default.
fn build_env_filter(default_level: Option<Level>) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var("OVERLORD_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    let level = default_level.unwrap_or(Level::INFO);
    Ok(EnvFilter::try_new(level.as_str().to_lowercase())?)
}

/// Initialize the logging subsystem with the given configuration.
///
/// Call once at application startup; subsequent calls return an error.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let filter = build_env_filter(config.default_level)?;

    match (&config.format, &config.output) {
        (LogFormat::Json, output) => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true);
            match output {
                LogOutput::Stdout => tracing_subscriber::registry()
                    .with(layer.with_writer(io::stdout).with_filter(filter))
                    .try_init()?,
                LogOutput::Stderr => tracing_subscriber::registry()
                    .with(layer.with_writer(io::stderr).with_filter(filter))
                    .try_init()?,
                LogOutput::File(path) => {
                    let file = Arc::new(File::create(path)?);
                    tracing_subscriber::registry()
                        .with(layer.with_writer(file).with_filter(filter))
                        .try_init()?
                }
            }
        }
        (LogFormat::Plaintext, output) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false);
            match output {
                LogOutput::Stdout => tracing_subscriber::registry()
                    .with(layer.with_writer(io::stdout).with_filter(filter))
                    .try_init()?,
                LogOutput::Stderr => tracing_subscriber::registry()
                    .with(layer.with_writer(io::stderr).with_filter(filter))
                    .try_init()?,
                LogOutput::File(path) => {
                    let file = Arc::new(File::create(path)?);
                    tracing_subscriber::registry()
                        .with(layer.with_writer(file).with_filter(filter))
                        .try_init()?
                }
            }
        }
    }
    Ok(())
}
