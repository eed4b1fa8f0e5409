//! Unified logging bootstrap for the Modbus master services
//!
//! Console output plus an optional daily rolling log file. The filter honours
//! `RUST_LOG` when it is set and falls back to the configured level otherwise.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::{Error, Result};

/// Environment variable overriding the configured log directory
pub const LOG_DIR_ENV: &str = "MBMASTER_LOG_DIR";

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809000Z [INFO] connection=plc1 Connected`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the log file prefix
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is not set (e.g. "info,mbmaster=debug")
    pub level: String,
    /// Directory for rolling log files; `None` disables file output
    pub log_dir: Option<PathBuf>,
    /// Write events to stdout
    pub console: bool,
    /// Write JSON lines to the log file instead of the bracketed format
    pub enable_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "mbmaster".to_string(),
            level: "info".to_string(),
            log_dir: None,
            console: true,
            enable_json: false,
        }
    }
}

/// Keeps the non-blocking file writer alive; drop it last on shutdown.
#[derive(Debug, Default)]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Resolve the log directory
///
/// Priority:
/// 1. `MBMASTER_LOG_DIR` environment variable
/// 2. `config_dir` from the service configuration
pub fn resolve_log_dir(config_dir: Option<&str>) -> Option<PathBuf> {
    match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => config_dir.filter(|d| !d.is_empty()).map(PathBuf::from),
    }
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(env_str) = std::env::var("RUST_LOG") {
        if !env_str.is_empty() {
            return EnvFilter::try_new(&env_str)
                .map_err(|e| Error::Logging(format!("Invalid RUST_LOG '{}': {}", env_str, e)));
        }
    }
    EnvFilter::try_new(level)
        .map_err(|e| Error::Logging(format!("Invalid log level '{}': {}", level, e)))
}

fn file_appender(dir: &Path, service_name: &str) -> Result<tracing_appender::rolling::RollingFileAppender> {
    fs::create_dir_all(dir)?;
    Ok(tracing_appender::rolling::daily(
        dir,
        format!("{}.log", service_name),
    ))
}

/// Initialize logging system with configuration
///
/// Fails if a global subscriber is already installed.
pub fn init_with_config(config: LogConfig) -> Result<LogGuard> {
    let filter = build_filter(&config.level)?;

    let console_layer = config.console.then(|| {
        fmt::layer()
            .with_ansi(true)
            .event_format(BracketedLevelFormat)
    });

    let mut guard = LogGuard::default();
    let (plain_file_layer, json_file_layer) = match &config.log_dir {
        Some(dir) => {
            let appender = file_appender(dir, &config.service_name)?;
            let (writer, worker_guard) = tracing_appender::non_blocking(appender);
            guard._file = Some(worker_guard);
            if config.enable_json {
                (
                    None,
                    Some(
                        fmt::layer()
                            .json()
                            .with_writer(writer)
                            .with_target(true)
                            .with_level(true),
                    ),
                )
            } else {
                (
                    Some(
                        fmt::layer()
                            .with_writer(writer)
                            .with_ansi(false)
                            .event_format(BracketedLevelFormat),
                    ),
                    None,
                )
            }
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(plain_file_layer)
        .with(json_file_layer)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

    tracing::info!(
        "Logging: {} level={} dir={:?}",
        config.service_name,
        config.level,
        config.log_dir
    );

    Ok(guard)
}

/// Console-only initialization at the given level
pub fn init(level: &str) -> Result<LogGuard> {
    init_with_config(LogConfig {
        level: level.to_string(),
        ..Default::default()
    })
}
