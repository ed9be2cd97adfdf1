//! Logging setup driven by `AGRIFUSION_LOG_*` environment variables.

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{env_trimmed, parse_bool};
use crate::sources::SourceTables;

pub const LOG_LEVEL_ENV: &str = "AGRIFUSION_LOG_LEVEL";
pub const LOG_FORMAT_ENV: &str = "AGRIFUSION_LOG_FORMAT";
pub const LOG_TARGET_ENV: &str = "AGRIFUSION_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `agrifusion=debug`.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Unrecognized format or target values fall back to the defaults.
pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: env_trimmed(LOG_LEVEL_ENV).unwrap_or(defaults.level),
        format: env_trimmed(LOG_FORMAT_ENV)
            .and_then(|raw| LogFormat::parse(&raw))
            .unwrap_or(defaults.format),
        include_target: env_trimmed(LOG_TARGET_ENV)
            .and_then(|raw| parse_bool(&raw))
            .unwrap_or(defaults.include_target),
    }
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_writer(std::io::stderr)
        .with_ansi(config.format == LogFormat::Pretty);

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(config: &LoggingConfig) {
    info!(
        component = "fusion_report",
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

/// `origin` names where the tables came from: a directory path, or `memory`.
pub fn log_sources_loaded(origin: &str, tables: &SourceTables) {
    info!(
        component = "sources",
        event = "sources.loaded",
        origin,
        monitoring_rows = tables.monitoring.len(),
        weather_rows = tables.weather.len(),
        soil_rows = tables.soil.len(),
        yield_history_rows = tables.yield_history.len()
    );
}
