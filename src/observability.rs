//! Logging setup and the `ENERGY_FORECAST_*` environment helpers shared with settings.

use std::env;
use std::io;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub(crate) const ENV_PREFIX: &str = "ENERGY_FORECAST";

/// Output style of log lines. Logs go to stderr; stdout carries the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `energy_forecast=debug`.
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

/// Unparseable values are ignored; nothing can be logged about them yet.
pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: env_var("LOG_LEVEL").unwrap_or(defaults.level),
        format: env_var("LOG_FORMAT")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.format),
        include_target: env_var("LOG_TARGET")
            .and_then(|raw| parse_bool(&raw))
            .unwrap_or(defaults.include_target),
    }
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(config.include_target);

    match config.format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(builder.json().with_ansi(false).finish())?
        }
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(config: &LoggingConfig, experiment_name: &str) {
    info!(
        component = "energy_forecast",
        event = "app.start",
        experiment = experiment_name,
        log_level = %config.level,
        log_format = ?config.format
    );
}

pub fn log_service_selected(base_url: &str, authenticated: bool, run_timeout_ms: u64) {
    info!(
        component = "energy_forecast",
        event = "service.selected",
        base_url,
        authenticated,
        run_timeout_ms
    );
}

pub fn log_report_written(path: &Path, rows: usize) {
    info!(
        component = "energy_forecast",
        event = "report.written",
        path = %path.display(),
        rows
    );
}

/// Trimmed value of `ENERGY_FORECAST_<suffix>`; blank counts as unset.
pub(crate) fn env_var(suffix: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{suffix}"))
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
