//! Experiment settings assembled from `ENERGY_FORECAST_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use tracing::warn;

use crate::config::{ForecastingJobConfig, PrimaryMetric};
use crate::dataset::{parse_timestamp, DatasetConfig};
use crate::observability::{env_var, parse_bool, ENV_PREFIX};
use crate::service::ServiceConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSettings {
    pub dataset: DatasetConfig,
    pub split_cutoff: NaiveDateTime,
    /// Trailing training rows per grain sent along with the test query.
    pub context_rows: usize,
    pub job: ForecastingJobConfig,
    pub service: ServiceConfig,
    pub output_csv: Option<PathBuf>,
    pub explain: bool,
    pub top_features: usize,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            dataset: DatasetConfig::default(),
            split_cutoff: default_cutoff(),
            context_rows: 0,
            job: ForecastingJobConfig::default(),
            service: ServiceConfig::default(),
            output_csv: None,
            explain: false,
            top_features: 10,
        }
    }
}

fn default_cutoff() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2017, 2, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

impl ExperimentSettings {
    pub fn from_env() -> Self {
        let mut s = Self::default();

        if let Some(path) = env_var("DATA_PATH") {
            s.dataset.path = PathBuf::from(path);
        }
        if let Some(column) = env_var("TIME_COLUMN") {
            s.dataset.time_column = column.clone();
            s.job.time_series.time_column_name = column;
        }
        if let Some(column) = env_var("TARGET_COLUMN") {
            s.dataset.target_column = column;
        }
        if let Some(column) = env_var("GRAIN_COLUMN") {
            s.dataset.grain_column = Some(column.clone());
            s.job.time_series.grain_column_names = vec![column];
        }
        if let Some(raw) = env_var("FEATURE_COLUMNS") {
            s.dataset.feature_columns = Some(split_list(&raw));
        }
        if let Some(tz) = parsed::<Tz>("SOURCE_TIMEZONE") {
            s.dataset.source_timezone = Some(tz);
        }
        if let Some(raw) = env_var("KEEP_MISSING_TARGET") {
            match parse_bool(&raw) {
                Some(keep) => s.dataset.drop_missing_target = !keep,
                None => invalid("KEEP_MISSING_TARGET", &raw),
            }
        }

        if let Some(raw) = env_var("SPLIT_CUTOFF") {
            match parse_timestamp(&raw, s.dataset.source_timezone) {
                Some(cutoff) => s.split_cutoff = cutoff,
                None => invalid("SPLIT_CUTOFF", &raw),
            }
        }
        if let Some(rows) = parsed("CONTEXT_ROWS") {
            s.context_rows = rows;
        }

        if let Some(name) = env_var("EXPERIMENT") {
            s.job.experiment_name = name;
        }
        if let Some(raw) = env_var("PRIMARY_METRIC") {
            match PrimaryMetric::parse(&raw) {
                Some(metric) => s.job.primary_metric = metric,
                None => invalid("PRIMARY_METRIC", &raw),
            }
        }
        if let Some(iterations) = parsed("ITERATIONS") {
            s.job.iterations = iterations;
        }
        if let Some(minutes) = parsed("ITERATION_TIMEOUT_MINUTES") {
            s.job.iteration_timeout_minutes = minutes;
        }
        if let Some(folds) = parsed("CV_FOLDS") {
            s.job.n_cross_validations = folds;
        }
        if let Some(horizon) = parsed("MAX_HORIZON") {
            s.job.time_series.max_horizon = horizon;
        }
        if let Some(lags) = parsed("TARGET_LAGS") {
            s.job.time_series.target_lags = Some(lags);
        }
        if let Some(window) = parsed("ROLLING_WINDOW") {
            s.job.time_series.target_rolling_window_size = Some(window);
        }
        if let Some(raw) = env_var("BLACKLIST") {
            s.job.time_series.model_blacklist = split_list(&raw);
        }
        if let Some(path) = env_var("OUTPUT_PATH") {
            s.job.path = PathBuf::from(path);
        }

        if let Some(url) = env_var("SERVICE_URL") {
            s.service.base_url = url;
        }
        s.service.auth_token = env_var("SERVICE_TOKEN");
        if let Some(ms) = parsed("HTTP_TIMEOUT_MS") {
            s.service.http_timeout_ms = ms;
        }
        if let Some(retries) = parsed("MAX_RETRIES") {
            s.service.max_retries = retries;
        }
        if let Some(ms) = parsed("POLL_INTERVAL_MS") {
            s.service.poll_interval_ms = ms;
        }
        if let Some(ms) = parsed("RUN_TIMEOUT_MS") {
            s.service.run_timeout_ms = ms;
        }

        s.output_csv = env_var("OUTPUT_CSV").map(PathBuf::from);
        if let Some(raw) = env_var("EXPLAIN") {
            match parse_bool(&raw) {
                Some(explain) => s.explain = explain,
                None => invalid("EXPLAIN", &raw),
            }
        }
        if let Some(k) = parsed("TOP_FEATURES") {
            s.top_features = k;
        }

        s
    }
}

fn parsed<T: FromStr>(suffix: &str) -> Option<T> {
    let raw = env_var(suffix)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            invalid(suffix, &raw);
            None
        }
    }
}

fn invalid(suffix: &str, raw: &str) {
    warn!(
        component = "settings",
        event = "settings.invalid_value",
        variable = %format!("{ENV_PREFIX}_{suffix}"),
        value = raw
    );
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
