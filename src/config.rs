//! Forecasting job configuration and submission payload assembly.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::dataset::{FeatureRow, TimeSeriesTable};

pub const SUBMISSION_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Forecasting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryMetric {
    NormalizedRootMeanSquaredError,
    NormalizedMeanAbsoluteError,
    R2Score,
    SpearmanCorrelation,
}

impl PrimaryMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NormalizedRootMeanSquaredError => "normalized_root_mean_squared_error",
            Self::NormalizedMeanAbsoluteError => "normalized_mean_absolute_error",
            Self::R2Score => "r2_score",
            Self::SpearmanCorrelation => "spearman_correlation",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "normalized_root_mean_squared_error" | "nrmse" => {
                Some(Self::NormalizedRootMeanSquaredError)
            }
            "normalized_mean_absolute_error" | "nmae" => Some(Self::NormalizedMeanAbsoluteError),
            "r2_score" | "r2" => Some(Self::R2Score),
            "spearman_correlation" | "spearman" => Some(Self::SpearmanCorrelation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesSettings {
    pub time_column_name: String,
    pub grain_column_names: Vec<String>,
    /// Forecast horizon in multiples of the series' sampling interval.
    pub max_horizon: u32,
    pub target_lags: Option<u32>,
    pub target_rolling_window_size: Option<u32>,
    pub model_blacklist: Vec<String>,
}

impl Default for TimeSeriesSettings {
    fn default() -> Self {
        Self {
            time_column_name: "timeStamp".to_string(),
            grain_column_names: Vec::new(),
            max_horizon: 48,
            target_lags: None,
            target_rolling_window_size: None,
            model_blacklist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastingJobConfig {
    pub experiment_name: String,
    pub task: TaskKind,
    pub primary_metric: PrimaryMetric,
    pub iterations: u32,
    pub iteration_timeout_minutes: u32,
    pub n_cross_validations: u32,
    pub path: PathBuf,
    pub verbosity: Verbosity,
    pub time_series: TimeSeriesSettings,
}

impl Default for ForecastingJobConfig {
    fn default() -> Self {
        Self {
            experiment_name: "automl-energydemandforecasting".to_string(),
            task: TaskKind::Forecasting,
            primary_metric: PrimaryMetric::NormalizedRootMeanSquaredError,
            iterations: 10,
            iteration_timeout_minutes: 5,
            n_cross_validations: 3,
            path: PathBuf::from("."),
            verbosity: Verbosity::Info,
            time_series: TimeSeriesSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub schema_version: u32,
    pub fingerprint: String,
    pub config: ForecastingJobConfig,
    pub feature_columns: Vec<String>,
    pub target_column: String,
    pub training_features: Vec<FeatureRow>,
    pub training_target: Vec<f64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid forecasting job config: {0}")]
    Invalid(String),
    #[error("time column mismatch: config uses '{config}', training data uses '{data}'")]
    TimeColumnMismatch { config: String, data: String },
    #[error("training data is empty")]
    EmptyTrainingData,
    #[error("training target is missing at {timestamp}")]
    MissingTrainingTarget { timestamp: chrono::NaiveDateTime },
}

impl ForecastingJobConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid =
            |msg: &str| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg.to_string())) };

        if self.experiment_name.is_empty()
            || !self
                .experiment_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return invalid("experiment_name must be non-empty [A-Za-z0-9_-]");
        }
        if self.iterations == 0 {
            return invalid("iterations must be > 0");
        }
        if self.iteration_timeout_minutes == 0 {
            return invalid("iteration_timeout_minutes must be > 0");
        }
        if self.n_cross_validations < 2 {
            return invalid("n_cross_validations must be >= 2");
        }

        let ts = &self.time_series;
        if ts.time_column_name.trim().is_empty() {
            return invalid("time_column_name must be set");
        }
        if ts.grain_column_names.contains(&ts.time_column_name) {
            return invalid("time_column_name must not also be a grain column");
        }
        if ts.max_horizon == 0 {
            return invalid("max_horizon must be > 0");
        }
        if ts.target_lags == Some(0) {
            return invalid("target_lags must be > 0 when set");
        }
        if ts.target_rolling_window_size == Some(0) {
            return invalid("target_rolling_window_size must be > 0 when set");
        }

        let mut seen = HashSet::new();
        for model in &ts.model_blacklist {
            if model.trim().is_empty() {
                return invalid("model_blacklist entries must be non-empty");
            }
            if !seen.insert(model.as_str()) {
                return invalid("model_blacklist entries must be unique");
            }
        }

        Ok(())
    }

    /// Stable SHA-256 over every setting that affects the remote search.
    pub fn fingerprint(&self) -> String {
        let ts = &self.time_series;
        let mut hasher = Sha256::new();
        hasher.update(format!("version:{SUBMISSION_SCHEMA_VERSION};"));
        hasher.update(format!("experiment:{};", self.experiment_name));
        hasher.update(format!("task:{:?};", self.task));
        hasher.update(format!("metric:{};", self.primary_metric.as_str()));
        hasher.update(format!(
            "iterations:{};timeout_min:{};cv:{};",
            self.iterations, self.iteration_timeout_minutes, self.n_cross_validations
        ));
        hasher.update(format!("time_column:{};", ts.time_column_name));
        hasher.update("grains:");
        for grain in &ts.grain_column_names {
            hasher.update(format!("{grain},"));
        }
        hasher.update(format!(
            ";horizon:{};lags:{:?};window:{:?};",
            ts.max_horizon, ts.target_lags, ts.target_rolling_window_size
        ));
        hasher.update("blacklist:");
        let mut blacklist: Vec<&str> = ts.model_blacklist.iter().map(String::as_str).collect();
        blacklist.sort_unstable();
        for model in blacklist {
            hasher.update(format!("{model},"));
        }
        hex::encode(hasher.finalize())
    }
}

/// Validates `cfg` against `train` and packs both into a submission payload.
pub fn build_submission(
    cfg: &ForecastingJobConfig,
    train: &TimeSeriesTable,
) -> Result<JobSubmission, ConfigError> {
    cfg.validate()?;

    if cfg.time_series.time_column_name != train.time_column {
        return Err(ConfigError::TimeColumnMismatch {
            config: cfg.time_series.time_column_name.clone(),
            data: train.time_column.clone(),
        });
    }
    if train.is_empty() {
        return Err(ConfigError::EmptyTrainingData);
    }

    let mut training_target = Vec::with_capacity(train.len());
    for record in &train.records {
        let target = record
            .target
            .filter(|v| !v.is_nan())
            .ok_or(ConfigError::MissingTrainingTarget {
                timestamp: record.key.timestamp,
            })?;
        training_target.push(target);
    }

    let fingerprint = cfg.fingerprint();
    info!(
        component = "config",
        event = "config.submission.built",
        experiment = %cfg.experiment_name,
        fingerprint = %fingerprint,
        training_rows = train.len(),
        feature_columns = train.feature_columns.len(),
        max_horizon = cfg.time_series.max_horizon,
        target_lags = ?cfg.time_series.target_lags,
        target_rolling_window_size = ?cfg.time_series.target_rolling_window_size
    );

    Ok(JobSubmission {
        schema_version: SUBMISSION_SCHEMA_VERSION,
        fingerprint,
        config: cfg.clone(),
        feature_columns: train.feature_columns.clone(),
        target_column: train.target_column.clone(),
        training_features: train.feature_rows(),
        training_target,
    })
}
