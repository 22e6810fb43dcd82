//! Energy-demand forecasting against a remote AutoML experiment service.
//!
//! Implemented scope:
//! - dataset loading (CSV or zipped CSV), gap report and time-based split
//! - forecasting job configuration, validation and submission payload
//! - blocking HTTP client for the experiment, forecast and explain calls
//! - forecast-output alignment (key-based right join + defined-value filter)
//! - error metrics (MAPE with explicit undefined result, RMSE, MAE, R2)

mod align;
mod config;
mod dataset;
mod explain;
mod metrics;
mod observability;
mod runner;
mod service;
mod settings;

pub use align::{
    align_outputs, pair_predictions, AlignError, AlignedRecord, AlignedTable, ForecastOutput,
    KeyedPrediction, PREDICTED_COLUMN,
};
pub use config::{
    build_submission, ConfigError, ForecastingJobConfig, JobSubmission, PrimaryMetric, TaskKind,
    TimeSeriesSettings, Verbosity, SUBMISSION_SCHEMA_VERSION,
};
pub use dataset::{
    load_dataset, parse_dataset, parse_timestamp, prepare_forecast_query, split_by_time,
    DatasetConfig, DatasetError, DatasetReport, FeatureRow, ForecastQuery, LoadedDataset,
    PreparedQuery, SeriesKey, TimeSeriesRecord, TimeSeriesTable, TrainTestSplit,
};
pub use explain::{ExplanationRequest, ExplanationShapeError, ModelExplanation};
pub use metrics::{
    is_close, mae, mape, r2_score, rmse, score_forecast, ForecastScores, MetricError, CLOSE_ATOL,
    CLOSE_RTOL,
};
pub use observability::{
    init_logging, log_app_start, log_report_written, log_service_selected,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use runner::{run_experiment, ExperimentReport, RunError};
pub use service::{
    ExperimentService, FittedPipeline, HttpExperimentService, HttpResponse, HttpTransport,
    ReqwestTransport, RunHandle, RunMetadata, RunStatus, ServiceConfig, ServiceError,
};
pub use settings::ExperimentSettings;
