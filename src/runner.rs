//! End-to-end forecasting experiment: load, split, submit, forecast, align, score.

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::align::{align_outputs, pair_predictions, AlignError};
use crate::config::{build_submission, ConfigError};
use crate::dataset::{
    load_dataset, prepare_forecast_query, split_by_time, DatasetError, DatasetReport,
};
use crate::explain::ExplanationRequest;
use crate::metrics::{score_forecast, ForecastScores, MetricError};
use crate::observability::log_report_written;
use crate::service::{ExperimentService, RunMetadata, ServiceError};
use crate::settings::ExperimentSettings;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentReport {
    pub run_id: String,
    pub fingerprint: String,
    pub best_run: RunMetadata,
    pub dataset: DatasetReport,
    pub train_rows: usize,
    pub test_rows: usize,
    pub context_rows: usize,
    pub aligned_rows: usize,
    pub scores: ForecastScores,
    pub top_features: Vec<(String, f64)>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Align(#[from] AlignError),
    #[error(transparent)]
    Metric(#[from] MetricError),
    #[error("{part} split is empty at cutoff {cutoff}")]
    EmptySplit {
        part: &'static str,
        cutoff: chrono::NaiveDateTime,
    },
}

pub fn run_experiment(
    settings: &ExperimentSettings,
    service: &dyn ExperimentService,
) -> Result<ExperimentReport, RunError> {
    let loaded = load_dataset(&settings.dataset)?;
    let split = split_by_time(&loaded.table, settings.split_cutoff);
    for (part, table) in [("train", &split.train), ("test", &split.test)] {
        if table.is_empty() {
            return Err(RunError::EmptySplit {
                part,
                cutoff: split.cutoff,
            });
        }
    }

    let submission = build_submission(&settings.job, &split.train)?;
    let run = service.submit(&submission)?;
    service.wait_for_completion(&run)?;
    let (best_run, pipeline) = service.best_result(&run)?;

    let prepared = prepare_forecast_query(&split, settings.context_rows);
    let output = service.forecast(&pipeline, &prepared.query)?;
    let predictions = pair_predictions(&output)?;
    let aligned = align_outputs(&predictions, &prepared.query.features, &prepared.actuals)?;
    if aligned.is_empty() {
        warn!(
            component = "runner",
            event = "runner.align.empty",
            run_id = %run.run_id,
            predictions = predictions.len(),
            query_rows = prepared.query.features.len()
        );
    }

    let scores = score_forecast(&aligned.actuals(), &aligned.predictions())?;
    info!(
        component = "runner",
        event = "runner.scores",
        run_id = %run.run_id,
        evaluated_pairs = scores.evaluated_pairs,
        rmse = ?scores.rmse,
        mae = ?scores.mae,
        r2 = ?scores.r2,
        mape = ?scores.mape
    );

    let top_features = if settings.explain {
        let request = ExplanationRequest::new(&pipeline, &best_run, &submission, &split.test);
        service
            .explain(&request)?
            .top_features(settings.top_features)
    } else {
        Vec::new()
    };

    if let Some(path) = &settings.output_csv {
        aligned.write_csv(path)?;
        log_report_written(path, aligned.len());
    }

    Ok(ExperimentReport {
        run_id: run.run_id,
        fingerprint: run.fingerprint,
        best_run,
        dataset: loaded.report,
        train_rows: split.train.len(),
        test_rows: split.test.len(),
        context_rows: prepared.context_rows,
        aligned_rows: aligned.len(),
        scores,
        top_features,
    })
}
