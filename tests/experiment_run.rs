use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use energy_forecast::{
    run_experiment, AlignError, ExperimentService, ExperimentSettings, ExplanationRequest,
    FittedPipeline, ForecastOutput, ForecastQuery, JobSubmission, ModelExplanation, RunError,
    RunHandle, RunMetadata, RunStatus, ServiceError,
};
use regex::Regex;
use tempfile::tempdir;

// Test-period demand is exactly 110 * temp; the fake forecaster predicts 100 * temp.
const ENERGY_CSV: &str = "timeStamp,demand,precip,temp\n\
2017-01-31 21:00:00,4400,0.0,40\n\
2017-01-31 22:00:00,4290,0.01,39\n\
2017-01-31 23:00:00,4180,0.0,38\n\
2017-02-01 00:00:00,4070,0.0,37\n\
2017-02-01 01:00:00,3960,0.02,36\n\
2017-02-01 02:00:00,3850,0.0,35\n\
2017-02-01 03:00:00,3740,0.0,34\n";

#[derive(Default)]
struct FakeService {
    /// Unknown-target rows the forecaster consumes as context without predicting.
    consumed_rows: usize,
    /// Extra trailing predictions with no index entry.
    extra_predictions: usize,
    fail_run: bool,
    submitted: RefCell<Option<JobSubmission>>,
    explained: RefCell<Option<ExplanationRequest>>,
}

impl ExperimentService for FakeService {
    fn submit(&self, submission: &JobSubmission) -> Result<RunHandle, ServiceError> {
        *self.submitted.borrow_mut() = Some(submission.clone());
        Ok(RunHandle {
            run_id: "run-0001".to_string(),
            experiment_name: submission.config.experiment_name.clone(),
            fingerprint: submission.fingerprint.clone(),
        })
    }

    fn wait_for_completion(&self, run: &RunHandle) -> Result<RunStatus, ServiceError> {
        if self.fail_run {
            return Err(ServiceError::RunFailed {
                run_id: run.run_id.clone(),
                message: "no valid pipelines".to_string(),
            });
        }
        Ok(RunStatus::Completed)
    }

    fn best_result(&self, run: &RunHandle) -> Result<(RunMetadata, FittedPipeline), ServiceError> {
        Ok((
            RunMetadata {
                run_id: format!("{}_7", run.run_id),
                algorithm: Some("ElasticNet".to_string()),
                primary_metric: Some("normalized_root_mean_squared_error".to_string()),
                best_score: Some(0.041),
                properties: BTreeMap::new(),
            },
            FittedPipeline {
                pipeline_id: "pipe-7".to_string(),
                algorithm: Some("ElasticNet".to_string()),
            },
        ))
    }

    fn forecast(
        &self,
        _pipeline: &FittedPipeline,
        query: &ForecastQuery,
    ) -> Result<ForecastOutput, ServiceError> {
        let temp_idx = query
            .features
            .feature_columns
            .iter()
            .position(|c| c == "temp")
            .ok_or_else(|| ServiceError::InvalidResponse("no temp column".to_string()))?;

        let mut predictions = Vec::new();
        let mut transformed_index = Vec::new();
        let unknown = query
            .features
            .records
            .iter()
            .zip(&query.target_query)
            .filter(|(_, target)| target.is_none())
            .skip(self.consumed_rows);
        for (record, _) in unknown {
            let temp = record.features[temp_idx].unwrap_or(f64::NAN);
            predictions.push(100.0 * temp);
            transformed_index.push(record.key.clone());
        }
        predictions.extend(std::iter::repeat(0.0).take(self.extra_predictions));

        Ok(ForecastOutput {
            predictions,
            transformed_index,
        })
    }

    fn explain(&self, request: &ExplanationRequest) -> Result<ModelExplanation, ServiceError> {
        *self.explained.borrow_mut() = Some(request.clone());
        let width = request.feature_names.len();
        Ok(ModelExplanation {
            per_sample_attributions: vec![vec![0.0; width]; request.test_features.len()],
            expected_values: vec![4_000.0],
            overall_importance: vec![0.1, 0.9],
            feature_names: request.feature_names.clone(),
            per_class_summary: None,
            per_class_importance: None,
        })
    }
}

fn settings(data: &Path) -> ExperimentSettings {
    let mut settings = ExperimentSettings::default();
    settings.dataset.path = data.to_path_buf();
    settings.split_cutoff = NaiveDate::from_ymd_opt(2017, 2, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    settings.context_rows = 2;
    settings
}

#[test]
fn experiment_scores_only_rows_the_forecaster_predicted() {
    let dir = tempdir().expect("tempdir should be created");
    let data = dir.path().join("nyc_energy.csv");
    fs::write(&data, ENERGY_CSV).expect("dataset should be written");
    let report_path = dir.path().join("aligned.csv");

    let mut settings = settings(&data);
    settings.output_csv = Some(report_path.clone());
    settings.explain = true;
    let service = FakeService {
        consumed_rows: 1,
        ..FakeService::default()
    };

    let report = run_experiment(&settings, &service).expect("experiment should succeed");

    assert_eq!(report.run_id, "run-0001");
    assert_eq!(report.best_run.run_id, "run-0001_7");
    assert_eq!(report.train_rows, 3);
    assert_eq!(report.test_rows, 4);
    assert_eq!(report.context_rows, 2);
    assert_eq!(report.aligned_rows, 3);

    let scores = &report.scores;
    assert_eq!(scores.evaluated_pairs, 3);
    let mape = scores.mape.expect("mape should be defined");
    assert!((mape - 100.0 / 11.0).abs() < 1e-9, "mape was {mape}");
    let mae = scores.mae.expect("mae should be defined");
    assert!((mae - 350.0).abs() < 1e-9);

    assert_eq!(
        report.top_features,
        vec![("temp".to_string(), 0.9), ("precip".to_string(), 0.1)]
    );

    let submitted = service.submitted.borrow();
    let submission = submitted.as_ref().expect("submission should be recorded");
    assert_eq!(submission.training_target, vec![4400.0, 4290.0, 4180.0]);
    assert_eq!(submission.fingerprint, report.fingerprint);
    assert!(Regex::new(r"^[0-9a-f]{64}$")
        .unwrap()
        .is_match(&report.fingerprint));

    let explained = service.explained.borrow();
    let request = explained.as_ref().expect("explain request should be recorded");
    assert_eq!(request.test_features.len(), 4);
    assert_eq!(request.train_target.len(), 3);

    let csv = fs::read_to_string(&report_path).expect("aligned report should exist");
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "timeStamp,precip,temp,demand,predicted");
    assert_eq!(lines.len(), 4);
    assert!(lines[1].starts_with("2017-02-01 01:00:00,"));
}

#[test]
fn explain_is_skipped_unless_enabled() {
    let dir = tempdir().expect("tempdir should be created");
    let data = dir.path().join("nyc_energy.csv");
    fs::write(&data, ENERGY_CSV).expect("dataset should be written");

    let service = FakeService::default();
    let report = run_experiment(&settings(&data), &service).expect("experiment should succeed");

    assert!(report.top_features.is_empty());
    assert!(service.explained.borrow().is_none());
    assert_eq!(report.aligned_rows, 4);
    let mape = report.scores.mape.expect("mape should be defined");
    assert!((mape - 100.0 / 11.0).abs() < 1e-9, "mape was {mape}");
}

#[test]
fn failed_run_is_reported_as_service_error() {
    let dir = tempdir().expect("tempdir should be created");
    let data = dir.path().join("nyc_energy.csv");
    fs::write(&data, ENERGY_CSV).expect("dataset should be written");

    let service = FakeService {
        fail_run: true,
        ..FakeService::default()
    };
    let err = run_experiment(&settings(&data), &service).expect_err("run should fail");
    assert!(matches!(
        err,
        RunError::Service(ServiceError::RunFailed { ref run_id, .. }) if run_id == "run-0001"
    ));
}

#[test]
fn unequal_forecast_output_is_rejected() {
    let dir = tempdir().expect("tempdir should be created");
    let data = dir.path().join("nyc_energy.csv");
    fs::write(&data, ENERGY_CSV).expect("dataset should be written");

    let service = FakeService {
        extra_predictions: 2,
        ..FakeService::default()
    };
    let err = run_experiment(&settings(&data), &service).expect_err("forecast should be rejected");
    assert!(matches!(
        err,
        RunError::Align(AlignError::LengthMismatch {
            predictions: 6,
            index_rows: 4
        })
    ));
}

#[test]
fn cutoff_past_the_data_leaves_an_empty_test_split() {
    let dir = tempdir().expect("tempdir should be created");
    let data = dir.path().join("nyc_energy.csv");
    fs::write(&data, ENERGY_CSV).expect("dataset should be written");

    let mut settings = settings(&data);
    settings.split_cutoff = NaiveDate::from_ymd_opt(2018, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();

    let service = FakeService::default();
    let err = run_experiment(&settings, &service).expect_err("empty test split should fail");
    assert!(matches!(err, RunError::EmptySplit { part: "test", .. }));
    assert!(service.submitted.borrow().is_none());
}
