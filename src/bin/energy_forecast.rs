use energy_forecast::{
    init_logging, log_app_start, log_service_selected, logging_config_from_env, run_experiment,
    ExperimentSettings, HttpExperimentService,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let settings = ExperimentSettings::from_env();
    log_app_start(&logging_cfg, &settings.job.experiment_name);

    let service = HttpExperimentService::connect(settings.service.clone())?;
    log_service_selected(
        &settings.service.base_url,
        settings.service.auth_token.is_some(),
        settings.service.run_timeout_ms,
    );

    let report = run_experiment(&settings, &service)?;

    println!(
        "Experiment {} | run={} best={} algorithm={}",
        settings.job.experiment_name,
        report.run_id,
        report.best_run.run_id,
        report.best_run.algorithm.as_deref().unwrap_or("-")
    );
    println!(
        "Rows | train={} test={} context={} aligned={}",
        report.train_rows, report.test_rows, report.context_rows, report.aligned_rows
    );
    if report.dataset.missing_points > 0 {
        println!(
            "Gaps | missing_points={} ranges={}",
            report.dataset.missing_points, report.dataset.total_gap_ranges
        );
    }
    println!(
        "Scores | pairs={} rmse={} mae={} r2={} mape={}",
        report.scores.evaluated_pairs,
        fmt_metric(report.scores.rmse),
        fmt_metric(report.scores.mae),
        fmt_metric(report.scores.r2),
        report
            .scores
            .mape
            .map(|v| format!("{v:.2}%"))
            .unwrap_or_else(|| "undefined".to_string())
    );
    for (name, importance) in &report.top_features {
        println!("  {name}: {importance:.6}");
    }

    Ok(())
}

fn fmt_metric(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "-".to_string())
}
