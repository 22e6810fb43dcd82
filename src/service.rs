//! Client for the remote experiment service that runs the AutoML search,
//! serves fitted pipelines and computes explanations.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::align::ForecastOutput;
use crate::config::JobSubmission;
use crate::dataset::{FeatureRow, ForecastQuery, SeriesKey};
use crate::explain::{ExplanationRequest, ExplanationShapeError, ModelExplanation};

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: String,
    pub experiment_name: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Queued,
    Preparing,
    Running,
    Finalizing,
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub primary_metric: Option<String>,
    #[serde(default)]
    pub best_score: Option<f64>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FittedPipeline {
    pub pipeline_id: String,
    #[serde(default)]
    pub algorithm: Option<String>,
}

/// The remote collaborator. Every call blocks until the service answers.
pub trait ExperimentService {
    fn submit(&self, submission: &JobSubmission) -> Result<RunHandle, ServiceError>;
    fn wait_for_completion(&self, run: &RunHandle) -> Result<RunStatus, ServiceError>;
    fn best_result(&self, run: &RunHandle) -> Result<(RunMetadata, FittedPipeline), ServiceError>;
    fn forecast(
        &self,
        pipeline: &FittedPipeline,
        query: &ForecastQuery,
    ) -> Result<ForecastOutput, ServiceError>;
    fn explain(&self, request: &ExplanationRequest) -> Result<ModelExplanation, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub run_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8700/api/v1".to_string(),
            auth_token: None,
            http_timeout_ms: 30_000,
            max_retries: 2,
            retry_backoff_ms: 500,
            poll_interval_ms: 15_000,
            run_timeout_ms: 3 * 60 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("service returned HTTP {status} for {url}: {message}")]
    Remote {
        url: String,
        status: u16,
        message: String,
    },
    #[error("failed to encode request for {url}: {message}")]
    Encode { url: String, message: String },
    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("invalid service response: {0}")]
    InvalidResponse(String),
    #[error("run {run_id} failed: {message}")]
    RunFailed { run_id: String, message: String },
    #[error("run {run_id} was canceled")]
    RunCanceled { run_id: String },
    #[error("run {run_id} did not complete within {waited_ms}ms")]
    RunTimeout { run_id: String, waited_ms: u64 },
    #[error("explanation has inconsistent shape: {0}")]
    Explanation(#[from] ExplanationShapeError),
}

impl ServiceError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Remote { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

pub trait HttpTransport {
    fn get(&self, url: &str) -> Result<HttpResponse, ServiceError>;
    fn post_json(&self, url: &str, body: &[u8]) -> Result<HttpResponse, ServiceError>;
}

pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
    auth_token: Option<String>,
}

impl ReqwestTransport {
    pub fn new(cfg: &ServiceConfig) -> Result<Self, ServiceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(cfg.http_timeout_ms))
            .build()
            .map_err(|err| ServiceError::HttpClientBuild(err.to_string()))?;
        Ok(Self {
            client,
            auth_token: cfg.auth_token.clone(),
        })
    }

    fn send(
        &self,
        url: &str,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<HttpResponse, ServiceError> {
        let request = match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().map_err(|err| ServiceError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| ServiceError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        Ok(HttpResponse { status, body })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&self, url: &str) -> Result<HttpResponse, ServiceError> {
        self.send(url, self.client.get(url))
    }

    fn post_json(&self, url: &str, body: &[u8]) -> Result<HttpResponse, ServiceError> {
        let request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        self.send(url, request)
    }
}

pub struct HttpExperimentService<T = ReqwestTransport> {
    cfg: ServiceConfig,
    transport: T,
}

impl HttpExperimentService<ReqwestTransport> {
    pub fn connect(cfg: ServiceConfig) -> Result<Self, ServiceError> {
        let transport = ReqwestTransport::new(&cfg)?;
        Ok(Self { cfg, transport })
    }
}

impl<T: HttpTransport> HttpExperimentService<T> {
    pub fn with_transport(cfg: ServiceConfig, transport: T) -> Self {
        Self { cfg, transport }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.cfg
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, ServiceError> {
        let url = self.url(path);
        let response = retry(&self.cfg, &url, || {
            check_status(&url, self.transport.get(&url)?)
        })?;
        decode(&url, &response.body)
    }

    fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ServiceError> {
        let url = self.url(path);
        let payload = serde_json::to_vec(body).map_err(|err| ServiceError::Encode {
            url: url.clone(),
            message: err.to_string(),
        })?;
        let response = retry(&self.cfg, &url, || {
            check_status(&url, self.transport.post_json(&url, &payload)?)
        })?;
        decode(&url, &response.body)
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    run_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: RunStatus,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BestResultResponse {
    metadata: RunMetadata,
    pipeline: FittedPipeline,
}

#[derive(Debug, Serialize)]
struct ForecastRequest<'a> {
    feature_columns: &'a [String],
    features: Vec<FeatureRow>,
    target_query: &'a [Option<f64>],
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    predictions: Vec<Option<f64>>,
    index: Vec<SeriesKey>,
}

impl<T: HttpTransport> ExperimentService for HttpExperimentService<T> {
    fn submit(&self, submission: &JobSubmission) -> Result<RunHandle, ServiceError> {
        let experiment = &submission.config.experiment_name;
        info!(
            component = "service",
            event = "service.submit.start",
            experiment = %experiment,
            fingerprint = %submission.fingerprint,
            training_rows = submission.training_target.len()
        );

        let response: SubmitResponse =
            self.post_json(&format!("experiments/{experiment}/runs"), submission)?;
        if response.run_id.trim().is_empty() {
            return Err(ServiceError::InvalidResponse(
                "submit response has an empty run_id".to_string(),
            ));
        }

        info!(
            component = "service",
            event = "service.submit.accepted",
            experiment = %experiment,
            run_id = %response.run_id
        );

        Ok(RunHandle {
            run_id: response.run_id,
            experiment_name: experiment.clone(),
            fingerprint: submission.fingerprint.clone(),
        })
    }

    fn wait_for_completion(&self, run: &RunHandle) -> Result<RunStatus, ServiceError> {
        let started = Instant::now();
        let mut last_status = None;

        loop {
            let response: StatusResponse = self.get_json(&format!("runs/{}", run.run_id))?;
            if last_status != Some(response.status) {
                info!(
                    component = "service",
                    event = "service.run.status",
                    run_id = %run.run_id,
                    status = ?response.status
                );
                last_status = Some(response.status);
            }

            match response.status {
                RunStatus::Completed => return Ok(RunStatus::Completed),
                RunStatus::Failed => {
                    return Err(ServiceError::RunFailed {
                        run_id: run.run_id.clone(),
                        message: response
                            .error
                            .unwrap_or_else(|| "no diagnostic provided".to_string()),
                    })
                }
                RunStatus::Canceled => {
                    return Err(ServiceError::RunCanceled {
                        run_id: run.run_id.clone(),
                    })
                }
                _ => {}
            }

            let waited_ms = started.elapsed().as_millis() as u64;
            if waited_ms >= self.cfg.run_timeout_ms {
                return Err(ServiceError::RunTimeout {
                    run_id: run.run_id.clone(),
                    waited_ms,
                });
            }
            std::thread::sleep(Duration::from_millis(self.cfg.poll_interval_ms));
        }
    }

    fn best_result(&self, run: &RunHandle) -> Result<(RunMetadata, FittedPipeline), ServiceError> {
        let response: BestResultResponse = self.get_json(&format!("runs/{}/best", run.run_id))?;
        info!(
            component = "service",
            event = "service.best_result",
            run_id = %run.run_id,
            best_run_id = %response.metadata.run_id,
            pipeline_id = %response.pipeline.pipeline_id,
            algorithm = ?response.metadata.algorithm,
            best_score = ?response.metadata.best_score
        );
        Ok((response.metadata, response.pipeline))
    }

    fn forecast(
        &self,
        pipeline: &FittedPipeline,
        query: &ForecastQuery,
    ) -> Result<ForecastOutput, ServiceError> {
        let request = ForecastRequest {
            feature_columns: &query.features.feature_columns,
            features: query.features.feature_rows(),
            target_query: &query.target_query,
        };
        let response: ForecastResponse = self.post_json(
            &format!("pipelines/{}/forecast", pipeline.pipeline_id),
            &request,
        )?;

        info!(
            component = "service",
            event = "service.forecast",
            pipeline_id = %pipeline.pipeline_id,
            query_rows = query.features.len(),
            predictions = response.predictions.len(),
            index_rows = response.index.len()
        );

        Ok(ForecastOutput {
            predictions: response
                .predictions
                .into_iter()
                .map(|p| p.unwrap_or(f64::NAN))
                .collect(),
            transformed_index: response.index,
        })
    }

    fn explain(&self, request: &ExplanationRequest) -> Result<ModelExplanation, ServiceError> {
        let explanation: ModelExplanation = self.post_json(
            &format!("pipelines/{}/explain", request.pipeline.pipeline_id),
            request,
        )?;
        explanation.validate_shape()?;
        info!(
            component = "service",
            event = "service.explain",
            pipeline_id = %request.pipeline.pipeline_id,
            features = explanation.feature_names.len(),
            samples = explanation.per_sample_attributions.len()
        );
        Ok(explanation)
    }
}

fn check_status(url: &str, response: HttpResponse) -> Result<HttpResponse, ServiceError> {
    if (200..300).contains(&response.status) {
        return Ok(response);
    }
    Err(ServiceError::Remote {
        url: url.to_string(),
        status: response.status,
        message: remote_message(&response.body),
    })
}

/// Prefers a JSON `error`/`message` field, falling back to the raw body.
fn remote_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for field in ["error", "message"] {
            if let Some(text) = value.get(field).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

fn decode<R: DeserializeOwned>(url: &str, body: &[u8]) -> Result<R, ServiceError> {
    serde_json::from_slice(body).map_err(|err| ServiceError::Decode {
        url: url.to_string(),
        message: err.to_string(),
    })
}

fn retry<T>(
    cfg: &ServiceConfig,
    url: &str,
    mut f: impl FnMut() -> Result<T, ServiceError>,
) -> Result<T, ServiceError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= cfg.max_retries || !err.is_retryable() => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let factor = 1u64 << shift;
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(factor);
                warn!(
                    component = "service",
                    event = "service.request.retry",
                    url,
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(Duration::from_millis(sleep_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};

    /// Replays queued responses per URL; the last response for a URL repeats.
    #[derive(Default)]
    struct MockTransport {
        responses: RefCell<HashMap<String, VecDeque<Result<HttpResponse, String>>>>,
        calls: RefCell<Vec<(String, Option<Vec<u8>>)>>,
    }

    impl MockTransport {
        fn with(self, url: &str, status: u16, body: &str) -> Self {
            self.responses
                .borrow_mut()
                .entry(url.to_string())
                .or_default()
                .push_back(Ok(HttpResponse {
                    status,
                    body: body.as_bytes().to_vec(),
                }));
            self
        }

        fn with_transport_error(self, url: &str) -> Self {
            self.responses
                .borrow_mut()
                .entry(url.to_string())
                .or_default()
                .push_back(Err("connection reset".to_string()));
            self
        }

        fn next(&self, url: &str) -> Result<HttpResponse, ServiceError> {
            let mut responses = self.responses.borrow_mut();
            let queue = responses
                .get_mut(url)
                .ok_or_else(|| ServiceError::Transport {
                    url: url.to_string(),
                    message: "missing mock response".to_string(),
                })?;
            let next = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            match next {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(ServiceError::Transport {
                    url: url.to_string(),
                    message,
                }),
                None => Err(ServiceError::Transport {
                    url: url.to_string(),
                    message: "mock queue exhausted".to_string(),
                }),
            }
        }

        fn call_count(&self, url: &str) -> usize {
            self.calls.borrow().iter().filter(|(u, _)| u == url).count()
        }
    }

    impl HttpTransport for MockTransport {
        fn get(&self, url: &str) -> Result<HttpResponse, ServiceError> {
            self.calls.borrow_mut().push((url.to_string(), None));
            self.next(url)
        }

        fn post_json(&self, url: &str, body: &[u8]) -> Result<HttpResponse, ServiceError> {
            self.calls
                .borrow_mut()
                .push((url.to_string(), Some(body.to_vec())));
            self.next(url)
        }
    }

    const BASE: &str = "http://svc.test/api";

    fn cfg() -> ServiceConfig {
        ServiceConfig {
            base_url: format!("{BASE}/"),
            retry_backoff_ms: 0,
            poll_interval_ms: 0,
            ..ServiceConfig::default()
        }
    }

    fn handle() -> RunHandle {
        RunHandle {
            run_id: "run-1".to_string(),
            experiment_name: "exp".to_string(),
            fingerprint: "abc".to_string(),
        }
    }

    #[test]
    fn polls_until_completed() {
        let url = format!("{BASE}/runs/run-1");
        let transport = MockTransport::default()
            .with(&url, 200, r#"{"status":"queued"}"#)
            .with(&url, 200, r#"{"status":"running"}"#)
            .with(&url, 200, r#"{"status":"completed"}"#);
        let service = HttpExperimentService::with_transport(cfg(), transport);

        let status = service.wait_for_completion(&handle()).unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(service.transport.call_count(&url), 3);
    }

    #[test]
    fn failed_run_surfaces_service_diagnostics() {
        let url = format!("{BASE}/runs/run-1");
        let transport =
            MockTransport::default().with(&url, 200, r#"{"status":"failed","error":"quota"}"#);
        let service = HttpExperimentService::with_transport(cfg(), transport);

        match service.wait_for_completion(&handle()).unwrap_err() {
            ServiceError::RunFailed { run_id, message } => {
                assert_eq!(run_id, "run-1");
                assert_eq!(message, "quota");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn run_timeout_is_reported() {
        let url = format!("{BASE}/runs/run-1");
        let transport = MockTransport::default().with(&url, 200, r#"{"status":"running"}"#);
        let service = HttpExperimentService::with_transport(
            ServiceConfig {
                run_timeout_ms: 0,
                ..cfg()
            },
            transport,
        );

        assert!(matches!(
            service.wait_for_completion(&handle()).unwrap_err(),
            ServiceError::RunTimeout { .. }
        ));
    }

    #[test]
    fn transport_errors_and_5xx_are_retried() {
        let url = format!("{BASE}/runs/run-1/best");
        let transport = MockTransport::default()
            .with_transport_error(&url)
            .with(&url, 503, r#"{"error":"busy"}"#)
            .with(
                &url,
                200,
                r#"{"metadata":{"run_id":"run-1_7","algorithm":"ProphetModel"},
                    "pipeline":{"pipeline_id":"p-7"}}"#,
            );
        let service = HttpExperimentService::with_transport(cfg(), transport);

        let (metadata, pipeline) = service.best_result(&handle()).unwrap();
        assert_eq!(metadata.run_id, "run-1_7");
        assert_eq!(metadata.algorithm.as_deref(), Some("ProphetModel"));
        assert_eq!(pipeline.pipeline_id, "p-7");
        assert_eq!(service.transport.call_count(&url), 3);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let url = format!("{BASE}/runs/run-1/best");
        let transport = MockTransport::default().with(&url, 404, r#"{"message":"no such run"}"#);
        let service = HttpExperimentService::with_transport(cfg(), transport);

        match service.best_result(&handle()).unwrap_err() {
            ServiceError::Remote {
                status, message, ..
            } => {
                assert_eq!(status, 404);
                assert_eq!(message, "no such run");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(service.transport.call_count(&url), 1);
    }

    #[test]
    fn forecast_maps_null_predictions_to_nan() {
        let url = format!("{BASE}/pipelines/p-7/forecast");
        let transport = MockTransport::default().with(
            &url,
            200,
            r#"{"predictions":[null, 4100.5],
                "index":[{"timestamp":"2017-02-01T00:00:00"},{"timestamp":"2017-02-01T01:00:00"}]}"#,
        );
        let service = HttpExperimentService::with_transport(cfg(), transport);
        let features = crate::dataset::TimeSeriesTable {
            time_column: "timeStamp".to_string(),
            target_column: "demand".to_string(),
            grain_column: None,
            feature_columns: vec![],
            records: vec![],
        };
        let query = ForecastQuery {
            features,
            target_query: vec![],
        };
        let pipeline = FittedPipeline {
            pipeline_id: "p-7".to_string(),
            algorithm: None,
        };

        let output = service.forecast(&pipeline, &query).unwrap();
        assert!(output.predictions[0].is_nan());
        assert_eq!(output.predictions[1], 4100.5);
        assert_eq!(output.transformed_index.len(), 2);
        assert!(output.transformed_index[0].grain.is_none());
    }

    #[test]
    fn malformed_body_is_a_decode_error() {
        let url = format!("{BASE}/runs/run-1/best");
        let transport = MockTransport::default().with(&url, 200, "<html>");
        let service = HttpExperimentService::with_transport(cfg(), transport);
        assert!(matches!(
            service.best_result(&handle()).unwrap_err(),
            ServiceError::Decode { .. }
        ));
    }

    #[test]
    fn remote_message_falls_back_to_trimmed_body() {
        assert_eq!(remote_message(b"  upstream exploded \n"), "upstream exploded");
        assert_eq!(remote_message(b""), "empty response body");
    }
}
