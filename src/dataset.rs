//! Tabular time-series loading, time-based splitting and forecast queries.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::ZipArchive;

const MAX_REPORTED_GAP_RANGES: usize = 256;

const NAIVE_TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
];

/// Non-finite values are treated as missing, spelled out or not.
const MISSING_MARKERS: [&str; 11] = [
    "", "nan", "na", "null", "none", "inf", "+inf", "-inf", "infinity", "+infinity", "-infinity",
];

/// Identifies one observation: a timestamp plus an optional grain (series id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub timestamp: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grain: Option<String>,
}

impl SeriesKey {
    pub fn new(timestamp: NaiveDateTime) -> Self {
        Self {
            timestamp,
            grain: None,
        }
    }

    pub fn with_grain(timestamp: NaiveDateTime, grain: impl Into<String>) -> Self {
        Self {
            timestamp,
            grain: Some(grain.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesRecord {
    pub key: SeriesKey,
    pub features: Vec<Option<f64>>,
    pub target: Option<f64>,
}

/// Features-only view of a record, as sent to the forecasting service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    #[serde(flatten)]
    pub key: SeriesKey,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesTable {
    pub time_column: String,
    pub target_column: String,
    pub grain_column: Option<String>,
    pub feature_columns: Vec<String>,
    pub records: Vec<TimeSeriesRecord>,
}

impl TimeSeriesTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> Vec<SeriesKey> {
        self.records.iter().map(|r| r.key.clone()).collect()
    }

    pub fn targets(&self) -> Vec<Option<f64>> {
        self.records.iter().map(|r| r.target).collect()
    }

    pub fn feature_rows(&self) -> Vec<FeatureRow> {
        self.records
            .iter()
            .map(|r| FeatureRow {
                key: r.key.clone(),
                values: r.features.clone(),
            })
            .collect()
    }

    /// Same columns, different rows.
    pub fn with_records(&self, records: Vec<TimeSeriesRecord>) -> Self {
        Self {
            time_column: self.time_column.clone(),
            target_column: self.target_column.clone(),
            grain_column: self.grain_column.clone(),
            feature_columns: self.feature_columns.clone(),
            records,
        }
    }

    /// Copy of the table with every target cleared.
    pub fn features_only(&self) -> Self {
        self.with_records(
            self.records
                .iter()
                .map(|r| TimeSeriesRecord {
                    key: r.key.clone(),
                    features: r.features.clone(),
                    target: None,
                })
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetConfig {
    pub path: PathBuf,
    pub time_column: String,
    pub target_column: String,
    pub grain_column: Option<String>,
    /// `None` selects every column that is not the time, target or grain column.
    pub feature_columns: Option<Vec<String>>,
    /// Zone that offset-carrying timestamps are converted into before being made naive.
    pub source_timezone: Option<Tz>,
    pub drop_missing_target: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/nyc_energy.csv"),
            time_column: "timeStamp".to_string(),
            target_column: "demand".to_string(),
            grain_column: None,
            feature_columns: None,
            source_timezone: None,
            drop_missing_target: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetReport {
    pub rows_read: u64,
    pub rows_dropped_missing_target: u64,
    pub duplicate_rows_removed: u64,
    pub inferred_step_seconds: Option<i64>,
    pub missing_points: u64,
    pub total_gap_ranges: u64,
    pub gap_ranges: Vec<(NaiveDateTime, NaiveDateTime)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDataset {
    pub table: TimeSeriesTable,
    pub report: DatasetReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainTestSplit {
    pub cutoff: NaiveDateTime,
    pub train: TimeSeriesTable,
    pub test: TimeSeriesTable,
}

/// What the forecasting service receives: features plus a target query in
/// which unknown values are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastQuery {
    pub features: TimeSeriesTable,
    pub target_query: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedQuery {
    pub query: ForecastQuery,
    /// Known targets for every query row, used for evaluation only.
    pub actuals: Vec<Option<f64>>,
    pub context_rows: usize,
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("archive at {path} has no entries")]
    EmptyZipArchive { path: PathBuf },
    #[error("archive at {path} has no CSV entry")]
    MissingCsvEntry { path: PathBuf },
    #[error("dataset has no header row")]
    MissingHeader,
    #[error("column '{0}' not found in dataset header")]
    MissingColumn(String),
    #[error("invalid dataset config: {0}")]
    InvalidConfig(String),
    #[error("line {line}: failed to parse timestamp '{value}'")]
    ParseTimestamp { line: u64, value: String },
    #[error("line {line}: failed to parse column {column} value '{value}'")]
    ParseField {
        line: u64,
        column: String,
        value: String,
    },
}

pub fn load_dataset(cfg: &DatasetConfig) -> Result<LoadedDataset, DatasetError> {
    info!(
        component = "dataset",
        event = "dataset.load.start",
        path = %cfg.path.display(),
        time_column = %cfg.time_column,
        target_column = %cfg.target_column
    );

    let bytes = read_source_bytes(&cfg.path)?;
    let loaded = parse_dataset(&bytes, cfg)?;

    if loaded.report.missing_points > 0 {
        warn!(
            component = "dataset",
            event = "dataset.load.gap_detected",
            missing_points = loaded.report.missing_points,
            total_gap_ranges = loaded.report.total_gap_ranges,
            reported_gap_ranges = loaded.report.gap_ranges.len()
        );
    }

    info!(
        component = "dataset",
        event = "dataset.load.finish",
        rows_read = loaded.report.rows_read,
        rows_kept = loaded.table.len(),
        rows_dropped_missing_target = loaded.report.rows_dropped_missing_target,
        duplicate_rows_removed = loaded.report.duplicate_rows_removed,
        inferred_step_seconds = ?loaded.report.inferred_step_seconds
    );

    Ok(loaded)
}

/// Parses CSV bytes with a header row into a sorted, de-duplicated table.
pub fn parse_dataset(bytes: &[u8], cfg: &DatasetConfig) -> Result<LoadedDataset, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(DatasetError::MissingHeader);
    }
    let layout = ColumnLayout::resolve(&headers, cfg)?;

    let mut records = Vec::new();
    let mut rows_read = 0u64;
    let mut rows_dropped_missing_target = 0u64;
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let line = idx as u64 + 2;
        rows_read += 1;

        let parsed = layout.parse_record(&record, line, cfg.source_timezone)?;
        if parsed.target.is_none() && cfg.drop_missing_target {
            rows_dropped_missing_target += 1;
            continue;
        }
        records.push(parsed);
    }

    records.sort_by(|a, b| a.key.cmp(&b.key));
    let before_dedup = records.len();
    records.dedup_by(|later, earlier| later.key == earlier.key);
    let duplicate_rows_removed = (before_dedup - records.len()) as u64;

    let gaps = detect_gaps(&records);
    let table = TimeSeriesTable {
        time_column: cfg.time_column.clone(),
        target_column: cfg.target_column.clone(),
        grain_column: cfg.grain_column.clone(),
        feature_columns: layout.feature_names,
        records,
    };

    Ok(LoadedDataset {
        table,
        report: DatasetReport {
            rows_read,
            rows_dropped_missing_target,
            duplicate_rows_removed,
            inferred_step_seconds: gaps.step_seconds,
            missing_points: gaps.missing_points,
            total_gap_ranges: gaps.total_ranges as u64,
            gap_ranges: gaps.ranges,
        },
    })
}

/// Rows strictly before `cutoff` train, the rest test.
pub fn split_by_time(table: &TimeSeriesTable, cutoff: NaiveDateTime) -> TrainTestSplit {
    let (train, test): (Vec<_>, Vec<_>) = table
        .records
        .iter()
        .cloned()
        .partition(|r| r.key.timestamp < cutoff);

    info!(
        component = "dataset",
        event = "dataset.split",
        cutoff = %cutoff,
        train_rows = train.len(),
        test_rows = test.len()
    );

    TrainTestSplit {
        cutoff,
        train: table.with_records(train),
        test: table.with_records(test),
    }
}

impl ForecastQuery {
    /// Query over the test rows with every target unknown.
    pub fn from_test(test: &TimeSeriesTable) -> Self {
        Self {
            features: test.features_only(),
            target_query: vec![None; test.len()],
        }
    }
}

/// Builds the forecast query for `split.test`, prepending up to
/// `context_rows` trailing training rows per grain whose targets stay known.
pub fn prepare_forecast_query(split: &TrainTestSplit, context_rows: usize) -> PreparedQuery {
    let mut context = trailing_rows_per_grain(&split.train.records, context_rows);
    context.sort_by(|a, b| a.key.cmp(&b.key));

    let mut records = Vec::with_capacity(context.len() + split.test.len());
    let mut target_query = Vec::with_capacity(context.len() + split.test.len());
    let mut actuals = Vec::with_capacity(context.len() + split.test.len());

    for record in &context {
        records.push(record.clone());
        target_query.push(record.target);
        actuals.push(record.target);
    }
    for record in &split.test.records {
        records.push(record.clone());
        target_query.push(None);
        actuals.push(record.target);
    }

    debug!(
        component = "dataset",
        event = "dataset.query.prepared",
        context_rows = context.len(),
        test_rows = split.test.len()
    );

    PreparedQuery {
        query: ForecastQuery {
            features: split.test.with_records(records).features_only(),
            target_query,
        },
        actuals,
        context_rows: context.len(),
    }
}

/// Records per grain, each group in the input order.
fn group_by_grain(
    records: &[TimeSeriesRecord],
) -> BTreeMap<Option<&str>, Vec<&TimeSeriesRecord>> {
    let mut by_grain = BTreeMap::new();
    for record in records {
        by_grain
            .entry(record.key.grain.as_deref())
            .or_insert_with(Vec::new)
            .push(record);
    }
    by_grain
}

fn trailing_rows_per_grain(records: &[TimeSeriesRecord], n: usize) -> Vec<TimeSeriesRecord> {
    if n == 0 {
        return Vec::new();
    }

    group_by_grain(records)
        .into_values()
        .flat_map(|rows| {
            let start = rows.len().saturating_sub(n);
            rows[start..].iter().map(|r| (*r).clone()).collect::<Vec<_>>()
        })
        .collect()
}

struct ColumnLayout {
    time_idx: usize,
    target_idx: usize,
    target_name: String,
    grain_idx: Option<usize>,
    feature_idx: Vec<usize>,
    feature_names: Vec<String>,
}

impl ColumnLayout {
    fn resolve(headers: &StringRecord, cfg: &DatasetConfig) -> Result<Self, DatasetError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| DatasetError::MissingColumn(name.to_string()))
        };

        let time_idx = find(&cfg.time_column)?;
        let target_idx = find(&cfg.target_column)?;
        if time_idx == target_idx {
            return Err(DatasetError::InvalidConfig(
                "time and target columns must differ".to_string(),
            ));
        }
        let grain_idx = cfg.grain_column.as_deref().map(find).transpose()?;
        let reserved = |idx: usize| idx == time_idx || idx == target_idx || Some(idx) == grain_idx;

        let feature_idx: Vec<usize> = match &cfg.feature_columns {
            Some(names) => {
                let mut out = Vec::with_capacity(names.len());
                for name in names {
                    let idx = find(name)?;
                    if reserved(idx) {
                        return Err(DatasetError::InvalidConfig(format!(
                            "feature column '{name}' is also the time, target or grain column"
                        )));
                    }
                    out.push(idx);
                }
                out
            }
            None => (0..headers.len()).filter(|idx| !reserved(*idx)).collect(),
        };
        let feature_names = feature_idx
            .iter()
            .map(|idx| headers.get(*idx).unwrap_or_default().to_string())
            .collect();

        Ok(Self {
            time_idx,
            target_idx,
            target_name: cfg.target_column.clone(),
            grain_idx,
            feature_idx,
            feature_names,
        })
    }

    fn parse_record(
        &self,
        record: &StringRecord,
        line: u64,
        tz: Option<Tz>,
    ) -> Result<TimeSeriesRecord, DatasetError> {
        let raw_time = record.get(self.time_idx).unwrap_or_default();
        let timestamp =
            parse_timestamp(raw_time, tz).ok_or_else(|| DatasetError::ParseTimestamp {
                line,
                value: raw_time.to_string(),
            })?;
        let grain = self
            .grain_idx
            .map(|idx| record.get(idx).unwrap_or_default().to_string());

        let mut features = Vec::with_capacity(self.feature_idx.len());
        for (idx, name) in self.feature_idx.iter().zip(&self.feature_names) {
            features.push(parse_optional_f64(record, *idx, name, line)?);
        }

        Ok(TimeSeriesRecord {
            key: SeriesKey { timestamp, grain },
            features,
            target: parse_optional_f64(record, self.target_idx, &self.target_name, line)?,
        })
    }
}

fn parse_optional_f64(
    record: &StringRecord,
    idx: usize,
    column: &str,
    line: u64,
) -> Result<Option<f64>, DatasetError> {
    let raw = record.get(idx).unwrap_or_default();
    if MISSING_MARKERS.contains(&raw.to_ascii_lowercase().as_str()) {
        return Ok(None);
    }
    let value = raw.parse::<f64>().map_err(|_| DatasetError::ParseField {
        line,
        column: column.to_string(),
        value: raw.to_string(),
    })?;
    // Overflowing literals such as `1e400` parse to infinity.
    Ok(Some(value).filter(|v| v.is_finite()))
}

/// Accepts RFC 3339 (converted to `tz`, default UTC) or a naive wall-clock form.
pub fn parse_timestamp(raw: &str, tz: Option<Tz>) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(match tz {
            Some(tz) => dt.with_timezone(&tz).naive_local(),
            None => dt.naive_utc(),
        });
    }

    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

fn read_source_bytes(path: &Path) -> Result<Vec<u8>, DatasetError> {
    let is_zip = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);
    if is_zip {
        read_zip_csv(path)
    } else {
        Ok(fs::read(path)?)
    }
}

fn read_zip_csv(path: &Path) -> Result<Vec<u8>, DatasetError> {
    let file = fs::File::open(path)?;
    let mut zip = ZipArchive::new(file)?;
    if zip.is_empty() {
        return Err(DatasetError::EmptyZipArchive {
            path: path.to_path_buf(),
        });
    }

    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        return Ok(buf);
    }

    Err(DatasetError::MissingCsvEntry {
        path: path.to_path_buf(),
    })
}

struct GapSummary {
    step_seconds: Option<i64>,
    ranges: Vec<(NaiveDateTime, NaiveDateTime)>,
    total_ranges: usize,
    missing_points: u64,
}

/// Gaps are measured per grain against the most common sampling interval.
fn detect_gaps(records: &[TimeSeriesRecord]) -> GapSummary {
    let by_grain = group_by_grain(records);

    let consecutive: Vec<(&TimeSeriesRecord, i64)> = by_grain
        .values()
        .flat_map(|rows| {
            rows.windows(2).map(|pair| {
                let diff = (pair[1].key.timestamp - pair[0].key.timestamp).num_seconds();
                (pair[0], diff)
            })
        })
        .filter(|(_, diff)| *diff > 0)
        .collect();

    let mut counts: HashMap<i64, usize> = HashMap::new();
    for (_, diff) in &consecutive {
        *counts.entry(*diff).or_insert(0) += 1;
    }
    let Some(step) = counts
        .into_iter()
        .max_by_key(|(diff, count)| (*count, Reverse(*diff)))
        .map(|(diff, _)| diff)
    else {
        return GapSummary {
            step_seconds: None,
            ranges: Vec::new(),
            total_ranges: 0,
            missing_points: 0,
        };
    };

    let mut ranges = Vec::new();
    let mut total_ranges = 0usize;
    let mut missing_points = 0u64;
    let step_delta = chrono::Duration::seconds(step);
    for (prev, diff) in consecutive {
        if diff <= step {
            continue;
        }
        let missing = (diff - 1) / step;
        total_ranges += 1;
        missing_points += missing as u64;
        if ranges.len() < MAX_REPORTED_GAP_RANGES {
            let start = prev.key.timestamp + step_delta;
            let end = prev.key.timestamp + chrono::Duration::seconds(step * missing);
            ranges.push((start, end));
        }
    }

    GapSummary {
        step_seconds: Some(step),
        ranges,
        total_ranges,
        missing_points,
    }
}
