//! Reconciles forecaster output with the original query rows and their actuals.
//!
//! The forecaster returns predictions positionally aligned to its own
//! transformed-feature index, which may drop leading rows consumed as lag or
//! rolling-window context. [`pair_predictions`] turns that positional output
//! into key-tagged predictions, and [`align_outputs`] right-joins those onto
//! the original query, keeping only rows where both the actual and the
//! predicted value are defined (finite).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::dataset::{SeriesKey, TimeSeriesTable};

pub const PREDICTED_COLUMN: &str = "predicted";

/// Raw forecaster output: `predictions[i]` belongs to `transformed_index[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastOutput {
    pub predictions: Vec<f64>,
    pub transformed_index: Vec<SeriesKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedPrediction {
    pub key: SeriesKey,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedRecord {
    pub key: SeriesKey,
    pub features: Vec<Option<f64>>,
    pub actual: f64,
    pub predicted: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedTable {
    pub time_column: String,
    pub target_column: String,
    pub grain_column: Option<String>,
    pub feature_columns: Vec<String>,
    pub rows: Vec<AlignedRecord>,
}

#[derive(Debug, Error)]
pub enum AlignError {
    #[error(
        "forecast returned {predictions} predictions for {index_rows} transformed rows"
    )]
    LengthMismatch {
        predictions: usize,
        index_rows: usize,
    },
    #[error("query has {query_rows} rows but {actuals} actual values were supplied")]
    ActualsLengthMismatch { query_rows: usize, actuals: usize },
    #[error("prediction key {timestamp} (grain {grain:?}) appears more than once")]
    DuplicatePredictionKey {
        timestamp: chrono::NaiveDateTime,
        grain: Option<String>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Tags each prediction with the transformed-table key at the same position.
pub fn pair_predictions(output: &ForecastOutput) -> Result<Vec<KeyedPrediction>, AlignError> {
    if output.predictions.len() != output.transformed_index.len() {
        return Err(AlignError::LengthMismatch {
            predictions: output.predictions.len(),
            index_rows: output.transformed_index.len(),
        });
    }

    Ok(output
        .transformed_index
        .iter()
        .zip(&output.predictions)
        .map(|(key, value)| KeyedPrediction {
            key: key.clone(),
            value: *value,
        })
        .collect())
}

/// Right-joins `predictions` onto `query` (whose targets are `actuals`) and
/// keeps rows where both values are defined, in query order.
pub fn align_outputs(
    predictions: &[KeyedPrediction],
    query: &TimeSeriesTable,
    actuals: &[Option<f64>],
) -> Result<AlignedTable, AlignError> {
    if actuals.len() != query.len() {
        return Err(AlignError::ActualsLengthMismatch {
            query_rows: query.len(),
            actuals: actuals.len(),
        });
    }

    let mut by_key: HashMap<&SeriesKey, f64> = HashMap::with_capacity(predictions.len());
    for prediction in predictions {
        if by_key.insert(&prediction.key, prediction.value).is_some() {
            return Err(AlignError::DuplicatePredictionKey {
                timestamp: prediction.key.timestamp,
                grain: prediction.key.grain.clone(),
            });
        }
    }

    let mut rows = Vec::new();
    let mut matched = 0usize;
    for (record, actual) in query.records.iter().zip(actuals) {
        let predicted = by_key.get(&record.key).copied();
        if predicted.is_some() {
            matched += 1;
        }
        if let (Some(actual), Some(predicted)) = (defined(*actual), defined(predicted)) {
            rows.push(AlignedRecord {
                key: record.key.clone(),
                features: record.features.clone(),
                actual,
                predicted,
            });
        }
    }

    debug!(
        component = "align",
        event = "align.join",
        predictions = predictions.len(),
        query_rows = query.len(),
        matched_rows = matched,
        dropped_predictions = predictions.len().saturating_sub(matched)
    );
    info!(
        component = "align",
        event = "align.finish",
        retained_rows = rows.len(),
        query_rows = query.len()
    );

    Ok(AlignedTable {
        time_column: query.time_column.clone(),
        target_column: query.target_column.clone(),
        grain_column: query.grain_column.clone(),
        feature_columns: query.feature_columns.clone(),
        rows,
    })
}

fn defined(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

impl AlignedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn actuals(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.actual).collect()
    }

    pub fn predictions(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.predicted).collect()
    }

    pub fn header(&self) -> Vec<String> {
        let mut header = vec![self.time_column.clone()];
        if let Some(grain) = &self.grain_column {
            header.push(grain.clone());
        }
        header.extend(self.feature_columns.iter().cloned());
        header.push(self.target_column.clone());
        header.push(PREDICTED_COLUMN.to_string());
        header
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), AlignError> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(self.header())?;

        for row in &self.rows {
            let mut record = vec![row.key.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()];
            if self.grain_column.is_some() {
                record.push(row.key.grain.clone().unwrap_or_default());
            }
            record.extend(
                row.features
                    .iter()
                    .map(|v| v.map(|v| v.to_string()).unwrap_or_default()),
            );
            record.push(row.actual.to_string());
            record.push(row.predicted.to_string());
            writer.write_record(&record)?;
        }

        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TimeSeriesRecord;
    use chrono::{NaiveDate, NaiveDateTime};

    fn hour(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2017, 2, 1)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn query(hours: &[u32]) -> TimeSeriesTable {
        TimeSeriesTable {
            time_column: "timeStamp".to_string(),
            target_column: "demand".to_string(),
            grain_column: None,
            feature_columns: vec!["temp".to_string()],
            records: hours
                .iter()
                .map(|h| TimeSeriesRecord {
                    key: SeriesKey::new(hour(*h)),
                    features: vec![Some(30.0 + *h as f64)],
                    target: None,
                })
                .collect(),
        }
    }

    #[test]
    fn positional_pairing_rejects_length_mismatch() {
        let output = ForecastOutput {
            predictions: vec![1.0, 2.0],
            transformed_index: vec![SeriesKey::new(hour(1))],
        };
        let err = pair_predictions(&output).unwrap_err();
        assert!(matches!(
            err,
            AlignError::LengthMismatch {
                predictions: 2,
                index_rows: 1
            }
        ));
    }

    #[test]
    fn empty_predictions_yield_empty_table() {
        let q = query(&[0, 1]);
        let aligned = align_outputs(&[], &q, &[Some(1.0), Some(2.0)]).unwrap();
        assert!(aligned.is_empty());
        assert_eq!(aligned.feature_columns, vec!["temp"]);
    }

    #[test]
    fn non_finite_values_are_treated_as_missing() {
        let q = query(&[0, 1, 2, 3]);
        let preds = vec![
            KeyedPrediction {
                key: SeriesKey::new(hour(0)),
                value: f64::NAN,
            },
            KeyedPrediction {
                key: SeriesKey::new(hour(1)),
                value: 7.0,
            },
            KeyedPrediction {
                key: SeriesKey::new(hour(2)),
                value: f64::INFINITY,
            },
            KeyedPrediction {
                key: SeriesKey::new(hour(3)),
                value: 8.0,
            },
        ];
        let actuals = [Some(1.0), Some(2.0), Some(3.0), Some(f64::NEG_INFINITY)];
        let aligned = align_outputs(&preds, &q, &actuals).unwrap();
        assert_eq!(aligned.len(), 1);
        assert_eq!(aligned.rows[0].key.timestamp, hour(1));
    }

    #[test]
    fn duplicate_prediction_keys_are_rejected() {
        let q = query(&[0]);
        let preds = vec![
            KeyedPrediction {
                key: SeriesKey::new(hour(0)),
                value: 1.0,
            },
            KeyedPrediction {
                key: SeriesKey::new(hour(0)),
                value: 2.0,
            },
        ];
        let err = align_outputs(&preds, &q, &[Some(1.0)]).unwrap_err();
        assert!(matches!(err, AlignError::DuplicatePredictionKey { .. }));
    }

    #[test]
    fn actuals_must_cover_every_query_row() {
        let q = query(&[0, 1]);
        let err = align_outputs(&[], &q, &[Some(1.0)]).unwrap_err();
        assert!(matches!(
            err,
            AlignError::ActualsLengthMismatch {
                query_rows: 2,
                actuals: 1
            }
        ));
    }

    #[test]
    fn header_includes_grain_features_target_and_predicted() {
        let mut q = query(&[0]);
        q.grain_column = Some("zone".to_string());
        let aligned = align_outputs(&[], &q, &[None]).unwrap();
        assert_eq!(
            aligned.header(),
            vec!["timeStamp", "zone", "temp", "demand", "predicted"]
        );
    }
}
