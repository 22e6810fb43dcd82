//! Request/response types for the remote explainability call.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::JobSubmission;
use crate::dataset::{FeatureRow, TimeSeriesTable};
use crate::service::{FittedPipeline, RunMetadata};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationRequest {
    pub pipeline: FittedPipeline,
    pub metadata: RunMetadata,
    pub feature_names: Vec<String>,
    pub train_features: Vec<FeatureRow>,
    pub test_features: Vec<FeatureRow>,
    pub train_target: Vec<f64>,
}

impl ExplanationRequest {
    pub fn new(
        pipeline: &FittedPipeline,
        metadata: &RunMetadata,
        submission: &JobSubmission,
        test: &TimeSeriesTable,
    ) -> Self {
        Self {
            pipeline: pipeline.clone(),
            metadata: metadata.clone(),
            feature_names: submission.feature_columns.clone(),
            train_features: submission.training_features.clone(),
            test_features: test.feature_rows(),
            train_target: submission.training_target.clone(),
        }
    }
}

/// The explainer's output tuple. Per-class fields are absent for regression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelExplanation {
    pub per_sample_attributions: Vec<Vec<f64>>,
    pub expected_values: Vec<f64>,
    pub overall_importance: Vec<f64>,
    pub feature_names: Vec<String>,
    #[serde(default)]
    pub per_class_summary: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    pub per_class_importance: Option<Vec<Vec<f64>>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExplanationShapeError {
    #[error("{importances} importances for {features} feature names")]
    ImportanceLength { importances: usize, features: usize },
    #[error("attribution row {row} has {found} values, expected {expected}")]
    AttributionWidth {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("class {class} importance has {found} values, expected {expected}")]
    ClassImportanceWidth {
        class: usize,
        found: usize,
        expected: usize,
    },
}

impl ModelExplanation {
    pub fn validate_shape(&self) -> Result<(), ExplanationShapeError> {
        let features = self.feature_names.len();
        if self.overall_importance.len() != features {
            return Err(ExplanationShapeError::ImportanceLength {
                importances: self.overall_importance.len(),
                features,
            });
        }

        for (row, values) in self.per_sample_attributions.iter().enumerate() {
            if values.len() != features {
                return Err(ExplanationShapeError::AttributionWidth {
                    row,
                    found: values.len(),
                    expected: features,
                });
            }
        }

        if let Some(per_class) = &self.per_class_importance {
            for (class, values) in per_class.iter().enumerate() {
                if values.len() != features {
                    return Err(ExplanationShapeError::ClassImportanceWidth {
                        class,
                        found: values.len(),
                        expected: features,
                    });
                }
            }
        }

        Ok(())
    }

    /// Features ordered by descending aggregate importance; NaN entries are skipped.
    pub fn top_features(&self, k: usize) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .feature_names
            .iter()
            .cloned()
            .zip(self.overall_importance.iter().copied())
            .filter(|(_, importance)| !importance.is_nan())
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(k);
        ranked
    }
}
