//! Forecast error metrics over paired actual/predicted sequences.
//!
//! Every metric skips pairs where either side is NaN or infinite. An empty
//! eligible set yields `None` rather than a NaN or a division by zero.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relative tolerance used by [`is_close`].
pub const CLOSE_RTOL: f64 = 1e-5;
/// Absolute tolerance used by [`is_close`].
pub const CLOSE_ATOL: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastScores {
    /// Pairs where both values are defined.
    pub evaluated_pairs: usize,
    pub rmse: Option<f64>,
    pub mae: Option<f64>,
    pub r2: Option<f64>,
    /// Percentage, e.g. `15.0` for 15 %.
    pub mape: Option<f64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricError {
    #[error("actual has {actual} values but predicted has {predicted}")]
    LengthMismatch { actual: usize, predicted: usize },
}

/// `|a - b| <= CLOSE_ATOL + CLOSE_RTOL * |b|`.
pub fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= CLOSE_ATOL + CLOSE_RTOL * b.abs()
}

/// Mean absolute percentage error, in percent.
///
/// Positions where either value is not finite, or where the actual value is
/// close to zero, are left out of both the sum and the count. Returns `Ok(None)`
/// when no position is eligible.
pub fn mape(actual: &[f64], predicted: &[f64]) -> Result<Option<f64>, MetricError> {
    let ape: Vec<f64> = defined_pairs(actual, predicted)?
        .filter(|(a, _)| !is_close(*a, 0.0))
        .map(|(a, p)| 100.0 * ((a - p) / a).abs())
        .collect();
    Ok(mean(&ape))
}

pub fn mae(actual: &[f64], predicted: &[f64]) -> Result<Option<f64>, MetricError> {
    let abs: Vec<f64> = defined_pairs(actual, predicted)?
        .map(|(a, p)| (a - p).abs())
        .collect();
    Ok(mean(&abs))
}

pub fn rmse(actual: &[f64], predicted: &[f64]) -> Result<Option<f64>, MetricError> {
    let sq: Vec<f64> = defined_pairs(actual, predicted)?
        .map(|(a, p)| (a - p).powi(2))
        .collect();
    Ok(mean(&sq).map(f64::sqrt))
}

/// Coefficient of determination. Undefined for fewer than two pairs or a
/// constant actual series.
pub fn r2_score(actual: &[f64], predicted: &[f64]) -> Result<Option<f64>, MetricError> {
    let pairs: Vec<(f64, f64)> = defined_pairs(actual, predicted)?.collect();
    if pairs.len() < 2 {
        return Ok(None);
    }

    let mean_actual = pairs.iter().map(|(a, _)| a).sum::<f64>() / pairs.len() as f64;
    let ss_tot: f64 = pairs.iter().map(|(a, _)| (a - mean_actual).powi(2)).sum();
    let ss_res: f64 = pairs.iter().map(|(a, p)| (a - p).powi(2)).sum();
    if ss_tot == 0.0 {
        return Ok(None);
    }
    Ok(Some(1.0 - ss_res / ss_tot))
}

pub fn score_forecast(actual: &[f64], predicted: &[f64]) -> Result<ForecastScores, MetricError> {
    Ok(ForecastScores {
        evaluated_pairs: defined_pairs(actual, predicted)?.count(),
        rmse: rmse(actual, predicted)?,
        mae: mae(actual, predicted)?,
        r2: r2_score(actual, predicted)?,
        mape: mape(actual, predicted)?,
    })
}

fn defined_pairs<'a>(
    actual: &'a [f64],
    predicted: &'a [f64],
) -> Result<impl Iterator<Item = (f64, f64)> + 'a, MetricError> {
    if actual.len() != predicted.len() {
        return Err(MetricError::LengthMismatch {
            actual: actual.len(),
            predicted: predicted.len(),
        });
    }

    Ok(actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (*a, *p))
        .filter(|(a, p)| a.is_finite() && p.is_finite()))
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
