//! Post-calibration reporting: per-target residuals and weight-distribution
//! statistics. Pure functions of the final weights; nothing here mutates the
//! calibration outputs.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::design::DesignMatrix;
use crate::error::{CalibrationError, Result};
use crate::targets::FrozenTargets;

/// Achieved value and errors for one target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetDiagnostics {
    /// Target identifier.
    pub id: String,
    /// The administrative aggregate being matched.
    pub target_value: f64,
    /// Weighted aggregate achieved by the final weights.
    pub achieved: f64,
    /// `achieved − target_value`.
    pub absolute_error: f64,
    /// Absolute error over `|target_value|` (or over 1 for a zero target).
    pub relative_error: f64,
    /// The tolerance this target was judged against.
    pub tolerance: f64,
    /// Whether `|relative_error| <= tolerance`.
    pub within_tolerance: bool,
}

/// Distribution statistics over the final weights and their ratios to the
/// prior weights.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeightSummary {
    /// Smallest final weight.
    pub min: f64,
    /// Largest final weight.
    pub max: f64,
    /// Mean final weight.
    pub mean: f64,
    /// `(probability, quantile)` pairs of the weight-to-prior ratio
    /// distribution.
    pub ratio_percentiles: Vec<(f64, f64)>,
}

/// Full post-run report, consumed by external reporting to accept or reject
/// the calibration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationDiagnostics {
    /// One entry per target, in registry order.
    pub targets: Vec<TargetDiagnostics>,
    /// Aggregate statistics over the weight distribution.
    pub weights: WeightSummary,
}

impl CalibrationDiagnostics {
    /// Whether every target landed within its tolerance.
    pub fn all_within_tolerance(&self) -> bool {
        self.targets.iter().all(|t| t.within_tolerance)
    }
}

const RATIO_PROBABILITIES: [f64; 7] = [0.01, 0.10, 0.25, 0.50, 0.75, 0.90, 0.99];

/// Builds the post-run report from the final weights, the cached design
/// matrix, and the per-target tolerances in registry order.
pub fn report(
    weights: &DVector<f64>,
    design: &DesignMatrix,
    targets: &FrozenTargets,
    priors: &DVector<f64>,
    tolerances: &DVector<f64>,
) -> Result<CalibrationDiagnostics> {
    if weights.len() != design.num_records() {
        return Err(CalibrationError::dimension_mismatch(
            "final weights length",
            design.num_records(),
            weights.len(),
        ));
    }
    if priors.len() != design.num_records() {
        return Err(CalibrationError::dimension_mismatch(
            "prior weights length",
            design.num_records(),
            priors.len(),
        ));
    }
    if tolerances.len() != targets.len() || targets.len() != design.num_targets() {
        return Err(CalibrationError::dimension_mismatch(
            "tolerance count",
            design.num_targets(),
            tolerances.len(),
        ));
    }

    let achieved = design.achieved(weights);
    let target_reports = targets
        .iter()
        .enumerate()
        .map(|(j, target)| {
            let absolute_error = achieved[j] - target.value();
            let scale = if target.value() == 0.0 {
                1.0
            } else {
                target.value().abs()
            };
            let relative_error = absolute_error / scale;
            TargetDiagnostics {
                id: target.id().to_string(),
                target_value: target.value(),
                achieved: achieved[j],
                absolute_error,
                relative_error,
                tolerance: tolerances[j],
                within_tolerance: relative_error.abs() <= tolerances[j],
            }
        })
        .collect();

    Ok(CalibrationDiagnostics {
        targets: target_reports,
        weights: summarize_weights(weights, priors),
    })
}

fn summarize_weights(weights: &DVector<f64>, priors: &DVector<f64>) -> WeightSummary {
    let min = weights.iter().copied().fold(f64::INFINITY, f64::min);
    let max = weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = if weights.is_empty() {
        f64::NAN
    } else {
        weights.iter().sum::<f64>() / weights.len() as f64
    };

    let mut ratios: Vec<f64> = weights
        .iter()
        .zip(priors.iter())
        .map(|(w, p)| w / p)
        .collect();
    ratios.sort_by(|a, b| a.partial_cmp(b).expect("finite ratios"));

    let ratio_percentiles = RATIO_PROBABILITIES
        .iter()
        .map(|&p| (p, quantile(&ratios, p)))
        .collect();

    WeightSummary {
        min,
        max,
        mean,
        ratio_percentiles,
    }
}

/// Linear-interpolation quantile of a sorted sample.
fn quantile(sorted: &[f64], probability: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let position = probability * (sorted.len() - 1) as f64;
    let low = position.floor() as usize;
    let high = position.ceil() as usize;
    if low == high {
        sorted[low]
    } else {
        let fraction = position - low as f64;
        sorted[low] * (1.0 - fraction) + sorted[high] * fraction
    }
}
