//! Solver and objective configuration with chainable overrides.

use std::collections::HashMap;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::loss::{DeviationPenalty, MismatchPenalty};

/// First-order update rule used by the calibration solver.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Optimizer {
    /// Gradient descent with classical momentum. A momentum of 0 is plain
    /// gradient descent.
    Momentum { learning_rate: f64, momentum: f64 },
    /// Adam: adaptive per-parameter step sizes.
    Adam {
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
    },
}

impl Optimizer {
    /// Adam with the conventional moment decay rates.
    pub fn adam(learning_rate: f64) -> Self {
        Self::Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    /// The configured base step size.
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Momentum { learning_rate, .. } | Self::Adam { learning_rate, .. } => {
                *learning_rate
            }
        }
    }

    /// Returns a copy with the step size scaled by `factor`.
    pub(crate) fn with_scaled_learning_rate(&self, factor: f64) -> Self {
        let mut scaled = *self;
        match &mut scaled {
            Self::Momentum { learning_rate, .. } | Self::Adam { learning_rate, .. } => {
                *learning_rate *= factor;
            }
        }
        scaled
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::adam(0.05)
    }
}

/// Configuration for one calibration run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationOptions {
    /// Regularization strength λ trading target fit against weight
    /// plausibility.
    pub penalty_lambda: f64,
    /// Penalty shape applied to scaled target residuals.
    pub mismatch_penalty: MismatchPenalty,
    /// Penalty shape applied to weight-to-prior ratios.
    pub deviation_penalty: DeviationPenalty,
    /// Update rule for the log-space weight iterates.
    pub optimizer: Optimizer,
    /// Relative loss-decrease threshold for the sliding-window convergence
    /// test.
    pub convergence_tolerance: f64,
    /// Width of the sliding window, in iterations.
    pub convergence_window: usize,
    /// Iteration cap. Hitting it is reported, not fatal.
    pub max_iterations: usize,
    /// Consecutive loss increases tolerated before a step-size retry.
    pub divergence_patience: usize,
    /// Automatic step-size reductions attempted before declaring divergence.
    pub max_step_retries: usize,
    /// Initial weights to use instead of the prior weights. Must match the
    /// record count and be strictly positive.
    pub warm_start: Option<DVector<f64>>,
    /// Relative-error tolerance for targets that do not set their own.
    pub default_tolerance: f64,
    /// Per-target tolerance overrides, keyed by target identifier. Takes
    /// precedence over both the target's own tolerance and the default.
    pub target_tolerances: HashMap<String, f64>,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            penalty_lambda: 1e-4,
            mismatch_penalty: MismatchPenalty::default(),
            deviation_penalty: DeviationPenalty::default(),
            optimizer: Optimizer::default(),
            convergence_tolerance: 1e-8,
            convergence_window: 10,
            max_iterations: 2_000,
            divergence_patience: 20,
            max_step_retries: 4,
            warm_start: None,
            default_tolerance: 1e-3,
            target_tolerances: HashMap::new(),
        }
    }
}

impl CalibrationOptions {
    /// Overrides the regularization strength while keeping other defaults.
    pub fn with_penalty_lambda(mut self, lambda: f64) -> Self {
        self.penalty_lambda = lambda;
        self
    }

    /// Overrides the optimizer.
    pub fn with_optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Overrides the mismatch penalty shape.
    pub fn with_mismatch_penalty(mut self, penalty: MismatchPenalty) -> Self {
        self.mismatch_penalty = penalty;
        self
    }

    /// Overrides the deviation penalty shape.
    pub fn with_deviation_penalty(mut self, penalty: DeviationPenalty) -> Self {
        self.deviation_penalty = penalty;
        self
    }

    /// Overrides the sliding-window convergence tolerance.
    pub fn with_convergence_tolerance(mut self, tolerance: f64) -> Self {
        self.convergence_tolerance = tolerance;
        self
    }

    /// Overrides the iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Supplies a warm-start weight vector.
    pub fn with_warm_start(mut self, warm_start: DVector<f64>) -> Self {
        self.warm_start = Some(warm_start);
        self
    }

    /// Overrides the default per-target relative-error tolerance.
    pub fn with_default_tolerance(mut self, tolerance: f64) -> Self {
        self.default_tolerance = tolerance;
        self
    }

    /// Adds a per-target tolerance override.
    pub fn with_target_tolerance(mut self, target_id: impl Into<String>, tolerance: f64) -> Self {
        self.target_tolerances.insert(target_id.into(), tolerance);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain_overrides_defaults() {
        let options = CalibrationOptions::default()
            .with_penalty_lambda(0.5)
            .with_optimizer(Optimizer::Momentum {
                learning_rate: 0.01,
                momentum: 0.9,
            })
            .with_max_iterations(100)
            .with_target_tolerance("total_wages", 1e-4);

        assert_eq!(options.penalty_lambda, 0.5);
        assert_eq!(options.optimizer.learning_rate(), 0.01);
        assert_eq!(options.max_iterations, 100);
        assert_eq!(options.target_tolerances["total_wages"], 1e-4);
    }

    #[test]
    fn scaled_learning_rate_halves() {
        let optimizer = Optimizer::adam(0.1).with_scaled_learning_rate(0.5);
        assert_eq!(optimizer.learning_rate(), 0.05);
    }

    #[test]
    fn options_round_trip_through_serde() {
        let options = CalibrationOptions::default().with_penalty_lambda(0.25);
        let json = serde_json::to_string(&options).unwrap();
        let back: CalibrationOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.penalty_lambda, 0.25);
        assert_eq!(back.optimizer, options.optimizer);
    }
}
