//! Gradient-based calibration solver.
//!
//! Weights are parameterized internally in log-space, so every iterate is
//! strictly positive by construction; the public weight vector is always
//! reported in linear space. The iteration loop is sequential (each step
//! depends on the previous weights) and is the sole writer of the weight
//! vector and [`CalibrationState`].
//!
//! Termination follows a small state machine: Initialized → Running →
//! {Converged, MaxIterationsReached, Stopped}, with Diverged and Failed as
//! error exits. Hitting the iteration cap is reported, not fatal — the
//! best-loss weights seen so far are still returned, and the diagnostics
//! decide downstream whether the run is acceptable.

use log::{debug, info, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{CalibrationError, Result};
use crate::loss::LossModel;
use crate::options::{CalibrationOptions, Optimizer};
use crate::targets::FrozenTargets;

/// How a successful calibration run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// The convergence test was met: either the relative loss decrease over
    /// the sliding window fell below tolerance, or every target's relative
    /// error is within its own tolerance.
    Converged,
    /// The iteration cap was reached. Best-loss weights are returned.
    MaxIterationsReached,
    /// The cooperative stop flag was observed at an iteration boundary.
    Stopped,
}

/// Snapshot of the solver, updated every iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationState {
    /// Iterations completed.
    pub iteration: usize,
    /// Loss at the snapshot.
    pub loss: f64,
    /// Current weights, in linear space.
    pub weights: DVector<f64>,
    /// Norm of the loss gradient with respect to the linear-space weights.
    pub gradient_norm: f64,
    /// Whether the convergence test has been met.
    pub converged: bool,
}

/// Successful solver output: final weights plus the full convergence history
/// for auditability.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolverOutcome {
    /// Final weight vector, in linear space.
    pub weights: DVector<f64>,
    /// How the run terminated.
    pub termination: Termination,
    /// Loss recorded at every iteration.
    pub history: Vec<f64>,
    /// Final solver state.
    pub state: CalibrationState,
}

/// Per-parameter optimizer state, reset whenever a step-size retry rewinds
/// the iterate.
enum StepState {
    Momentum {
        velocity: DVector<f64>,
    },
    Adam {
        first_moment: DVector<f64>,
        second_moment: DVector<f64>,
        timestep: u32,
    },
}

impl StepState {
    fn fresh(optimizer: &Optimizer, n: usize) -> Self {
        match optimizer {
            Optimizer::Momentum { .. } => Self::Momentum {
                velocity: DVector::zeros(n),
            },
            Optimizer::Adam { .. } => Self::Adam {
                first_moment: DVector::zeros(n),
                second_moment: DVector::zeros(n),
                timestep: 0,
            },
        }
    }

    /// Applies one optimizer step to the log-space iterate.
    fn apply(&mut self, optimizer: &Optimizer, theta: &mut DVector<f64>, gradient: &DVector<f64>) {
        match (self, optimizer) {
            (
                Self::Momentum { velocity },
                Optimizer::Momentum {
                    learning_rate,
                    momentum,
                },
            ) => {
                *velocity = &*velocity * *momentum - gradient * *learning_rate;
                *theta += &*velocity;
            }
            (
                Self::Adam {
                    first_moment,
                    second_moment,
                    timestep,
                },
                Optimizer::Adam {
                    learning_rate,
                    beta1,
                    beta2,
                    epsilon,
                },
            ) => {
                *timestep += 1;
                *first_moment = &*first_moment * *beta1 + gradient * (1.0 - beta1);
                *second_moment =
                    &*second_moment * *beta2 + gradient.component_mul(gradient) * (1.0 - beta2);
                let bias1 = 1.0 - beta1.powi(*timestep as i32);
                let bias2 = 1.0 - beta2.powi(*timestep as i32);
                for i in 0..theta.len() {
                    let m_hat = first_moment[i] / bias1;
                    let v_hat = second_moment[i] / bias2;
                    theta[i] -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
                }
            }
            _ => unreachable!("step state constructed from the same optimizer"),
        }
    }
}

/// Resolves the effective relative-error tolerance of every target:
/// run-level override, then the target's own tolerance, then the default.
pub fn resolve_tolerances(targets: &FrozenTargets, options: &CalibrationOptions) -> DVector<f64> {
    DVector::from_iterator(
        targets.len(),
        targets.iter().map(|target| {
            options
                .target_tolerances
                .get(target.id())
                .copied()
                .or(target.tolerance())
                .unwrap_or(options.default_tolerance)
        }),
    )
}

/// Minimizes the calibration loss, starting from the prior weights or a
/// warm start, optionally observing a cooperative stop flag once per
/// iteration boundary.
pub fn solve(
    model: &LossModel<'_>,
    targets: &FrozenTargets,
    priors: &DVector<f64>,
    options: &CalibrationOptions,
    stop: Option<&AtomicBool>,
) -> Result<SolverOutcome> {
    let n = model.num_records();

    let start = match &options.warm_start {
        Some(warm) => {
            if warm.len() != n {
                return Err(CalibrationError::dimension_mismatch(
                    "warm start length",
                    n,
                    warm.len(),
                ));
            }
            warm.clone()
        }
        None => priors.clone(),
    };
    for (index, &weight) in start.iter().enumerate() {
        if !(weight.is_finite() && weight > 0.0) {
            return Err(CalibrationError::NonPositiveWeight { index, weight });
        }
    }

    let tolerances = resolve_tolerances(targets, options);

    // Log-space iterate; `weights` caches exp(theta) so the very first
    // evaluation sees the starting vector exactly.
    let mut theta = start.map(f64::ln);
    let mut weights = start;

    let mut optimizer = options.optimizer;
    let mut step_state = StepState::fresh(&optimizer, n);

    let mut history: Vec<f64> = Vec::new();
    let mut best_loss = f64::INFINITY;
    let mut best_theta = theta.clone();
    let mut best_weights = weights.clone();
    let mut previous_loss = f64::INFINITY;
    let mut increase_streak = 0usize;
    let mut retries = 0usize;

    let mut state = CalibrationState {
        iteration: 0,
        loss: f64::INFINITY,
        weights: weights.clone(),
        gradient_norm: f64::INFINITY,
        converged: false,
    };

    let mut iteration = 0usize;
    while iteration < options.max_iterations {
        let evaluation = model.evaluate(&weights);

        if !evaluation.value.is_finite() {
            // Divergence: rewind to the best iterate and retry with a smaller
            // step, a bounded number of times.
            if retries < options.max_step_retries {
                retries += 1;
                optimizer = optimizer.with_scaled_learning_rate(0.5);
                warn!(
                    "loss became non-finite at iteration {iteration}; retry {retries} \
                     with learning rate {}",
                    optimizer.learning_rate()
                );
                theta = best_theta.clone();
                weights = best_weights.clone();
                step_state = StepState::fresh(&optimizer, n);
                previous_loss = f64::INFINITY;
                increase_streak = 0;
                iteration += 1;
                continue;
            }
            return Err(CalibrationError::Diverged {
                iterations: iteration,
                retries,
                last_loss: state.loss,
                history,
            });
        }

        let gradient_norm = evaluation.gradient.norm();
        if !gradient_norm.is_finite() {
            return Err(CalibrationError::SolverFailure {
                iteration,
                last_loss: evaluation.value,
                context: "gradient evaluation",
                last_weights: state.weights.clone(),
            });
        }

        history.push(evaluation.value);
        state = CalibrationState {
            iteration,
            loss: evaluation.value,
            weights: weights.clone(),
            gradient_norm,
            converged: false,
        };
        if evaluation.value < best_loss {
            best_loss = evaluation.value;
            best_theta = theta.clone();
            best_weights = weights.clone();
        }
        if iteration % 50 == 0 {
            debug!(
                "iteration {iteration}: loss {:.6e}, gradient norm {:.6e}",
                evaluation.value, gradient_norm
            );
        }

        // Convergence test 1: every target within its own tolerance.
        let targets_met = (0..tolerances.len())
            .all(|j| evaluation.relative_errors[j].abs() <= tolerances[j]);
        if targets_met {
            state.converged = true;
            info!(
                "converged at iteration {iteration}: all {} targets within tolerance",
                tolerances.len()
            );
            return Ok(SolverOutcome {
                weights,
                termination: Termination::Converged,
                history,
                state,
            });
        }

        // Convergence test 2: relative loss decrease over the sliding window.
        if history.len() > options.convergence_window {
            let past = history[history.len() - 1 - options.convergence_window];
            let decrease = past - evaluation.value;
            if decrease >= 0.0 && decrease <= options.convergence_tolerance * past.abs().max(1e-300)
            {
                state.converged = true;
                info!(
                    "converged at iteration {iteration}: loss plateaued at {:.6e}",
                    evaluation.value
                );
                return Ok(SolverOutcome {
                    weights,
                    termination: Termination::Converged,
                    history,
                    state,
                });
            }
        }

        if let Some(flag) = stop {
            if flag.load(Ordering::Relaxed) {
                info!("stop requested at iteration {iteration}");
                return Ok(SolverOutcome {
                    weights: best_weights,
                    termination: Termination::Stopped,
                    history,
                    state,
                });
            }
        }

        // Sustained loss increase counts toward a step-size retry.
        if evaluation.value > previous_loss {
            increase_streak += 1;
        } else {
            increase_streak = 0;
        }
        if increase_streak >= options.divergence_patience {
            if retries < options.max_step_retries {
                retries += 1;
                optimizer = optimizer.with_scaled_learning_rate(0.5);
                warn!(
                    "loss rose for {increase_streak} consecutive iterations; retry {retries} \
                     with learning rate {}",
                    optimizer.learning_rate()
                );
                theta = best_theta.clone();
                weights = best_weights.clone();
                step_state = StepState::fresh(&optimizer, n);
                previous_loss = f64::INFINITY;
                increase_streak = 0;
                iteration += 1;
                continue;
            }
            return Err(CalibrationError::Diverged {
                iterations: iteration,
                retries,
                last_loss: evaluation.value,
                history,
            });
        }
        previous_loss = evaluation.value;

        // Chain rule through w = exp(theta).
        let theta_gradient = evaluation.gradient.component_mul(&weights);
        step_state.apply(&optimizer, &mut theta, &theta_gradient);
        if theta.iter().any(|v| v.is_nan()) {
            return Err(CalibrationError::SolverFailure {
                iteration,
                last_loss: evaluation.value,
                context: "optimizer step",
                last_weights: state.weights.clone(),
            });
        }
        weights = theta.map(f64::exp);

        iteration += 1;
    }

    info!(
        "iteration cap {} reached; best loss {:.6e}",
        options.max_iterations, best_loss
    );
    state.weights = best_weights.clone();
    state.loss = best_loss;
    Ok(SolverOutcome {
        weights: best_weights,
        termination: Termination::MaxIterationsReached,
        history,
        state,
    })
}
