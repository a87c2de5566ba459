//! High-level calibration pipeline: records + frozen targets in, calibrated
//! weights and diagnostics out.

use nalgebra::DVector;
use std::sync::atomic::AtomicBool;

use crate::design::DesignMatrix;
use crate::diagnostics::{self, CalibrationDiagnostics};
use crate::error::Result;
use crate::loss::LossModel;
use crate::options::CalibrationOptions;
use crate::records::RecordSet;
use crate::solver::{self, CalibrationState, Termination};
use crate::targets::FrozenTargets;

/// One calibration run: a validated record set, a frozen target sequence, and
/// the design matrix built from them.
///
/// The design matrix is built once at construction and cached; it is the
/// dominant one-time cost and is never mutated afterwards.
#[derive(Clone, Debug)]
pub struct CalibrationProblem {
    records: RecordSet,
    targets: FrozenTargets,
    design: DesignMatrix,
    priors: DVector<f64>,
}

impl CalibrationProblem {
    /// Builds the design matrix and assembles the problem.
    pub fn new(records: RecordSet, targets: FrozenTargets) -> Result<Self> {
        let design = DesignMatrix::build(&records, &targets)?;
        let priors = records.prior_weights();
        Ok(Self {
            records,
            targets,
            design,
            priors,
        })
    }

    /// Accessor for the record set.
    pub fn records(&self) -> &RecordSet {
        &self.records
    }

    /// Accessor for the frozen targets.
    pub fn targets(&self) -> &FrozenTargets {
        &self.targets
    }

    /// Accessor for the cached design matrix.
    pub fn design(&self) -> &DesignMatrix {
        &self.design
    }

    /// Runs the calibration solver and reports diagnostics.
    pub fn calibrate(&self, options: &CalibrationOptions) -> Result<CalibrationResult> {
        self.run(options, None)
    }

    /// Like [`calibrate`](Self::calibrate), but observes a cooperative stop
    /// flag once per iteration boundary.
    pub fn calibrate_with_stop(
        &self,
        options: &CalibrationOptions,
        stop: &AtomicBool,
    ) -> Result<CalibrationResult> {
        self.run(options, Some(stop))
    }

    fn run(&self, options: &CalibrationOptions, stop: Option<&AtomicBool>) -> Result<CalibrationResult> {
        let model = LossModel::new(
            &self.design,
            &self.targets,
            &self.priors,
            options.mismatch_penalty,
            options.deviation_penalty,
            options.penalty_lambda,
        )?;

        let outcome = solver::solve(&model, &self.targets, &self.priors, options, stop)?;

        let tolerances = solver::resolve_tolerances(&self.targets, options);
        let diagnostics = diagnostics::report(
            &outcome.weights,
            &self.design,
            &self.targets,
            &self.priors,
            &tolerances,
        )?;

        Ok(CalibrationResult {
            weights: outcome.weights,
            termination: outcome.termination,
            history: outcome.history,
            state: outcome.state,
            diagnostics,
        })
    }
}

/// Output of a successful calibration run.
#[derive(Clone, Debug)]
pub struct CalibrationResult {
    /// Final weight vector, in linear space, aligned with record order.
    pub weights: DVector<f64>,
    /// How the solver terminated.
    pub termination: Termination,
    /// Loss at every iteration, for auditability.
    pub history: Vec<f64>,
    /// Final solver state.
    pub state: CalibrationState,
    /// Per-target residuals and weight-distribution statistics.
    pub diagnostics: CalibrationDiagnostics,
}
