use nalgebra::DVector;
use thiserror::Error;

/// Unified error type for `calibrs` operations.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// Raised when a target identifier is registered twice.
    #[error("target `{id}` is already registered")]
    DuplicateTarget { id: String },

    /// Raised when registration is attempted on a frozen registry.
    #[error("cannot register `{id}`: the target registry has been frozen")]
    RegistryFrozen { id: String },

    /// Raised when a contribution function cannot be evaluated for a record.
    #[error("target `{target_id}` failed to evaluate on record `{record_id}`: {reason}")]
    Evaluation {
        /// Identifier of the offending target.
        target_id: String,
        /// Identifier of the offending record.
        record_id: String,
        /// What went wrong (missing variable, non-finite result, ...).
        reason: String,
    },

    /// Raised when a record fails validation (duplicate identifier,
    /// non-finite variable value).
    #[error("invalid record `{record_id}`: {reason}")]
    InvalidRecord { record_id: String, reason: String },

    /// Raised when provided vectors or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, often the model-implied value.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when a prior or warm-start weight is not strictly positive.
    #[error("weight at index {index} must be strictly positive, found {weight}")]
    NonPositiveWeight { index: usize, weight: f64 },

    /// Raised when the solver diverges after exhausting its step-size retries.
    #[error(
        "calibration diverged after {iterations} iterations and {retries} step-size retries; \
         last loss {last_loss}"
    )]
    Diverged {
        /// Number of iterations performed before termination.
        iterations: usize,
        /// Number of automatic step-size reductions attempted.
        retries: usize,
        /// Loss at the final iteration.
        last_loss: f64,
        /// Full loss history for post-mortem diagnosis.
        history: Vec<f64>,
    },

    /// Raised when numeric corruption (non-finite gradient or internal state)
    /// makes further iteration meaningless.
    #[error("solver failed at iteration {iteration} during {context}; last loss {last_loss}")]
    SolverFailure {
        /// Iteration at which the corruption was detected.
        iteration: usize,
        /// Last finite loss value.
        last_loss: f64,
        /// The operation that produced the bad value.
        context: &'static str,
        /// Last valid weight vector, in linear space, for diagnosis.
        last_weights: DVector<f64>,
    },
}

impl CalibrationError {
    /// Helper to format a [`DimensionMismatch`](CalibrationError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for evaluation failures that name the offending target and record.
    pub fn evaluation(
        target_id: impl Into<String>,
        record_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Evaluation {
            target_id: target_id.into(),
            record_id: record_id.into(),
            reason: reason.into(),
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, CalibrationError>;
