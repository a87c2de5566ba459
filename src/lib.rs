//! Survey-weight calibration for tax microdata.
//!
//! This crate takes a household-level survey sample with prior sampling
//! weights plus a set of administrative target aggregates (total wages, tax
//! units by income band, ...) and produces a revised weight vector whose
//! weighted sums reproduce the targets as closely as possible while keeping
//! weights plausible: strictly positive and close to their priors. It offers
//! tools to
//!
//! - hold validated household records (`records` module),
//! - declare targets and fix their order (`targets` module),
//! - build the per-record, per-target contribution matrix (`design` module),
//! - evaluate the penalized objective and its autodiff gradient (`loss`
//!   module),
//! - drive the weights to a stationary point with a first-order solver
//!   (`solver` module), and
//! - judge the result target by target (`diagnostics` module).
//!
//! The gradient of the configurable penalty shapes comes from forward-mode
//! automatic differentiation (dual numbers), and weights are iterated in
//! log-space so positivity never needs an explicit constraint.
//!
//! # Quick start
//!
//! ```no_run
//! use calibrs::records::{Record, RecordSet};
//! use calibrs::targets::{Contribution, Target, TargetRegistry};
//! use calibrs::{CalibrationOptions, CalibrationProblem};
//!
//! let records = RecordSet::new(vec![
//!     Record::new("r1", 1350.0, [("wages", 42_000.0), ("agi", 45_500.0)]),
//!     Record::new("r2", 980.0, [("wages", 9_100.0), ("agi", 12_800.0)]),
//! ])
//! .expect("validated records");
//!
//! let mut registry = TargetRegistry::new();
//! registry
//!     .register(Target::new(
//!         "total_wages",
//!         Contribution::Variable("wages".into()),
//!         65_000_000.0,
//!     ))
//!     .expect("fresh identifier");
//! registry
//!     .register(Target::new(
//!         "units_under_50k",
//!         Contribution::Banded {
//!             by: "agi".into(),
//!             lower: 0.0,
//!             upper: 50_000.0,
//!             value: None,
//!         },
//!         2_300.0,
//!     ))
//!     .expect("fresh identifier");
//! let targets = registry.freeze();
//!
//! let problem = CalibrationProblem::new(records, targets).expect("well-formed problem");
//! let result = problem.calibrate(&CalibrationOptions::default()).expect("converged");
//! println!("final weights: {:?}", result.weights);
//! assert!(result.diagnostics.all_within_tolerance());
//! ```

pub mod calibration;
pub mod design;
pub mod diagnostics;
pub mod error;
pub mod loss;
pub mod options;
pub mod records;
pub mod solver;
pub mod targets;

pub use calibration::{CalibrationProblem, CalibrationResult};
pub use diagnostics::{CalibrationDiagnostics, TargetDiagnostics, WeightSummary};
pub use error::{CalibrationError, Result};
pub use loss::{DeviationPenalty, MismatchPenalty};
pub use options::{CalibrationOptions, Optimizer};
pub use solver::{CalibrationState, Termination};
