//! Target definitions and the ordered registry that fixes their layout.
//!
//! A [`Target`] pairs an administrative aggregate (e.g., total wages, or the
//! number of tax units in an income band) with a per-record contribution
//! function. Contribution functions form a closed set of variant kinds plus a
//! custom escape hatch, which keeps the common cases declarative and the
//! design-matrix build fully data-driven.
//!
//! The [`TargetRegistry`] exists to pin down target *order*: the design
//! matrix's columns, the loss terms, and the diagnostics all index targets by
//! their registration position, so the registry must be frozen before any of
//! those phases begin.

use std::fmt;
use std::sync::Arc;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, Result};
use crate::records::Record;

/// Per-record contribution function of a target.
#[derive(Clone)]
pub enum Contribution {
    /// The value of a single variable.
    Variable(String),
    /// The value of `value` (or 1 when `value` is `None`, counting units)
    /// when `by` falls in the half-open band `[lower, upper)`, else 0.
    Banded {
        by: String,
        lower: f64,
        upper: f64,
        value: Option<String>,
    },
    /// The product of several variables.
    Product(Vec<String>),
    /// Escape hatch for contributions the closed variants cannot express.
    /// Unlike the closed variants, a custom contribution is opaque and cannot
    /// be serialized.
    Custom(Arc<dyn Fn(&Record) -> f64 + Send + Sync>),
}

impl Contribution {
    /// Evaluates the contribution of one record.
    ///
    /// Returns a descriptive reason on failure; the design-matrix builder
    /// wraps it into an error naming the offending target and record.
    pub fn evaluate(&self, record: &Record) -> std::result::Result<f64, String> {
        let lookup = |name: &str| {
            record
                .value(name)
                .ok_or_else(|| format!("record has no variable `{name}`"))
        };

        let contribution = match self {
            Self::Variable(name) => lookup(name)?,
            Self::Banded {
                by,
                lower,
                upper,
                value,
            } => {
                let key = lookup(by)?;
                if key >= *lower && key < *upper {
                    match value {
                        Some(name) => lookup(name)?,
                        None => 1.0,
                    }
                } else {
                    0.0
                }
            }
            Self::Product(names) => {
                let mut product = 1.0;
                for name in names {
                    product *= lookup(name)?;
                }
                product
            }
            Self::Custom(function) => function(record),
        };

        if contribution.is_finite() {
            Ok(contribution)
        } else {
            Err(format!("contribution is non-finite ({contribution})"))
        }
    }
}

/// Serializable mirror of the closed contribution variants. `Custom` has no
/// representation here: serializing it is an error, and nothing deserializes
/// into it.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ContributionRepr {
    Variable(String),
    Banded {
        by: String,
        lower: f64,
        upper: f64,
        value: Option<String>,
    },
    Product(Vec<String>),
}

impl Serialize for Contribution {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let repr = match self {
            Self::Variable(name) => ContributionRepr::Variable(name.clone()),
            Self::Banded {
                by,
                lower,
                upper,
                value,
            } => ContributionRepr::Banded {
                by: by.clone(),
                lower: *lower,
                upper: *upper,
                value: value.clone(),
            },
            Self::Product(names) => ContributionRepr::Product(names.clone()),
            Self::Custom(_) => {
                return Err(serde::ser::Error::custom(
                    "custom contributions cannot be serialized",
                ))
            }
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Contribution {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match ContributionRepr::deserialize(deserializer)? {
            ContributionRepr::Variable(name) => Self::Variable(name),
            ContributionRepr::Banded {
                by,
                lower,
                upper,
                value,
            } => Self::Banded {
                by,
                lower,
                upper,
                value,
            },
            ContributionRepr::Product(names) => Self::Product(names),
        })
    }
}

impl fmt::Debug for Contribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Variable(name) => f.debug_tuple("Variable").field(name).finish(),
            Self::Banded {
                by,
                lower,
                upper,
                value,
            } => f
                .debug_struct("Banded")
                .field("by", by)
                .field("lower", lower)
                .field("upper", upper)
                .field("value", value)
                .finish(),
            Self::Product(names) => f.debug_tuple("Product").field(names).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// One administrative or statistical aggregate the reweighted sample must
/// reproduce.
///
/// Targets built from the closed contribution variants round-trip through
/// serde; a [`Contribution::Custom`] target refuses to serialize.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Target {
    id: String,
    contribution: Contribution,
    value: f64,
    tolerance: Option<f64>,
    importance: f64,
}

impl Target {
    /// Creates a target from an identifier, contribution rule, and aggregate
    /// value. Tolerance and importance start at their defaults.
    pub fn new(id: impl Into<String>, contribution: Contribution, value: f64) -> Self {
        Self {
            id: id.into(),
            contribution,
            value,
            tolerance: None,
            importance: 1.0,
        }
    }

    /// Sets a per-target relative-error tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    /// Sets the importance weight applied to this target's loss term.
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    /// Returns the target identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the contribution rule.
    pub fn contribution(&self) -> &Contribution {
        &self.contribution
    }

    /// Returns the target aggregate value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Returns the per-target tolerance override, if any.
    pub fn tolerance(&self) -> Option<f64> {
        self.tolerance
    }

    /// Returns the importance weight.
    pub fn importance(&self) -> f64 {
        self.importance
    }
}

/// Mutable collection phase of the target lifecycle.
///
/// Targets are registered one by one and then frozen into an ordered,
/// immutable sequence. Freezing is what fixes the column order of the design
/// matrix for the rest of the run.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: Vec<Target>,
    frozen: bool,
}

impl TargetRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a target, preserving registration order.
    pub fn register(&mut self, target: Target) -> Result<()> {
        if self.frozen {
            return Err(CalibrationError::RegistryFrozen {
                id: target.id.clone(),
            });
        }
        if self.targets.iter().any(|t| t.id == target.id) {
            return Err(CalibrationError::DuplicateTarget { id: target.id });
        }
        self.targets.push(target);
        Ok(())
    }

    /// Number of registered targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether no targets have been registered.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Freezes the registry, returning the ordered immutable target sequence.
    /// The registry stays frozen; any later [`register`](Self::register) call
    /// fails with [`CalibrationError::RegistryFrozen`].
    pub fn freeze(&mut self) -> FrozenTargets {
        self.frozen = true;
        FrozenTargets {
            targets: Arc::new(self.targets.clone()),
        }
    }
}

/// Ordered, immutable sequence of targets produced by [`TargetRegistry::freeze`].
#[derive(Clone, Debug)]
pub struct FrozenTargets {
    targets: Arc<Vec<Target>>,
}

impl FrozenTargets {
    /// Number of targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Iterates over targets in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    /// Returns the target at `index` (registration order).
    pub fn target(&self, index: usize) -> &Target {
        &self.targets[index]
    }

    /// Extracts the target aggregate values in registration order.
    pub fn values(&self) -> DVector<f64> {
        DVector::from_iterator(self.targets.len(), self.targets.iter().map(|t| t.value))
    }

    /// Extracts the importance weights in registration order.
    pub fn importances(&self) -> DVector<f64> {
        DVector::from_iterator(self.targets.len(), self.targets.iter().map(|t| t.importance))
    }
}
