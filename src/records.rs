//! Household-level record containers and validation utilities used by the
//! calibration engine.

use std::collections::{HashMap, HashSet};

use nalgebra::DVector;

use crate::error::{CalibrationError, Result};

/// One sampled unit (e.g., a tax filing unit) with its prior sampling weight
/// and the variables that target contribution functions read.
#[derive(Clone, Debug)]
pub struct Record {
    id: String,
    prior_weight: f64,
    values: HashMap<String, f64>,
}

impl Record {
    /// Creates a record from an identifier, prior weight, and variable values.
    pub fn new<I, K>(id: impl Into<String>, prior_weight: f64, values: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self {
            id: id.into(),
            prior_weight,
            values: values
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        }
    }

    /// Returns the record identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the prior sampling weight.
    pub fn prior_weight(&self) -> f64 {
        self.prior_weight
    }

    /// Looks up a variable by name, if present.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

/// A validated, immutable collection of records.
///
/// Validation enforces the conditions the calibration loop relies on:
/// identifiers are unique, prior weights are strictly positive and finite,
/// and every variable value is finite. Record order is preserved; the weight
/// vector produced by the solver follows this order exactly.
#[derive(Clone, Debug)]
pub struct RecordSet {
    records: Vec<Record>,
}

impl RecordSet {
    /// Validates and wraps a collection of records.
    pub fn new(records: Vec<Record>) -> Result<Self> {
        let mut seen = HashSet::new();
        for (index, record) in records.iter().enumerate() {
            if !seen.insert(record.id.clone()) {
                return Err(CalibrationError::InvalidRecord {
                    record_id: record.id.clone(),
                    reason: "duplicate record identifier".into(),
                });
            }
            if !(record.prior_weight.is_finite() && record.prior_weight > 0.0) {
                return Err(CalibrationError::NonPositiveWeight {
                    index,
                    weight: record.prior_weight,
                });
            }
            for (name, value) in &record.values {
                if !value.is_finite() {
                    return Err(CalibrationError::InvalidRecord {
                        record_id: record.id.clone(),
                        reason: format!("variable `{name}` is non-finite ({value})"),
                    });
                }
            }
        }
        Ok(Self { records })
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the set contains no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over records in order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Returns the record at `index`.
    pub fn record(&self, index: usize) -> &Record {
        &self.records[index]
    }

    /// Extracts the prior weights as a vector aligned with record order.
    pub fn prior_weights(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.records.len(),
            self.records.iter().map(|r| r.prior_weight),
        )
    }
}
