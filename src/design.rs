//! Design-matrix construction: per-record, per-target contribution values.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::error::{CalibrationError, Result};
use crate::records::RecordSet;
use crate::targets::FrozenTargets;

/// Cached (num_records × num_targets) contribution matrix plus the target
/// aggregate values, both in registry order.
///
/// Never mutated after construction; a changed record set or target sequence
/// requires a rebuild.
#[derive(Clone, Debug)]
pub struct DesignMatrix {
    matrix: DMatrix<f64>,
    target_values: DVector<f64>,
}

impl DesignMatrix {
    /// Evaluates every target's contribution function against every record.
    ///
    /// Columns are independent, so they are evaluated in parallel and then
    /// assembled in registry order. Fails with
    /// [`CalibrationError::Evaluation`] naming the offending target and
    /// record if a contribution cannot be computed or is non-finite.
    pub fn build(records: &RecordSet, targets: &FrozenTargets) -> Result<Self> {
        let n = records.len();

        let columns: Vec<DVector<f64>> = targets
            .iter()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|target| {
                let mut column = DVector::zeros(n);
                for (i, record) in records.iter().enumerate() {
                    column[i] = target.contribution().evaluate(record).map_err(|reason| {
                        CalibrationError::evaluation(target.id(), record.id(), reason)
                    })?;
                }
                Ok(column)
            })
            .collect::<Result<Vec<_>>>()?;

        let matrix = if columns.is_empty() {
            DMatrix::zeros(n, 0)
        } else {
            DMatrix::from_columns(&columns)
        };

        Ok(Self {
            matrix,
            target_values: targets.values(),
        })
    }

    /// Number of records (matrix rows).
    pub fn num_records(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of targets (matrix columns).
    pub fn num_targets(&self) -> usize {
        self.matrix.ncols()
    }

    /// Returns the contribution matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Returns the target aggregate values, aligned with matrix columns.
    pub fn target_values(&self) -> &DVector<f64> {
        &self.target_values
    }

    /// Weighted aggregates `Mᵀw` achieved by a weight vector.
    pub fn achieved(&self, weights: &DVector<f64>) -> DVector<f64> {
        self.matrix.tr_mul(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Record;
    use crate::targets::{Contribution, Target, TargetRegistry};

    fn records() -> RecordSet {
        RecordSet::new(vec![
            Record::new("r1", 10.0, [("agi", 20_000.0), ("wages", 18_000.0)]),
            Record::new("r2", 20.0, [("agi", 80_000.0), ("wages", 70_000.0)]),
            Record::new("r3", 15.0, [("agi", 40_000.0), ("wages", 0.0)]),
        ])
        .unwrap()
    }

    #[test]
    fn builds_columns_in_registry_order() {
        let mut registry = TargetRegistry::new();
        registry
            .register(Target::new(
                "total_wages",
                Contribution::Variable("wages".into()),
                1_000_000.0,
            ))
            .unwrap();
        registry
            .register(Target::new(
                "units_under_50k",
                Contribution::Banded {
                    by: "agi".into(),
                    lower: 0.0,
                    upper: 50_000.0,
                    value: None,
                },
                30.0,
            ))
            .unwrap();
        let targets = registry.freeze();

        let design = DesignMatrix::build(&records(), &targets).unwrap();
        assert_eq!(design.num_records(), 3);
        assert_eq!(design.num_targets(), 2);

        // Column 0: wages. Column 1: band membership indicator.
        assert_eq!(design.matrix()[(0, 0)], 18_000.0);
        assert_eq!(design.matrix()[(1, 0)], 70_000.0);
        assert_eq!(design.matrix()[(0, 1)], 1.0);
        assert_eq!(design.matrix()[(1, 1)], 0.0);
        assert_eq!(design.matrix()[(2, 1)], 1.0);
        assert_eq!(design.target_values()[1], 30.0);
    }

    #[test]
    fn achieved_matches_weighted_sums() {
        let mut registry = TargetRegistry::new();
        registry
            .register(Target::new(
                "total_wages",
                Contribution::Variable("wages".into()),
                0.0,
            ))
            .unwrap();
        let targets = registry.freeze();
        let records = records();

        let design = DesignMatrix::build(&records, &targets).unwrap();
        let achieved = design.achieved(&records.prior_weights());
        // 10*18000 + 20*70000 + 15*0
        assert_eq!(achieved[0], 1_580_000.0);
    }

    #[test]
    fn missing_variable_names_target_and_record() {
        let mut registry = TargetRegistry::new();
        registry
            .register(Target::new(
                "total_pensions",
                Contribution::Variable("pensions".into()),
                0.0,
            ))
            .unwrap();
        let targets = registry.freeze();

        let result = DesignMatrix::build(&records(), &targets);
        match result {
            Err(CalibrationError::Evaluation {
                target_id,
                record_id,
                ..
            }) => {
                assert_eq!(target_id, "total_pensions");
                assert_eq!(record_id, "r1");
            }
            other => panic!("expected evaluation error, got {other:?}"),
        }
    }

    #[test]
    fn empty_registry_yields_zero_width_matrix() {
        let mut registry = TargetRegistry::new();
        let targets = registry.freeze();
        let design = DesignMatrix::build(&records(), &targets).unwrap();
        assert_eq!(design.num_targets(), 0);
        assert_eq!(design.num_records(), 3);
        assert_eq!(design.achieved(&records().prior_weights()).len(), 0);
    }
}
