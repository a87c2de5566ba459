//! Benchmarks for the design-matrix build and the calibration loop.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use calibrs::design::DesignMatrix;
use calibrs::records::{Record, RecordSet};
use calibrs::targets::{Contribution, FrozenTargets, Target, TargetRegistry};
use calibrs::{CalibrationOptions, CalibrationProblem};

fn synthetic_records(count: usize) -> RecordSet {
    let records = (0..count)
        .map(|i| {
            let wages = 5_000.0 + 1_375.0 * (i % 83) as f64;
            let agi = wages * 1.12 + 2_400.0;
            let prior = 400.0 + 17.0 * (i % 97) as f64;
            Record::new(format!("unit{i}"), prior, [("wages", wages), ("agi", agi)])
        })
        .collect();
    RecordSet::new(records).unwrap()
}

fn synthetic_targets(records: &RecordSet, inflation: f64) -> FrozenTargets {
    let total_wages: f64 = records
        .iter()
        .map(|r| r.prior_weight() * r.value("wages").unwrap())
        .sum();
    let units_under_50k: f64 = records
        .iter()
        .filter(|r| r.value("agi").unwrap() < 50_000.0)
        .map(|r| r.prior_weight())
        .sum();

    let mut registry = TargetRegistry::new();
    registry
        .register(Target::new(
            "total_wages",
            Contribution::Variable("wages".into()),
            inflation * total_wages,
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
            inflation * units_under_50k,
        ))
        .unwrap();
    registry.freeze()
}

fn benchmark_design_build(c: &mut Criterion) {
    let records = synthetic_records(5_000);
    let targets = synthetic_targets(&records, 1.0);

    c.bench_function("design_build_5000x2", |b| {
        b.iter(|| DesignMatrix::build(black_box(&records), black_box(&targets)).unwrap())
    });
}

fn benchmark_calibrate(c: &mut Criterion) {
    let records = synthetic_records(500);
    let targets = synthetic_targets(&records, 1.05);
    let problem = CalibrationProblem::new(records, targets).unwrap();
    let options = CalibrationOptions::default()
        .with_penalty_lambda(1e-6)
        .with_max_iterations(200);

    c.bench_function("calibrate_500_records", |b| {
        b.iter(|| problem.calibrate(black_box(&options)).unwrap())
    });
}

criterion_group!(benches, benchmark_design_build, benchmark_calibrate);
criterion_main!(benches);
