//! Carve a moving cube from synthetic radiance, then optimise at the truth.

mod common;

use std::sync::Arc;

use stratus_data::{Bounds, MediumGenerator, ScalarField, Velocity};
use stratus_train::ingest::RadianceThreshold;
use stratus_train::optimize::regularization::temporal_smoothness;
use stratus_train::optimize::{
    FieldMatchOracle, ForwardOracle, LocalOptimizer, OptimizerOptions, OptimizerStatus, OracleFault,
    OracleOutput, StepInput,
};
use stratus_train::reconstruction::{CarveConfig, DynamicMediumEstimator, SpaceCarver};

use common::{cube_at, grid, moving_cube_measurements, optics};

/// Zero loss and zero gradient for every field.
struct Silent;

impl ForwardOracle for Silent {
    fn evaluate(&self, step: StepInput<'_>) -> Result<OracleOutput, OracleFault> {
        Ok(OracleOutput {
            loss: 0.0,
            gradient: vec![0.0; step.extinction.len()],
        })
    }
}

fn carve() -> stratus_train::reconstruction::CarveResult {
    let measurements = moving_cube_measurements();
    let masks = measurements.masks(&RadianceThreshold::default()).unwrap();
    SpaceCarver::new(masks)
        .unwrap()
        .carve(&grid(), &CarveConfig::default())
        .unwrap()
}

fn options(regularization: f64) -> OptimizerOptions {
    OptimizerOptions {
        regularization,
        disp: false,
        ..OptimizerOptions::default()
    }
}

#[test]
fn test_carving_recovers_velocity_and_cube() {
    let result = carve();
    assert_eq!(result.velocity, Velocity::new(1.0, 0.0));
    assert!(result.warnings.is_empty());

    for (k, x0) in [(0usize, 0usize), (1, 1)] {
        let step_grid = &result.grids.values()[k];
        let mask = &result.masks.values()[k];
        assert_eq!(mask.count(), 8);
        for i in 0..step_grid.len() {
            let c = step_grid.cell_center(i);
            let expected = cube_at(x0)(c.x.round() as usize, c.y.round() as usize, c.z.round() as usize);
            assert_eq!(mask.get(i), expected, "step {k} cell {i} at {c}");
        }
    }
}

#[test]
fn test_zero_gradient_oracle_converges_immediately() {
    let result = carve();
    let base = Arc::new(grid());
    let generator = MediumGenerator::Homogeneous {
        min: glam::DVec3::ZERO,
        max: glam::DVec3::splat(3.0),
        shape: [4, 4, 4],
        extinction: 5.0,
    };
    let bounds = Bounds::new(1e-3, 2e2).unwrap();
    let field = generator.extinction(&base, bounds).unwrap();
    let initial = DynamicMediumEstimator::replicate(&field, &result.grids).unwrap();
    let estimator = DynamicMediumEstimator::from_carve(&initial, &result, optics(&base), None).unwrap();
    assert_eq!(estimator.dimension(), 16);

    let mut optimizer = LocalOptimizer::new(estimator, Silent, options(0.5)).unwrap();
    let outcome = optimizer.minimize().unwrap();
    assert_eq!(outcome.status, OptimizerStatus::Converged);
    assert!(outcome.converged);
    assert!(outcome.iterations <= 1);

    let fields = optimizer.estimator().state().extinction().values();
    assert_eq!(outcome.loss, 0.5 * temporal_smoothness(fields));
}

#[test]
fn test_reference_oracle_at_truth_converges_immediately() {
    let result = carve();
    let base = Arc::new(grid());
    let bounds = Bounds::new(1e-3, 2e2).unwrap();
    let truth = ScalarField::constant(base.clone(), 5.0, bounds);
    let initial = DynamicMediumEstimator::replicate(&truth, &result.grids).unwrap();
    let estimator = DynamicMediumEstimator::from_carve(&initial, &result, optics(&base), None).unwrap();

    // Reference equals the carved medium: cube at 5, floor elsewhere.
    let oracle = FieldMatchOracle::new(estimator.state().extinction().clone());
    let mut optimizer = LocalOptimizer::new(estimator, oracle, options(0.1)).unwrap();
    let outcome = optimizer.minimize().unwrap();
    assert_eq!(outcome.status, OptimizerStatus::Converged);
    assert!(outcome.iterations <= 1);
    let fields = optimizer.estimator().state().extinction().values();
    assert!((outcome.loss - 0.1 * temporal_smoothness(fields)).abs() < 1e-12);
}
