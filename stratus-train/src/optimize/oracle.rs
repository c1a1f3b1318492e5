//! Forward/adjoint evaluator seam

use stratus_data::{FixedOptics, ScalarField, TimeSeries, Velocity};

/// Everything the evaluator sees for one time step.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    pub index: usize,
    pub time: f64,
    pub extinction: &'a ScalarField,
    pub optics: &'a FixedOptics,
    pub velocity: Velocity,
}

/// Loss of one step and its gradient with respect to every cell of the
/// step's extinction field.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleOutput {
    pub loss: f64,
    pub gradient: Vec<f64>,
}

/// A failed or unusable evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OracleFault {
    #[error("step {step}: evaluator returned a non-finite loss or gradient")]
    NonFinite { step: usize },
    #[error("step {step}: gradient has {actual} entries, field has {expected}")]
    GradientLength {
        step: usize,
        expected: usize,
        actual: usize,
    },
    #[error("step {step}: evaluator failed: {message}")]
    Solver { step: usize, message: String },
}

/// Opaque forward/adjoint radiative-transfer evaluator.
///
/// Implementations must be callable from several threads at once; steps are
/// evaluated independently.
pub trait ForwardOracle: Sync {
    fn evaluate(&self, step: StepInput<'_>) -> Result<OracleOutput, OracleFault>;
}

impl<T: ForwardOracle + ?Sized> ForwardOracle for &T {
    fn evaluate(&self, step: StepInput<'_>) -> Result<OracleOutput, OracleFault> {
        (**self).evaluate(step)
    }
}

impl<T: ForwardOracle + ?Sized> ForwardOracle for Box<T> {
    fn evaluate(&self, step: StepInput<'_>) -> Result<OracleOutput, OracleFault> {
        (**self).evaluate(step)
    }
}

impl OracleOutput {
    /// Check the output against the step it was computed for.
    pub fn validate(&self, step: usize, cells: usize) -> Result<(), OracleFault> {
        if self.gradient.len() != cells {
            return Err(OracleFault::GradientLength {
                step,
                expected: cells,
                actual: self.gradient.len(),
            });
        }
        if !self.loss.is_finite() || self.gradient.iter().any(|g| !g.is_finite()) {
            return Err(OracleFault::NonFinite { step });
        }
        Ok(())
    }
}

/// Least-squares distance to a reference extinction series,
/// `0.5 * |f - f_ref|^2` per step.
///
/// Stands in for a radiative-transfer solver when validating the pipeline.
#[derive(Debug, Clone)]
pub struct FieldMatchOracle {
    reference: TimeSeries<ScalarField>,
}

impl FieldMatchOracle {
    pub fn new(reference: TimeSeries<ScalarField>) -> Self {
        Self { reference }
    }

    pub fn reference(&self) -> &TimeSeries<ScalarField> {
        &self.reference
    }
}

impl ForwardOracle for FieldMatchOracle {
    fn evaluate(&self, step: StepInput<'_>) -> Result<OracleOutput, OracleFault> {
        let reference = self
            .reference
            .values()
            .get(step.index)
            .ok_or_else(|| OracleFault::Solver {
                step: step.index,
                message: "no reference field for this step".into(),
            })?;
        let field = step.extinction.data();
        if reference.len() != field.len() {
            return Err(OracleFault::Solver {
                step: step.index,
                message: format!("reference has {} cells, field has {}", reference.len(), field.len()),
            });
        }
        let gradient: Vec<f64> = field.iter().zip(reference.data()).map(|(f, r)| f - r).collect();
        let loss = 0.5 * gradient.iter().map(|d| d * d).sum::<f64>();
        Ok(OracleOutput { loss, gradient })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;
    use std::sync::Arc;
    use stratus_data::{Bounds, Grid, PhaseFunction};

    #[test]
    fn test_field_match_loss_and_gradient() {
        let grid = Arc::new(Grid::uniform(DVec3::ZERO, DVec3::ONE, [2, 1, 1]).unwrap());
        let bounds = Bounds::new(0.0, 10.0).unwrap();
        let reference = ScalarField::new(grid.clone(), vec![1.0, 2.0], bounds).unwrap();
        let field = ScalarField::new(grid.clone(), vec![2.0, 4.0], bounds).unwrap();
        let albedo = ScalarField::constant(grid.clone(), 1.0, Bounds::new(0.0, 1.0).unwrap());
        let optics = FixedOptics::new(0.672, albedo, PhaseFunction::isotropic(), None).unwrap();

        let oracle = FieldMatchOracle::new(TimeSeries::new(vec![0.0], vec![reference]).unwrap());
        let output = oracle
            .evaluate(StepInput {
                index: 0,
                time: 0.0,
                extinction: &field,
                optics: &optics,
                velocity: Velocity::ZERO,
            })
            .unwrap();
        assert_eq!(output.gradient, vec![1.0, 2.0]);
        assert_eq!(output.loss, 2.5);
    }

    #[test]
    fn test_output_validation() {
        let ok = OracleOutput {
            loss: 1.0,
            gradient: vec![0.0; 3],
        };
        assert!(ok.validate(0, 3).is_ok());
        assert_eq!(
            ok.validate(2, 4),
            Err(OracleFault::GradientLength {
                step: 2,
                expected: 4,
                actual: 3
            })
        );
        let nan = OracleOutput {
            loss: f64::NAN,
            gradient: vec![0.0; 3],
        };
        assert_eq!(nan.validate(1, 3), Err(OracleFault::NonFinite { step: 1 }));
    }
}
