//! Time-varying medium state

use std::sync::Arc;

use stratus_data::{ConfigurationError, FixedOptics, ScalarField, TimeSeries, Velocity};

/// Extinction per time step together with the fixed optics and velocity.
///
/// The extinction fields are owned exclusively; grids and optics are shared.
#[derive(Debug, Clone)]
pub struct MediumState {
    extinction: TimeSeries<ScalarField>,
    optics: Arc<FixedOptics>,
    velocity: Velocity,
}

impl MediumState {
    /// All fields must share one grid shape, since step `k` and `k + 1`
    /// are compared cell by cell after velocity alignment.
    pub fn new(
        extinction: TimeSeries<ScalarField>,
        optics: Arc<FixedOptics>,
        velocity: Velocity,
    ) -> Result<Self, ConfigurationError> {
        if extinction.is_empty() {
            return Err(ConfigurationError::Invalid("medium has no time steps".into()));
        }
        let reference = extinction.values()[0].grid().shape();
        for field in extinction.values() {
            let shape = field.grid().shape();
            if shape != reference {
                return Err(ConfigurationError::ShapeMismatch {
                    expected: reference,
                    actual: shape,
                });
            }
        }
        Ok(Self {
            extinction,
            optics,
            velocity,
        })
    }

    pub fn extinction(&self) -> &TimeSeries<ScalarField> {
        &self.extinction
    }

    pub(crate) fn extinction_mut(&mut self) -> &mut [ScalarField] {
        self.extinction.values_mut()
    }

    pub fn optics(&self) -> &Arc<FixedOptics> {
        &self.optics
    }

    pub fn velocity(&self) -> Velocity {
        self.velocity
    }

    pub fn times(&self) -> &[f64] {
        self.extinction.times()
    }

    pub fn num_steps(&self) -> usize {
        self.extinction.len()
    }

    pub fn field(&self, step: usize) -> &ScalarField {
        &self.extinction.values()[step]
    }
}
